use flowsync_types::ids::FlowCookie;
use flowsync_types::log::warn;
use flowsync_types::uuid::Uuid;
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};

/// Identity of an OpenFlow rule on the switch. Two rules with the same
/// table, priority and match are the same rule; actions and cookie are the
/// mutable part.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub table: u8,
    pub priority: u16,
    /// Match expression in the translator's wire form. Opaque here: the
    /// logical-to-OpenFlow translation is a collaborator.
    pub match_: String,
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table={} priority={} match=({})",
            self.table, self.priority, self.match_
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DesiredFlow {
    pub actions: String,
    pub cookie: FlowCookie,
    /// UUID of the logical-flow row this rule was translated from. The
    /// cookie is derived from it; retraction goes through it.
    pub origin: Uuid,
}

/// The rule set this engine wants installed, keyed for O(1) retraction by
/// originating logical-flow UUID.
#[derive(Debug, Default)]
pub struct DesiredFlowTable {
    flows: HashMap<FlowKey, DesiredFlow>,
    by_origin: HashMap<Uuid, HashSet<FlowKey>>,
}

impl DesiredFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, key: &FlowKey) -> Option<&DesiredFlow> {
        self.flows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &DesiredFlow)> {
        self.flows.iter()
    }

    pub fn origins(&self) -> impl Iterator<Item = &Uuid> {
        self.by_origin.keys()
    }

    pub fn origin_flows(&self, origin: &Uuid) -> impl Iterator<Item = &FlowKey> {
        self.by_origin.get(origin).into_iter().flatten()
    }

    /// Adds one translated rule. A key collision between different logical
    /// flows keeps the newcomer; the loser's provenance entry is dropped so
    /// no cookie dangles.
    pub fn add(&mut self, origin: Uuid, key: FlowKey, actions: String) -> bool {
        let flow = DesiredFlow {
            actions,
            cookie: FlowCookie::from_uuid(&origin),
            origin,
        };
        match self.flows.insert(key.clone(), flow) {
            Some(prev) if prev.origin != origin => {
                warn!("duplicate flow for {key}, dropping rule from {}", prev.origin);
                self.unlink(&prev.origin, &key);
                self.by_origin.entry(origin).or_default().insert(key);
                true
            }
            Some(prev) => {
                // Same origin re-adding the same key: changed iff actions
                // differ.
                self.by_origin.entry(origin).or_default().insert(key.clone());
                prev != *self.flows.get(&key).unwrap()
            }
            None => {
                self.by_origin.entry(origin).or_default().insert(key);
                true
            }
        }
    }

    /// Withdraws every rule translated from `origin`. Returns whether
    /// anything was removed.
    pub fn retract(&mut self, origin: &Uuid) -> bool {
        let Some(keys) = self.by_origin.remove(origin) else {
            return false;
        };
        let mut removed = false;
        for key in keys {
            // The key may have been taken over by another origin since.
            if self.flows.get(&key).is_some_and(|f| f.origin == *origin) {
                self.flows.remove(&key);
                removed = true;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.flows.clear();
        self.by_origin.clear();
    }

    fn unlink(&mut self, origin: &Uuid, key: &FlowKey) {
        if let Some(set) = self.by_origin.get_mut(origin) {
            set.remove(key);
            if set.is_empty() {
                self.by_origin.remove(origin);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstalledFlow {
    pub actions: String,
    pub cookie: FlowCookie,
}

/// What we believe the switch currently has installed. Mutated only by
/// `put()` as it emits flow modifications.
#[derive(Debug, Default)]
pub struct InstalledFlowTable {
    flows: HashMap<FlowKey, InstalledFlow>,
}

impl InstalledFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn get(&self, key: &FlowKey) -> Option<&InstalledFlow> {
        self.flows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &InstalledFlow)> {
        self.flows.iter()
    }

    pub(crate) fn insert(&mut self, key: FlowKey, flow: InstalledFlow) {
        self.flows.insert(key, flow);
    }

    pub(crate) fn remove(&mut self, key: &FlowKey) {
        self.flows.remove(key);
    }

    /// Forgets everything, e.g. after an OpenFlow reconnect: the switch
    /// starts from a clean table and so do we.
    pub fn clear(&mut self) {
        self.flows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(table: u8, m: &str) -> FlowKey {
        FlowKey {
            table,
            priority: 100,
            match_: m.to_string(),
        }
    }

    #[test]
    fn test_retract_by_origin() {
        let mut table = DesiredFlowTable::new();
        let lflow1 = Uuid::new_v4();
        let lflow2 = Uuid::new_v4();
        table.add(lflow1, key(0, "ip"), "drop".into());
        table.add(lflow1, key(1, "ip"), "next".into());
        table.add(lflow2, key(2, "arp"), "next".into());

        assert!(table.retract(&lflow1));
        assert_eq!(table.len(), 1);
        assert!(table.get(&key(2, "arp")).is_some());
        assert!(!table.retract(&lflow1));
    }

    #[test]
    fn test_no_dangling_cookie_after_collision() {
        let mut table = DesiredFlowTable::new();
        let loser = Uuid::new_v4();
        let winner = Uuid::new_v4();
        table.add(loser, key(0, "ip"), "drop".into());
        table.add(winner, key(0, "ip"), "next".into());

        // Retraction of the displaced origin must not remove the winner's
        // rule, and every remaining origin maps to a live rule.
        assert!(!table.retract(&loser));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&key(0, "ip")).unwrap().origin, winner);
        for origin in table.origins() {
            assert!(table
                .origin_flows(origin)
                .all(|k| table.get(k).map(|f| f.origin) == Some(*origin)));
        }
    }
}
