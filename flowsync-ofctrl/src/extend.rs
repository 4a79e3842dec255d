use crate::errors::OfError;
use crate::msgs::{OfConn, OfMsg};
use std::collections::{BTreeMap, BTreeSet};

pub type ExtendedId = u32;

/// Two-sided allocation table for switch objects that flows reference by
/// id (groups, meters). The *desired* side is owned by the flow-output
/// nodes; the *existing* side tracks what `put()` has programmed.
/// Reconciliation keeps ids stable: a definition that already exists keeps
/// its id across recomputes.
#[derive(Debug)]
pub struct ExtendTable {
    kind: &'static str,
    desired: BTreeMap<String, ExtendedId>,
    existing: BTreeMap<String, ExtendedId>,
    allocated: BTreeSet<ExtendedId>,
    max_id: ExtendedId,
}

impl ExtendTable {
    pub fn new(kind: &'static str, max_id: ExtendedId) -> Self {
        Self {
            kind,
            desired: BTreeMap::new(),
            existing: BTreeMap::new(),
            allocated: BTreeSet::new(),
            max_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Declares `definition` wanted and returns its stable id. The id of a
    /// definition already programmed on the switch is reused.
    pub fn ensure_desired(&mut self, definition: &str) -> Result<ExtendedId, OfError> {
        if let Some(id) = self.desired.get(definition) {
            return Ok(*id);
        }
        let id = match self.existing.get(definition) {
            Some(id) => *id,
            None => self.alloc()?,
        };
        self.desired.insert(definition.to_string(), id);
        Ok(id)
    }

    pub fn desired_id(&self, definition: &str) -> Option<ExtendedId> {
        self.desired.get(definition).copied()
    }

    pub fn desired_ids(&self) -> impl Iterator<Item = ExtendedId> + '_ {
        self.desired.values().copied()
    }

    pub fn iter_desired(&self) -> impl Iterator<Item = (&str, ExtendedId)> {
        self.desired.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn iter_existing(&self) -> impl Iterator<Item = (&str, ExtendedId)> {
        self.existing.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn remove_desired(&mut self, definition: &str) {
        if let Some(id) = self.desired.remove(definition) {
            // Still allocated while existing; freed at sync time.
            if !self.existing.values().any(|e| *e == id) {
                self.allocated.remove(&id);
            }
        }
    }

    pub fn clear_desired(&mut self) {
        let ids: Vec<_> = self.desired.values().copied().collect();
        self.desired.clear();
        for id in ids {
            if !self.existing.values().any(|e| *e == id) {
                self.allocated.remove(&id);
            }
        }
    }

    /// Programs the switch so that existing equals desired. Returns the
    /// number of messages sent.
    pub fn sync(&mut self, conn: &mut dyn OfConn) -> Result<usize, OfError> {
        let mut sent = 0;
        let mk = |add: bool, id: ExtendedId, definition: String, kind: &'static str| {
            if kind == "group" {
                OfMsg::GroupMod {
                    add,
                    id,
                    definition,
                }
            } else {
                OfMsg::MeterMod {
                    add,
                    id,
                    definition,
                }
            }
        };

        let to_add: Vec<(String, ExtendedId)> = self
            .desired
            .iter()
            .filter(|(def, _)| !self.existing.contains_key(*def))
            .map(|(def, id)| (def.clone(), *id))
            .collect();
        let to_del: Vec<(String, ExtendedId)> = self
            .existing
            .iter()
            .filter(|(def, _)| !self.desired.contains_key(*def))
            .map(|(def, id)| (def.clone(), *id))
            .collect();

        for (def, id) in to_add {
            conn.send(mk(true, id, def.clone(), self.kind))?;
            self.existing.insert(def, id);
            sent += 1;
        }
        for (def, id) in to_del {
            conn.send(mk(false, id, def.clone(), self.kind))?;
            self.existing.remove(&def);
            if !self.desired.values().any(|d| *d == id) {
                self.allocated.remove(&id);
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Drops the existing side, e.g. after an OpenFlow reconnect.
    pub fn forget_existing(&mut self) {
        self.existing.clear();
        self.allocated = self.desired.values().copied().collect();
    }

    fn alloc(&mut self) -> Result<ExtendedId, OfError> {
        // Smallest free id; keeps ids dense and dumps readable.
        let mut candidate = 1;
        for id in &self.allocated {
            if *id > candidate {
                break;
            }
            candidate = id + 1;
        }
        if candidate > self.max_id {
            return Err(OfError::IdsExhausted { kind: self.kind });
        }
        self.allocated.insert(candidate);
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OfError;

    #[derive(Debug, Default)]
    struct RecordingConn {
        sent: Vec<OfMsg>,
    }

    impl OfConn for RecordingConn {
        fn connected(&self) -> bool {
            true
        }
        fn backlog(&self) -> usize {
            0
        }
        fn send(&mut self, msg: OfMsg) -> Result<(), OfError> {
            self.sent.push(msg);
            Ok(())
        }
    }

    #[test]
    fn test_stable_ids_across_recompute() {
        let mut table = ExtendTable::new("group", 100);
        let mut conn = RecordingConn::default();
        let id = table.ensure_desired("select:lb1").unwrap();
        table.sync(&mut conn).unwrap();

        // Recompute: desired is rebuilt from scratch, id must not move.
        table.clear_desired();
        let id2 = table.ensure_desired("select:lb1").unwrap();
        assert_eq!(id, id2);
        assert_eq!(table.sync(&mut conn).unwrap(), 0);
    }

    #[test]
    fn test_sync_adds_and_deletes() {
        let mut table = ExtendTable::new("meter", 100);
        let mut conn = RecordingConn::default();
        table.ensure_desired("rate:100").unwrap();
        assert_eq!(table.sync(&mut conn).unwrap(), 1);
        table.remove_desired("rate:100");
        assert_eq!(table.sync(&mut conn).unwrap(), 1);
        assert!(matches!(conn.sent[1], OfMsg::MeterMod { add: false, .. }));
    }
}
