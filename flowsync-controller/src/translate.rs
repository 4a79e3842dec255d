//! Logical-to-OpenFlow translation. The daemon consumes this as an opaque
//! routine with well-defined inputs and outputs: a logical expression plus
//! its resolved references in, finished rule bodies out. The pipeline
//! layout mirrors the northbound compiler's table numbering.

use crate::addr_sets::AddrSets;
use crate::lflow_cache::CachedFlow;
use crate::port_groups::PortGroups;
use crate::template_vars::TemplateVars;
use flowsync_db::Row;
use flowsync_types::uuid::Uuid;
use std::collections::BTreeSet;

/// First OpenFlow table of the ingress logical pipeline.
pub const INGRESS_BASE_TABLE: u8 = 8;
/// First OpenFlow table of the egress logical pipeline.
pub const EGRESS_BASE_TABLE: u8 = 40;
/// Table holding load-balancer VIP selection rules.
pub const LB_TABLE: u8 = 12;
/// Table holding resolved MAC-binding lookups.
pub const MAC_LOOKUP_TABLE: u8 = 66;
/// Table holding learned FDB entries.
pub const FDB_TABLE: u8 = 71;
/// Table holding multicast output sets.
pub const MULTICAST_TABLE: u8 = 33;
/// Table holding EVPN remote-MAC output rules.
pub const EVPN_TABLE: u8 = 70;

#[derive(Debug, Default)]
pub struct Translation {
    pub flows: Vec<CachedFlow>,
    /// Resource keys consumed (`as:` address set, `pg:` port group,
    /// `tv:` template variable), for the dependency manager.
    pub refs: Vec<String>,
}

/// Resolves `$set`, `@group` and `${var}` references in one expression,
/// collecting the resources consumed.
fn expand(
    raw: &str,
    addr_sets: &AddrSets,
    port_groups: &PortGroups,
    template_vars: &TemplateVars,
    refs: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let name: String = take_ident(&mut chars, Some('}'));
                refs.insert(format!("tv:{name}"));
                match template_vars.get(&name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&format!("${{{name}}}")),
                }
            }
            '$' => {
                let name: String = take_ident(&mut chars, None);
                refs.insert(format!("as:{name}"));
                let members = addr_sets
                    .get(&name)
                    .map(|set| set.iter().cloned().collect::<Vec<_>>())
                    .unwrap_or_default();
                out.push_str(&braced(&members));
            }
            '@' => {
                let name: String = take_ident(&mut chars, None);
                refs.insert(format!("pg:{name}"));
                let members = port_groups
                    .get(&name)
                    .map(|set| set.iter().cloned().collect::<Vec<_>>())
                    .unwrap_or_default();
                out.push_str(&braced(&members));
            }
            c => out.push(c),
        }
    }
    out
}

fn take_ident(chars: &mut std::iter::Peekable<std::str::Chars>, until: Option<char>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if let Some(stop) = until {
            chars.next();
            if c == stop {
                break;
            }
            name.push(c);
        } else if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    name
}

fn braced(members: &[String]) -> String {
    let mut out = String::from("{");
    for (i, member) in members.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(member);
    }
    out.push('}');
    out
}

/// Translates one logical-flow row for one datapath instantiation.
pub fn translate_lflow(
    row: &Row,
    dp_tunnel_key: i64,
    addr_sets: &AddrSets,
    port_groups: &PortGroups,
    template_vars: &TemplateVars,
) -> Translation {
    let mut refs = BTreeSet::new();
    let base = if row.str("pipeline") == Some("egress") {
        EGRESS_BASE_TABLE
    } else {
        INGRESS_BASE_TABLE
    };
    let table = base.saturating_add(row.integer("table_id").unwrap_or(0) as u8);
    let priority = row.integer("priority").unwrap_or(0) as u16;

    let raw_match = row.str("match").unwrap_or("1");
    let raw_actions = row.str("actions").unwrap_or("drop;");
    let match_ = expand(raw_match, addr_sets, port_groups, template_vars, &mut refs);
    let actions = expand(raw_actions, addr_sets, port_groups, template_vars, &mut refs);

    let match_ = if match_ == "1" {
        format!("metadata == {dp_tunnel_key}")
    } else {
        format!("metadata == {dp_tunnel_key} && {match_}")
    };

    Translation {
        flows: vec![CachedFlow {
            table,
            priority,
            match_,
            actions,
        }],
        refs: refs.into_iter().collect(),
    }
}

/// Reference names appearing in one expression, without expanding it.
fn scan_refs(raw: &str, out: &mut Vec<(char, String)>) {
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push(('v', take_ident(&mut chars, Some('}'))));
            }
            '$' => out.push(('s', take_ident(&mut chars, None))),
            '@' => out.push(('g', take_ident(&mut chars, None))),
            _ => {}
        }
    }
}

/// Cache key of a translated (logical flow, datapath) pair: a fingerprint
/// of the expression *and* the current values of everything it resolves
/// against. A change to the row or to a referenced set produces a
/// different key, so stale entries can never be served; they age out via
/// the trim policy instead.
pub fn lflow_cache_key(
    row: &Row,
    dp_tunnel_key: i64,
    addr_sets: &AddrSets,
    port_groups: &PortGroups,
    template_vars: &TemplateVars,
) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let raw_match = row.str("match").unwrap_or("1");
    let raw_actions = row.str("actions").unwrap_or("drop;");
    let mut hasher = DefaultHasher::new();
    dp_tunnel_key.hash(&mut hasher);
    row.str("pipeline").hash(&mut hasher);
    row.integer("table_id").hash(&mut hasher);
    row.integer("priority").hash(&mut hasher);
    raw_match.hash(&mut hasher);
    raw_actions.hash(&mut hasher);

    let mut refs = Vec::new();
    scan_refs(raw_match, &mut refs);
    scan_refs(raw_actions, &mut refs);
    refs.sort();
    refs.dedup();
    for (kind, name) in &refs {
        kind.hash(&mut hasher);
        name.hash(&mut hasher);
        match kind {
            's' => addr_sets.get(name).hash(&mut hasher),
            'g' => port_groups.get(name).hash(&mut hasher),
            _ => template_vars.get(name).hash(&mut hasher),
        }
    }
    format!("{}@{:016x}", row.uuid(), hasher.finish())
}

/// Translates one load-balancer VIP for one datapath. The select-group
/// definition is returned so the caller can allocate a stable id in the
/// group extend table and splice it into the action.
pub fn translate_lb_vip(
    protocol: &str,
    vip: &str,
    backends: &[String],
    dp_tunnel_key: i64,
) -> (String, CachedFlow) {
    let group_def = format!("type=select,{protocol},members={}", backends.join("|"));
    let flow = CachedFlow {
        table: LB_TABLE,
        priority: 120,
        match_: format!("metadata == {dp_tunnel_key} && ip4.dst == {vip}"),
        // The caller replaces <gid> once the id is allocated.
        actions: "group:<gid>;".to_string(),
    };
    (group_def, flow)
}

/// Translates one resolved MAC binding into its lookup rule.
pub fn translate_mac_binding(
    lport: &str,
    ip: &str,
    mac: &str,
    dp_tunnel_key: i64,
) -> CachedFlow {
    CachedFlow {
        table: MAC_LOOKUP_TABLE,
        priority: 100,
        match_: format!("metadata == {dp_tunnel_key} && outport == \"{lport}\" && reg0 == {ip}"),
        actions: format!("eth.dst = {mac}; next;"),
    }
}

/// Translates one FDB entry.
pub fn translate_fdb(dp_key: i64, mac: &str, port_key: i64) -> CachedFlow {
    CachedFlow {
        table: FDB_TABLE,
        priority: 100,
        match_: format!("metadata == {dp_key} && eth.dst == {mac}"),
        actions: format!("outport = {port_key}; next;"),
    }
}

/// Translates one multicast group into its fan-out rule.
pub fn translate_multicast_group(row: &Row, dp_tunnel_key: i64) -> Option<CachedFlow> {
    let tunnel_key = row.integer("tunnel_key")?;
    let ports = row.str_set("ports").join(", ");
    Some(CachedFlow {
        table: MULTICAST_TABLE,
        priority: 100,
        match_: format!("metadata == {dp_tunnel_key} && reg15 == {tunnel_key}"),
        actions: format!("fanout({ports});"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_types::serde_json::json;

    fn row(match_: &str, actions: &str) -> Row {
        Row::new(Uuid::new_v4())
            .with("table_id", 3)
            .with("priority", 200)
            .with("pipeline", "ingress")
            .with("match", match_)
            .with("actions", actions)
    }

    #[test]
    fn test_address_set_expansion_records_ref() {
        let sets = AddrSets::default();
        let groups = PortGroups::default();
        let vars = TemplateVars::default();
        // A reference to a set that has not arrived yet still records the
        // dependency, so the flow is republished when the set shows up.
        let t = translate_lflow(&row("ip4.src == $internal", "next;"), 5, &sets, &groups, &vars);
        assert!(t.refs.contains(&"as:internal".to_string()));
        assert_eq!(t.flows[0].match_, "metadata == 5 && ip4.src == {}");
        assert_eq!(t.flows[0].table, INGRESS_BASE_TABLE + 3);
        assert_eq!(t.flows[0].priority, 200);
    }

    #[test]
    fn test_template_var_expansion() {
        let vars = TemplateVars::default();
        let t = translate_lflow(
            &row("tcp.dst == ${port}", "next;"),
            7,
            &AddrSets::default(),
            &PortGroups::default(),
            &vars,
        );
        // Unknown variables stay verbatim but are still tracked.
        assert!(t.refs.contains(&"tv:port".to_string()));
        assert_eq!(t.flows[0].match_, "metadata == 7 && tcp.dst == ${port}");
    }

    #[test]
    fn test_true_match_collapses_to_metadata() {
        let t = translate_lflow(
            &row("1", "drop;"),
            9,
            &AddrSets::default(),
            &PortGroups::default(),
            &TemplateVars::default(),
        );
        assert_eq!(t.flows[0].match_, "metadata == 9");
    }

    #[test]
    fn test_multicast_group() {
        let mg = Row::new(Uuid::new_v4())
            .with("tunnel_key", 32768)
            .with("ports", json!(["lp1", "lp2"]));
        let flow = translate_multicast_group(&mg, 5).unwrap();
        assert_eq!(flow.match_, "metadata == 5 && reg15 == 32768");
        assert_eq!(flow.actions, "fanout(lp1, lp2);");
    }
}
