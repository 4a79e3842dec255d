//! Integration-bridge setup: creates the bridge on absence and keeps the
//! columns that must not drift (fail-mode, in-band, stable hardware
//! address, the shared prefix-match flow-table row).

use crate::config::Config;
use crate::tables::{index, ovs};
use flowsync_db::{Datum, IndexKey, Row, Table, Txn};
use flowsync_types::log::info;
use flowsync_types::serde_json::{json, Map};
use flowsync_types::uuid::Uuid;
use rand::Rng;

/// Prefix-match columns configured on every table index of the bridge.
const FLOW_TABLE_PREFIXES: [&str; 4] = ["ip_src", "ip_dst", "ipv6_src", "ipv6_dst"];

/// A locally administered, unicast MAC. Stored in `other_config:hwaddr` so
/// later port additions do not move the datapath id.
fn random_hwaddr<R: Rng>(rng: &mut R) -> String {
    let tail: [u8; 5] = rng.gen();
    format!(
        "0e:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3], tail[4]
    )
}

/// Appends to `txn` whatever the integration bridge is missing. Returns
/// true when mutations were added. `startup_ts_ms` is recorded in the
/// bridge external-ids the first time the bridge is created.
pub fn ensure_integration_bridge(
    bridge_table: &Table,
    config: &Config,
    startup_ts_ms: i64,
    txn: &mut Txn,
) -> Result<bool, flowsync_db::DbError> {
    let existing = bridge_table.row_by_index(
        index::BY_NAME,
        &IndexKey::str(config.bridge_name.clone()),
    )?;

    if let Some(bridge) = existing {
        let mut changed = false;
        if bridge.smap_get("other_config", "hwaddr").is_none() {
            let hwaddr = random_hwaddr(&mut rand::thread_rng());
            txn.set_key(ovs::BRIDGE, bridge.uuid(), "other_config", "hwaddr", hwaddr);
            changed = true;
        }
        if bridge.smap_get("other_config", "disable-in-band") != Some("true") {
            txn.set_key(
                ovs::BRIDGE,
                bridge.uuid(),
                "other_config",
                "disable-in-band",
                "true",
            );
            changed = true;
        }
        if bridge.str("fail_mode") != Some("secure") {
            txn.update_column(ovs::BRIDGE, bridge.uuid(), "fail_mode", "secure");
            changed = true;
        }
        return Ok(changed);
    }

    info!("creating integration bridge {}", config.bridge_name);
    let flow_table_uuid = Uuid::new_v4();
    let prefixes: Vec<Datum> = FLOW_TABLE_PREFIXES
        .iter()
        .map(|p| Datum::String(p.to_string()))
        .collect();
    txn.insert(
        ovs::FLOW_TABLE,
        Row::new(flow_table_uuid).with("prefixes", Datum::Array(prefixes)),
    );

    // One shared flow-table row referenced by every table index.
    let mut flow_tables = Map::new();
    for table_id in 0u16..=254 {
        flow_tables.insert(
            table_id.to_string(),
            Datum::String(flow_table_uuid.to_string()),
        );
    }

    let bridge_uuid = Uuid::new_v4();
    let hwaddr = random_hwaddr(&mut rand::thread_rng());
    txn.insert(
        ovs::BRIDGE,
        Row::new(bridge_uuid)
            .with("name", config.bridge_name.clone())
            .with("fail_mode", "secure")
            .with("datapath_type", config.datapath_type.clone())
            .with(
                "other_config",
                json!({"disable-in-band": "true", "hwaddr": hwaddr}),
            )
            .with(
                "external_ids",
                json!({"ovn-startup-ts": startup_ts_ms.to_string()}),
            )
            .with("flow_tables", Datum::Object(flow_tables)),
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;
    use flowsync_db::TxnOp;

    fn bridge_table() -> Table {
        let mut table = Table::new(ovs::BRIDGE);
        tables::register_indexes(&mut table);
        table
    }

    #[test]
    fn test_creates_bridge_and_shared_flow_table() {
        let table = bridge_table();
        let config = Config::default();
        let mut txn = Txn::new();
        assert!(ensure_integration_bridge(&table, &config, 1_700_000, &mut txn).unwrap());

        let mut bridge_row = None;
        let mut flow_table_row = None;
        for op in txn.ops() {
            if let TxnOp::Insert { table, row } = op {
                match table.as_str() {
                    ovs::BRIDGE => bridge_row = Some(row.clone()),
                    ovs::FLOW_TABLE => flow_table_row = Some(row.clone()),
                    _ => {}
                }
            }
        }
        let bridge = bridge_row.expect("bridge inserted");
        let ft = flow_table_row.expect("flow table inserted");
        assert_eq!(bridge.str("fail_mode"), Some("secure"));
        assert_eq!(bridge.smap_get("other_config", "disable-in-band"), Some("true"));
        assert!(bridge.smap_get("other_config", "hwaddr").is_some());

        // All 255 table indexes reference the single shared row.
        let refs: Vec<_> = bridge.map_iter("flow_tables").collect();
        assert_eq!(refs.len(), 255);
        assert!(refs
            .iter()
            .all(|(_, v)| v.as_str() == Some(&ft.uuid().to_string())));
    }

    #[test]
    fn test_existing_bridge_only_backfills() {
        let mut table = bridge_table();
        table
            .apply_insert(
                Row::new(Uuid::new_v4())
                    .with("name", "br-int")
                    .with("fail_mode", "secure")
                    .with(
                        "other_config",
                        json!({"disable-in-band": "true", "hwaddr": "0e:00:00:00:00:01"}),
                    ),
            )
            .unwrap();
        let mut txn = Txn::new();
        let changed =
            ensure_integration_bridge(&table, &Config::default(), 0, &mut txn).unwrap();
        assert!(!changed);
        assert!(txn.is_empty());
    }
}
