//! Daemon configuration, read from the `external_ids` map of the
//! open-vswitch row on every iteration. A key suffixed with the chassis
//! name (`ovn-encap-ip-hv1`) overrides the plain key for that chassis.

use flowsync_db::Row;
use std::path::Path;

pub const DEFAULT_BRIDGE_NAME: &str = "br-int";
pub const DEFAULT_DATAPATH_TYPE: &str = "system";
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 60_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LflowCacheConfig {
    pub enabled: bool,
    pub limit_entries: usize,
    pub limit_kb: usize,
    pub trim_limit: usize,
    pub trim_wmark_perc: u32,
    pub trim_timeout_ms: u64,
}

impl Default for LflowCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit_entries: 200_000,
            limit_kb: 1_048_576,
            trim_limit: 10_000,
            trim_wmark_perc: 50,
            trim_timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub remote: Option<String>,
    pub probe_interval_ms: u64,
    pub monitor_all: bool,
    pub bridge_name: String,
    pub datapath_type: String,
    pub bridge_remote: Option<String>,
    pub bridge_remote_probe_interval_ms: Option<u64>,
    pub encap_type: String,
    /// Tunnel endpoint IPs; index 0 is the default encap.
    pub encap_ips: Vec<String>,
    pub transport_zones: Vec<String>,
    pub lflow_cache: LflowCacheConfig,
    pub cleanup_on_exit: bool,
    pub match_northd_version: bool,
    /// Logical port name -> host interface for dynamic route learning.
    pub routing_port_mapping: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: None,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            monitor_all: false,
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            datapath_type: DEFAULT_DATAPATH_TYPE.to_string(),
            bridge_remote: None,
            bridge_remote_probe_interval_ms: None,
            encap_type: "geneve".to_string(),
            encap_ips: Vec::new(),
            transport_zones: Vec::new(),
            lflow_cache: LflowCacheConfig::default(),
            cleanup_on_exit: true,
            match_northd_version: false,
            routing_port_mapping: Vec::new(),
        }
    }
}

fn get<'a>(row: &'a Row, key: &str, chassis: &str) -> Option<&'a str> {
    let override_key = format!("{key}-{chassis}");
    row.smap_get("external_ids", &override_key)
        .or_else(|| row.smap_get("external_ids", key))
}

fn get_bool(row: &Row, key: &str, chassis: &str, default: bool) -> bool {
    get(row, key, chassis)
        .map(|v| v == "true")
        .unwrap_or(default)
}

fn get_num<T: std::str::FromStr>(row: &Row, key: &str, chassis: &str) -> Option<T> {
    get(row, key, chassis).and_then(|v| v.parse().ok())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Parses the recognized keys from the open-vswitch row. Unrecognized
    /// keys are ignored; other daemons share the same map.
    pub fn from_open_vswitch(row: &Row, chassis: &str) -> Self {
        let defaults = LflowCacheConfig::default();
        let mut encap_ips: Vec<String> = get(row, "ovn-encap-ip", chassis)
            .map(split_csv)
            .unwrap_or_default();
        if let Some(default_ip) = get(row, "ovn-encap-ip-default", chassis) {
            let default_ip = default_ip.to_string();
            encap_ips.retain(|ip| *ip != default_ip);
            encap_ips.insert(0, default_ip);
        }

        Self {
            remote: get(row, "ovn-remote", chassis).map(str::to_string),
            probe_interval_ms: get_num(row, "ovn-remote-probe-interval", chassis)
                .unwrap_or(DEFAULT_PROBE_INTERVAL_MS),
            monitor_all: get_bool(row, "ovn-monitor-all", chassis, false),
            bridge_name: get(row, "ovn-bridge", chassis)
                .unwrap_or(DEFAULT_BRIDGE_NAME)
                .to_string(),
            datapath_type: get(row, "ovn-bridge-datapath-type", chassis)
                .unwrap_or(DEFAULT_DATAPATH_TYPE)
                .to_string(),
            bridge_remote: get(row, "ovn-bridge-remote", chassis).map(str::to_string),
            bridge_remote_probe_interval_ms: get_num(
                row,
                "ovn-bridge-remote-probe-interval",
                chassis,
            ),
            encap_type: get(row, "ovn-encap-type", chassis)
                .unwrap_or("geneve")
                .to_string(),
            encap_ips,
            transport_zones: get(row, "ovn-transport-zones", chassis)
                .map(split_csv)
                .unwrap_or_default(),
            lflow_cache: LflowCacheConfig {
                enabled: get_bool(row, "ovn-enable-lflow-cache", chassis, defaults.enabled),
                limit_entries: get_num(row, "ovn-limit-lflow-cache", chassis)
                    .unwrap_or(defaults.limit_entries),
                limit_kb: get_num(row, "ovn-memlimit-lflow-cache-kb", chassis)
                    .unwrap_or(defaults.limit_kb),
                trim_limit: get_num(row, "ovn-trim-limit-lflow-cache", chassis)
                    .unwrap_or(defaults.trim_limit),
                trim_wmark_perc: get_num(row, "ovn-trim-wmark-perc-lflow-cache", chassis)
                    .unwrap_or(defaults.trim_wmark_perc),
                trim_timeout_ms: get_num(row, "ovn-trim-timeout-ms", chassis)
                    .unwrap_or(defaults.trim_timeout_ms),
            },
            cleanup_on_exit: get_bool(row, "ovn-cleanup-on-exit", chassis, true),
            match_northd_version: get_bool(row, "ovn-match-northd-version", chassis, false),
            routing_port_mapping: get(row, "dynamic-routing-port-mapping", chassis)
                .map(|v| {
                    split_csv(v)
                        .into_iter()
                        .filter_map(|pair| {
                            let (lport, iface) = pair.split_once(':')?;
                            Some((lport.to_string(), iface.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Resolves this process's chassis name, first match wins:
/// the `--chassis` argument, the `system-id-override` file, then
/// `external_ids:system-id` on the open-vswitch row.
pub fn resolve_chassis_name(
    cli_chassis: Option<&str>,
    sysconfdir: &Path,
    open_vswitch: Option<&Row>,
) -> Option<String> {
    if let Some(name) = cli_chassis {
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    let override_path = sysconfdir.join("system-id-override");
    if let Ok(contents) = std::fs::read_to_string(&override_path) {
        let trimmed = contents.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    open_vswitch
        .and_then(|row| row.smap_get("external_ids", "system-id"))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_types::serde_json::json;
    use flowsync_types::uuid::Uuid;

    fn ovs_row(ids: flowsync_db::Datum) -> Row {
        Row::new(Uuid::new_v4()).with("external_ids", ids)
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_open_vswitch(&ovs_row(json!({})), "hv1");
        assert_eq!(config.bridge_name, "br-int");
        assert_eq!(config.datapath_type, "system");
        assert!(!config.monitor_all);
        assert!(config.lflow_cache.enabled);
    }

    #[test]
    fn test_chassis_override_wins() {
        let row = ovs_row(json!({
            "ovn-bridge": "br-int",
            "ovn-bridge-hv1": "br-hv1",
            "ovn-encap-ip": "10.0.0.1,10.0.0.2",
            "ovn-encap-ip-default": "10.0.0.2",
            "ovn-monitor-all": "true",
        }));
        let config = Config::from_open_vswitch(&row, "hv1");
        assert_eq!(config.bridge_name, "br-hv1");
        assert_eq!(config.encap_ips, vec!["10.0.0.2", "10.0.0.1"]);
        assert!(config.monitor_all);

        let other = Config::from_open_vswitch(&row, "hv2");
        assert_eq!(other.bridge_name, "br-int");
    }

    #[test]
    fn test_identity_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let row = ovs_row(json!({"system-id": "from-db"}));

        assert_eq!(
            resolve_chassis_name(Some("from-cli"), dir.path(), Some(&row)).as_deref(),
            Some("from-cli")
        );
        assert_eq!(
            resolve_chassis_name(None, dir.path(), Some(&row)).as_deref(),
            Some("from-db")
        );

        std::fs::write(dir.path().join("system-id-override"), "from-file\n").unwrap();
        assert_eq!(
            resolve_chassis_name(None, dir.path(), Some(&row)).as_deref(),
            Some("from-file")
        );
    }
}
