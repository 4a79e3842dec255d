//! Derived node digesting daemon-wide configuration: the `ovn-*` keys of
//! the open-vswitch row, the integration-bridge row, and the northd
//! version gate from the southbound global row.

use crate::config::Config;
use crate::tables::{self, index, ovs, sb};
use flowsync_db::IndexKey;
use flowsync_engine::{Change, Context, EngineError, Node};
use flowsync_types::log::warn;
use flowsync_types::uuid::Uuid;
use std::any::Any;

/// Internal translation version this daemon implements. When
/// `ovn-match-northd-version` is set, processing is skipped while the
/// northd side advertises a different one.
pub const INTERNAL_VERSION: &str = "24.03.2-1";

#[derive(Debug, Default)]
pub struct GlobalConfig {
    chassis_name: String,
    config: Config,
    br_int: Option<Uuid>,
    northd_version: Option<String>,
    version_mismatch: bool,
    /// Last mismatching version we logged, so the warning fires once per
    /// change instead of once per iteration.
    logged_version: Option<String>,
}

impl GlobalConfig {
    pub fn new(chassis_name: String) -> Self {
        Self {
            chassis_name,
            ..Default::default()
        }
    }

    pub fn chassis_name(&self) -> &str {
        &self.chassis_name
    }

    /// Sets the identity once it is resolved; it is fixed for the process
    /// lifetime afterwards.
    pub fn set_chassis_name(&mut self, name: String) {
        if self.chassis_name.is_empty() {
            self.chassis_name = name;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn br_int(&self) -> Option<Uuid> {
        self.br_int
    }

    /// False while `ovn-match-northd-version` is on and versions diverge;
    /// the main loop skips the processing phase until they converge.
    pub fn version_ok(&self) -> bool {
        !self.version_mismatch
    }
}

impl Node for GlobalConfig {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let ovs_table = ctx
            .node::<crate::inputs::DbTableNode>(&tables::ovs_node(ovs::OPEN_VSWITCH))?
            .table();
        let bridge_table = ctx
            .node::<crate::inputs::DbTableNode>(&tables::ovs_node(ovs::BRIDGE))?
            .table();
        let sb_global = ctx
            .node::<crate::inputs::DbTableNode>(&tables::sb_node(sb::SB_GLOBAL))?
            .table();

        let config = ovs_table
            .iter()
            .next()
            .map(|row| Config::from_open_vswitch(row, &self.chassis_name))
            .unwrap_or_default();

        let br_int = bridge_table
            .row_by_index(index::BY_NAME, &IndexKey::str(config.bridge_name.clone()))?
            .map(|row| row.uuid());

        let northd_version = sb_global
            .iter()
            .next()
            .and_then(|row| row.smap_get("options", "northd_internal_version"))
            .map(str::to_string);
        let version_mismatch = config.match_northd_version
            && northd_version.as_deref() != Some(INTERNAL_VERSION);
        if version_mismatch && self.logged_version != northd_version {
            warn!(
                "northd internal version {} does not match expected {}, skipping processing",
                northd_version.as_deref().unwrap_or("<unset>"),
                INTERNAL_VERSION
            );
            self.logged_version = northd_version.clone();
        }

        let changed = config != self.config
            || br_int != self.br_int
            || northd_version != self.northd_version
            || version_mismatch != self.version_mismatch;
        self.config = config;
        self.br_int = br_int;
        self.northd_version = northd_version;
        self.version_mismatch = version_mismatch;
        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
