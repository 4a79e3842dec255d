//! Chassis template variables: the per-chassis slice of the southbound
//! chassis-template-var table, resolved into a flat name → value map used
//! by the translators and the load-balancer materialization.

use crate::global_config::GlobalConfig;
use crate::handles;
use crate::inputs::DbTableNode;
use crate::tables::{self, sb};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use std::any::Any;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
    /// Variable names whose value changed this iteration.
    tracked: Option<Vec<String>>,
}

impl TemplateVars {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn tracked(&self) -> Option<&[String]> {
        self.tracked.as_deref()
    }

    /// Substitutes `${var}` occurrences; unknown variables stay verbatim.
    pub fn expand(&self, input: &str) -> String {
        let mut out = input.to_string();
        for (name, value) in &self.vars {
            out = out.replace(&format!("${{{name}}}"), value);
        }
        out
    }

    fn collect(&self, ctx: &Context) -> Result<BTreeMap<String, String>, EngineError> {
        let chassis = ctx
            .node::<GlobalConfig>(&handles::global_config())?
            .chassis_name()
            .to_string();
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::CHASSIS_TEMPLATE_VAR))?
            .table();
        let mut vars = BTreeMap::new();
        for row in table.iter() {
            if row.str("chassis") != Some(chassis.as_str()) {
                continue;
            }
            for (name, value) in row.map_iter("variables") {
                if let Some(value) = value.as_str() {
                    vars.insert(name.to_string(), value.to_string());
                }
            }
        }
        Ok(vars)
    }
}

impl Node for TemplateVars {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let next = self.collect(ctx)?;
        let changed = next != self.vars;
        self.vars = next;
        self.tracked = None;
        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn handle_change(
        &mut self,
        _input: &NodeHandle,
        ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        // The table is small; recollect and diff names instead of chasing
        // per-row images.
        let next = self.collect(ctx)?;
        let mut changed_names: Vec<String> = Vec::new();
        for (name, value) in &next {
            if self.vars.get(name) != Some(value) {
                changed_names.push(name.clone());
            }
        }
        for name in self.vars.keys() {
            if !next.contains_key(name) {
                changed_names.push(name.clone());
            }
        }
        let changed = !changed_names.is_empty();
        self.vars = next;
        self.tracked = Some(changed_names);
        Ok(if changed {
            HandlerOutcome::Updated
        } else {
            HandlerOutcome::Unchanged
        })
    }

    fn clear_tracked(&mut self) {
        self.tracked = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
