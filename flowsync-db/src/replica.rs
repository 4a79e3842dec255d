use crate::errors::DbError;
use crate::table::{Table, TableSink};
use flowsync_types::indexmap::IndexMap;

/// Standalone container for the tables of one monitored database. Embedders
/// that spread tables across computation nodes implement [`TableSink`]
/// themselves instead.
#[derive(Debug)]
pub struct Replica {
    name: String,
    tables: IndexMap<String, Table>,
}

impl Replica {
    pub fn new(name: impl Into<String>, table_names: &[&str]) -> Self {
        let mut tables = IndexMap::new();
        for table_name in table_names {
            tables.insert(table_name.to_string(), Table::new(*table_name));
        }
        Self {
            name: name.into(),
            tables,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self, name: &str) -> Result<&Table, DbError> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::UnknownTable(name.to_string()))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table, DbError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn has_tracked_any(&self) -> bool {
        self.tables.values().any(Table::has_tracked)
    }

    pub fn clear_all_tracked(&mut self) {
        for table in self.tables.values_mut() {
            table.clear_tracked();
        }
    }
}

impl TableSink for Replica {
    fn sink_table_mut(&mut self, name: &str) -> Result<&mut Table, DbError> {
        self.table_mut(name)
    }
}
