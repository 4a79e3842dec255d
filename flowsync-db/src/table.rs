use crate::errors::DbError;
use crate::index::{Index, IndexKey, IndexKeyFn};
use crate::row::{Datum, Row};
use flowsync_types::indexmap::IndexMap;
use flowsync_types::uuid::Uuid;
use std::collections::{HashMap, HashSet};

/// Per-row tag of a tracked delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowChange {
    New,
    Updated,
    Deleted,
}

/// One entry of the per-iteration tracked delta. `row` is the new image
/// (final image for deletions); `updated_columns` carries the per-column
/// is-updated bits for `Updated` entries.
#[derive(Clone, Debug)]
pub struct TrackedRow {
    pub change: RowChange,
    pub row: Row,
    pub updated_columns: HashSet<String>,
}

impl TrackedRow {
    pub fn uuid(&self) -> Uuid {
        self.row.uuid()
    }

    pub fn column_updated(&self, column: &str) -> bool {
        self.updated_columns.contains(column)
    }
}

/// One monitored table of one database: the current row set, the tracked
/// delta accumulated since the last clear, and the secondary indexes.
#[derive(Debug)]
pub struct Table {
    name: String,
    rows: HashMap<Uuid, Row>,
    tracked: Vec<TrackedRow>,
    indexes: IndexMap<String, Index>,
    /// Bumped on every content change, including re-snapshots that leave
    /// no tracked delta behind. Consumers remember the last seen value to
    /// detect change cheaply.
    seq: u64,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: HashMap::new(),
            tracked: Vec::new(),
            indexes: IndexMap::new(),
            seq: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Row> {
        self.rows.get(uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    /// Registers a named secondary index. Panics on duplicates: indexes are
    /// created once at startup, before any row arrives.
    pub fn add_index(&mut self, name: &str, key_fn: IndexKeyFn) {
        let mut index = Index::new(key_fn);
        for row in self.rows.values() {
            index.insert(row);
        }
        if self.indexes.insert(name.to_string(), index).is_some() {
            panic!("index {name} registered twice on table {}", self.name);
        }
    }

    pub fn index(&self, name: &str) -> Result<&Index, DbError> {
        self.indexes.get(name).ok_or_else(|| DbError::UnknownIndex {
            table: self.name.clone(),
            index: name.to_string(),
        })
    }

    /// Rows matching `key` in index `name`. Missing index is a programmer
    /// error surfaced as `DbError::UnknownIndex`.
    pub fn rows_by_index<'a>(
        &'a self,
        name: &str,
        key: &IndexKey,
    ) -> Result<impl Iterator<Item = &'a Row>, DbError> {
        let index = self.index(name)?;
        Ok(index.lookup(key).filter_map(move |uuid| self.rows.get(&uuid)))
    }

    pub fn row_by_index<'a>(&'a self, name: &str, key: &IndexKey) -> Result<Option<&'a Row>, DbError> {
        Ok(self.rows_by_index(name, key)?.next())
    }

    // -- Server-side application; called by the session layer and tests. --

    pub fn apply_insert(&mut self, row: Row) -> Result<(), DbError> {
        let uuid = row.uuid();
        if self.rows.contains_key(&uuid) {
            return Err(DbError::RowAlreadyExists(uuid));
        }
        for index in self.indexes.values_mut() {
            index.insert(&row);
        }
        self.tracked.push(TrackedRow {
            change: RowChange::New,
            row: row.clone(),
            updated_columns: HashSet::new(),
        });
        self.rows.insert(uuid, row);
        self.seq += 1;
        Ok(())
    }

    pub fn apply_update(
        &mut self,
        uuid: Uuid,
        columns: IndexMap<String, Datum>,
    ) -> Result<(), DbError> {
        let row = self.rows.get_mut(&uuid).ok_or(DbError::RowNotFound(uuid))?;
        let mut updated = HashSet::new();
        let before = row.clone();
        for (column, value) in columns {
            if row.get(&column) != Some(&value) {
                row.set(column.clone(), value);
                updated.insert(column);
            }
        }
        if updated.is_empty() {
            return Ok(());
        }
        let after = row.clone();
        for index in self.indexes.values_mut() {
            index.remove(&before);
            index.insert(&after);
        }
        // Coalesce with an earlier entry for the same row so a handler sees
        // one delta per row per iteration.
        if let Some(prev) = self
            .tracked
            .iter_mut()
            .find(|t| t.uuid() == uuid && t.change != RowChange::Deleted)
        {
            prev.row = after;
            if prev.change == RowChange::Updated {
                prev.updated_columns.extend(updated);
            }
        } else {
            self.tracked.push(TrackedRow {
                change: RowChange::Updated,
                row: after,
                updated_columns: updated,
            });
        }
        self.seq += 1;
        Ok(())
    }

    pub fn apply_delete(&mut self, uuid: Uuid) -> Result<(), DbError> {
        let row = self.rows.remove(&uuid).ok_or(DbError::RowNotFound(uuid))?;
        for index in self.indexes.values_mut() {
            index.remove(&row);
        }
        // A row created and deleted within one iteration never existed as
        // far as handlers are concerned.
        if let Some(pos) = self
            .tracked
            .iter()
            .position(|t| t.uuid() == uuid && t.change == RowChange::New)
        {
            self.tracked.remove(pos);
            self.seq += 1;
            return Ok(());
        }
        self.tracked.retain(|t| t.uuid() != uuid);
        self.tracked.push(TrackedRow {
            change: RowChange::Deleted,
            row,
            updated_columns: HashSet::new(),
        });
        self.seq += 1;
        Ok(())
    }

    /// Replaces the whole row set (initial snapshot or post-reconnect
    /// re-snapshot). Tracked data is discarded; the replica marks itself
    /// invalid so dependents recompute instead of consuming deltas.
    pub fn reset(&mut self, rows: Vec<Row>) {
        self.rows.clear();
        self.tracked.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
        for row in rows {
            for index in self.indexes.values_mut() {
                index.insert(&row);
            }
            self.rows.insert(row.uuid(), row);
        }
        self.seq += 1;
    }

    pub fn tracked(&self) -> &[TrackedRow] {
        &self.tracked
    }

    pub fn has_tracked(&self) -> bool {
        !self.tracked.is_empty()
    }

    pub fn clear_tracked(&mut self) {
        self.tracked.clear();
    }
}

/// Where a session routes server-side row changes. Implemented by
/// [`crate::Replica`] for standalone use and by embedders that keep each
/// table inside its own computation node.
pub trait TableSink {
    fn sink_table_mut(&mut self, name: &str) -> Result<&mut Table, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_types::serde_json::json;

    fn by_name(row: &Row) -> Option<IndexKey> {
        row.str("name").map(IndexKey::str)
    }

    #[test]
    fn test_tracked_delta_tags_and_bits() {
        let mut table = Table::new("port_binding");
        table.add_index("by-name", by_name);

        let uuid = Uuid::new_v4();
        table
            .apply_insert(Row::new(uuid).with("name", "lp1").with("up", false))
            .unwrap();
        assert_eq!(table.tracked().len(), 1);
        assert_eq!(table.tracked()[0].change, RowChange::New);

        table.clear_tracked();
        table
            .apply_update(uuid, [("up".to_string(), json!(true))].into_iter().collect())
            .unwrap();
        let t = &table.tracked()[0];
        assert_eq!(t.change, RowChange::Updated);
        assert!(t.column_updated("up"));
        assert!(!t.column_updated("name"));

        // No-op updates leave no delta behind.
        table.clear_tracked();
        table
            .apply_update(uuid, [("up".to_string(), json!(true))].into_iter().collect())
            .unwrap();
        assert!(!table.has_tracked());

        table.clear_tracked();
        table.apply_delete(uuid).unwrap();
        let t = &table.tracked()[0];
        assert_eq!(t.change, RowChange::Deleted);
        assert_eq!(t.row.str("name"), Some("lp1"));
    }

    #[test]
    fn test_insert_then_delete_within_iteration_vanishes() {
        let mut table = Table::new("port_binding");
        let uuid = Uuid::new_v4();
        table.apply_insert(Row::new(uuid).with("name", "lp1")).unwrap();
        table.apply_delete(uuid).unwrap();
        assert!(!table.has_tracked());
    }

    #[test]
    fn test_index_follows_updates() {
        let mut table = Table::new("port_binding");
        table.add_index("by-name", by_name);
        let uuid = Uuid::new_v4();
        table.apply_insert(Row::new(uuid).with("name", "lp1")).unwrap();

        assert_eq!(
            table
                .row_by_index("by-name", &IndexKey::str("lp1"))
                .unwrap()
                .map(|r| r.uuid()),
            Some(uuid)
        );

        table
            .apply_update(
                uuid,
                [("name".to_string(), json!("lp2"))].into_iter().collect(),
            )
            .unwrap();
        assert!(table
            .row_by_index("by-name", &IndexKey::str("lp1"))
            .unwrap()
            .is_none());
        assert!(table
            .row_by_index("by-name", &IndexKey::str("lp2"))
            .unwrap()
            .is_some());

        table.apply_delete(uuid).unwrap();
        assert!(table
            .row_by_index("by-name", &IndexKey::str("lp2"))
            .unwrap()
            .is_none());
    }
}
