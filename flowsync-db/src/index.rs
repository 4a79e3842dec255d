use crate::row::Row;
use flowsync_types::uuid::Uuid;
use std::collections::{BTreeMap, BTreeSet};

/// Key of a secondary index. The variants cover the lookups the nodes
/// need: by name, by numeric key, by referenced row, and by the
/// `(tunnel_key, datapath)` pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKey {
    Str(String),
    Int(i64),
    Uuid(Uuid),
    IntUuid(i64, Uuid),
}

impl IndexKey {
    pub fn str(s: impl Into<String>) -> Self {
        IndexKey::Str(s.into())
    }
}

/// Extracts the index key from a row; rows yielding `None` are absent from
/// the index.
pub type IndexKeyFn = fn(&Row) -> Option<IndexKey>;

/// Named secondary lookup over one table. Created before the first engine
/// iteration and maintained on every row change for the daemon lifetime.
#[derive(Debug)]
pub struct Index {
    key_fn: IndexKeyFn,
    map: BTreeMap<IndexKey, BTreeSet<Uuid>>,
}

impl Index {
    pub fn new(key_fn: IndexKeyFn) -> Self {
        Self {
            key_fn,
            map: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, row: &Row) {
        if let Some(key) = (self.key_fn)(row) {
            self.map.entry(key).or_default().insert(row.uuid());
        }
    }

    pub(crate) fn remove(&mut self, row: &Row) {
        if let Some(key) = (self.key_fn)(row) {
            if let Some(set) = self.map.get_mut(&key) {
                set.remove(&row.uuid());
                if set.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }

    pub fn lookup(&self, key: &IndexKey) -> impl Iterator<Item = Uuid> + '_ {
        self.map.get(key).into_iter().flatten().copied()
    }

    /// Single-row convenience for unique indexes (e.g. port-binding by
    /// logical port name).
    pub fn lookup_one(&self, key: &IndexKey) -> Option<Uuid> {
        self.lookup(key).next()
    }
}
