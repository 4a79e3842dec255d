use flowsync_types::indexmap::IndexMap;
use flowsync_types::serde_json::Value;
use flowsync_types::uuid::Uuid;
use serde::{Deserialize, Serialize};

/// A single column value. The replicated databases speak JSON, so the datum
/// is kept in wire form; typed accessors live on [`Row`].
pub type Datum = Value;

/// One row of a monitored table. Identity is the row UUID; column values
/// are kept in insertion order so dumps are stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    uuid: Uuid,
    columns: IndexMap<String, Datum>,
}

impl Row {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            columns: IndexMap::new(),
        }
    }

    /// Builder-style column assignment, used by tests and the transaction
    /// layer when composing insert operations.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Datum>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.columns.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Datum>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Datum)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Datum::as_str)
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Datum::as_i64)
    }

    pub fn boolean(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Datum::as_bool)
    }

    pub fn uuid_col(&self, column: &str) -> Option<Uuid> {
        self.str(column).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Iterates a set-valued column. A missing column is the empty set.
    pub fn set_iter(&self, column: &str) -> impl Iterator<Item = &Datum> {
        self.get(column)
            .and_then(Datum::as_array)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
    }

    pub fn str_set(&self, column: &str) -> Vec<&str> {
        self.set_iter(column).filter_map(Datum::as_str).collect()
    }

    pub fn uuid_set(&self, column: &str) -> Vec<Uuid> {
        self.set_iter(column)
            .filter_map(Datum::as_str)
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect()
    }

    /// Iterates a map-valued column such as `external_ids` or
    /// `other_config`. A missing column is the empty map.
    pub fn map_iter(&self, column: &str) -> impl Iterator<Item = (&str, &Datum)> {
        self.get(column)
            .and_then(Datum::as_object)
            .into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// String lookup in a string-to-string map column.
    pub fn smap_get(&self, column: &str, key: &str) -> Option<&str> {
        self.get(column)
            .and_then(Datum::as_object)
            .and_then(|m| m.get(key))
            .and_then(Datum::as_str)
    }
}

/// Formats a UUID the way set- and reference-valued columns carry them.
pub fn uuid_datum(uuid: Uuid) -> Datum {
    Datum::String(uuid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_types::serde_json::json;

    #[test]
    fn test_typed_accessors() {
        let uuid = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let row = Row::new(uuid)
            .with("name", "lp1")
            .with("tunnel_key", 5)
            .with("up", true)
            .with("mac", json!(["aa:bb:cc:dd:ee:ff 10.0.0.1"]))
            .with("external_ids", json!({"iface-id": "lp1"}))
            .with("peers", json!([peer.to_string()]));

        assert_eq!(row.str("name"), Some("lp1"));
        assert_eq!(row.integer("tunnel_key"), Some(5));
        assert_eq!(row.boolean("up"), Some(true));
        assert_eq!(row.str_set("mac"), vec!["aa:bb:cc:dd:ee:ff 10.0.0.1"]);
        assert_eq!(row.smap_get("external_ids", "iface-id"), Some("lp1"));
        assert_eq!(row.uuid_set("peers"), vec![peer]);
        assert_eq!(row.str("missing"), None);
        assert_eq!(row.str_set("missing").len(), 0);
    }
}
