use crate::row::{Datum, Row};
use flowsync_types::uuid::Uuid;
use serde::{Deserialize, Serialize};

/// One clause of a monitor condition. Clauses of a condition are OR-ed; a
/// row is shipped when any clause matches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Clause {
    /// `column == value`.
    Eq { column: String, value: Datum },
    /// `column ∈ values`.
    In { column: String, values: Vec<Datum> },
    /// Set-valued `column` shares at least one element with `values`.
    Intersects { column: String, values: Vec<Datum> },
}

impl Clause {
    pub fn eq(column: impl Into<String>, value: impl Into<Datum>) -> Self {
        Clause::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn eq_uuid(column: impl Into<String>, uuid: Uuid) -> Self {
        Clause::eq(column, uuid.to_string())
    }

    pub fn in_strs<S: Into<String>>(column: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Clause::In {
            column: column.into(),
            values: values.into_iter().map(|s| Datum::String(s.into())).collect(),
        }
    }

    pub fn in_uuids(column: impl Into<String>, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Clause::In {
            column: column.into(),
            values: uuids
                .into_iter()
                .map(|u| Datum::String(u.to_string()))
                .collect(),
        }
    }

    pub fn intersects_uuids(
        column: impl Into<String>,
        uuids: impl IntoIterator<Item = Uuid>,
    ) -> Self {
        Clause::Intersects {
            column: column.into(),
            values: uuids
                .into_iter()
                .map(|u| Datum::String(u.to_string()))
                .collect(),
        }
    }

    fn matches(&self, row: &Row) -> bool {
        match self {
            Clause::Eq { column, value } => row.get(column) == Some(value),
            Clause::In { column, values } => {
                row.get(column).is_some_and(|v| values.contains(v))
            }
            Clause::Intersects { column, values } => row
                .set_iter(column)
                .any(|member| values.contains(member)),
        }
    }
}

/// The row filter asked of the server for one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Ship everything (startup mode, `ovn-monitor-all`).
    All,
    /// Ship nothing.
    None,
    /// Ship rows matching any clause.
    Any(Vec<Clause>),
}

impl Condition {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::All => true,
            Condition::None => false,
            Condition::Any(clauses) => clauses.iter().any(|c| c.matches(row)),
        }
    }
}

/// Accumulates clauses for one table and finalizes into a [`Condition`] in
/// a single pass, so every early-exit path releases the partial state the
/// same way.
#[derive(Debug, Default)]
pub struct ConditionBuilder {
    clauses: Vec<Clause>,
    match_all: bool,
}

impl ConditionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clause(&mut self, clause: Clause) -> &mut Self {
        self.clauses.push(clause);
        self
    }

    /// Degrades the whole condition to match-all; any accumulated clauses
    /// are redundant from here on.
    pub fn match_all(&mut self) -> &mut Self {
        self.match_all = true;
        self
    }

    pub fn build(&mut self) -> Condition {
        let clauses = std::mem::take(&mut self.clauses);
        if std::mem::take(&mut self.match_all) {
            Condition::All
        } else if clauses.is_empty() {
            Condition::None
        } else {
            Condition::Any(clauses)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clause_disjunction() {
        let dp = Uuid::new_v4();
        let mut b = ConditionBuilder::new();
        b.clause(Clause::eq_uuid("datapath", dp));
        b.clause(Clause::in_strs("type", ["patch", "l3gateway"]));
        let cond = b.build();

        let on_dp = Row::new(Uuid::new_v4()).with("datapath", dp.to_string());
        let patch = Row::new(Uuid::new_v4()).with("type", "patch");
        let other = Row::new(Uuid::new_v4()).with("type", "vif");
        assert!(cond.matches(&on_dp));
        assert!(cond.matches(&patch));
        assert!(!cond.matches(&other));
    }

    #[test]
    fn test_empty_builder_matches_nothing() {
        assert_eq!(ConditionBuilder::new().build(), Condition::None);
    }

    #[test]
    fn test_match_all_wins() {
        let mut b = ConditionBuilder::new();
        b.clause(Clause::eq("name", "x")).match_all();
        let cond = b.build();
        assert!(cond.matches(&Row::new(Uuid::new_v4())));
    }
}
