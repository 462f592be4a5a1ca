//! Refresh decision engine
//!
//! For each (subscription, change) pair, decides whether the query must be
//! re-run. The tracked-column gate applies first regardless of policy: a
//! change that touches none of the columns the query reads never triggers
//! a refresh. Beyond the gate, a policy either always refreshes
//! ([`RefreshPolicy::Default`]), matches row values against a declarative
//! per-table filter map, or defers to a caller-supplied predicate.

use crate::change::Change;
use crate::driver::SqlDriver;
use crate::error::Result;
use crate::table::QualifiedTable;
use crate::value::{Row, Value};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What a caller-supplied predicate decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOutcome {
    /// Re-run the query.
    Refresh,
    /// Ignore this change.
    Skip,
    /// Defer to the tracked-column gate, which already passed at this
    /// point, so the query is re-run.
    FallBackToTrackedColumns,
}

/// A caller-supplied refresh predicate. Runs on the dispatcher task, so it
/// must not block indefinitely; it may issue lookup queries on the
/// subscription's driver. Errors go to the system error handler and count
/// as "do not refresh".
#[async_trait]
pub trait RefreshPredicate: Send + Sync {
    /// Decide whether a change warrants re-running the query.
    async fn evaluate(
        &self,
        driver: Arc<dyn SqlDriver>,
        current_result: Option<&[Row]>,
        change: &Change,
    ) -> Result<PredicateOutcome>;
}

/// A filter-map value: either a literal to compare against, or a
/// reference meaning "the set of values column `X` takes in the current
/// result".
#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    /// Match when the change carries exactly this value (null included).
    Literal(Value),
    /// Match when the change carries any value the named column takes in
    /// the current result. Never matches while the result is empty.
    ResultColumn(String),
}

/// Per-table column matchers: `table → {column → matcher}`.
pub type FilterMap = HashMap<QualifiedTable, HashMap<String, Matcher>>;

/// How a subscription decides whether a change warrants a refresh.
#[derive(Clone, Default)]
pub enum RefreshPolicy {
    /// Refresh whenever the tracked-column gate passes.
    #[default]
    Default,
    /// Refresh when any (column, matcher) pair of the change's table entry
    /// matches; tables without an entry behave like `Default`.
    FilterMap(FilterMap),
    /// Defer to a caller-supplied predicate.
    Predicate(Arc<dyn RefreshPredicate>),
}

impl fmt::Debug for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshPolicy::Default => write!(f, "Default"),
            RefreshPolicy::FilterMap(map) => f.debug_tuple("FilterMap").field(map).finish(),
            RefreshPolicy::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Evaluate a subscription's refresh policy against a decoded change.
///
/// `watched_columns` is the subscription's column set for the change's
/// table; `current_result` is what the handle currently holds (None before
/// the first execution completes).
pub async fn should_refresh(
    driver: &Arc<dyn SqlDriver>,
    current_result: Option<&[Row]>,
    watched_columns: Option<&HashSet<String>>,
    policy: &RefreshPolicy,
    change: &Change,
) -> Result<bool> {
    // Tracked-column gate. For INSERT/DELETE `changes` carries every
    // column of the row, so the gate passes iff any column of the table
    // is watched.
    let Some(watched) = watched_columns else {
        return Ok(false);
    };
    if !change.changed_columns().any(|c| watched.contains(c)) {
        return Ok(false);
    }

    match policy {
        RefreshPolicy::Default => Ok(true),
        RefreshPolicy::FilterMap(map) => {
            let Some(entry) = map.get(&change.table) else {
                return Ok(true);
            };
            Ok(entry
                .iter()
                .any(|(column, matcher)| column_matches(column, matcher, current_result, change)))
        }
        RefreshPolicy::Predicate(predicate) => {
            let outcome = predicate
                .evaluate(Arc::clone(driver), current_result, change)
                .await?;
            Ok(matches!(
                outcome,
                PredicateOutcome::Refresh | PredicateOutcome::FallBackToTrackedColumns
            ))
        }
    }
}

/// Whether one (column, matcher) pair identifies the changed row.
fn column_matches(
    column: &str,
    matcher: &Matcher,
    current_result: Option<&[Row]>,
    change: &Change,
) -> bool {
    let mut candidates: Vec<&Value> = Vec::new();
    if let Some(value) = change.row.get(column) {
        candidates.push(value);
    }
    if let Some((old, new)) = change.changes.get(column) {
        candidates.push(old);
        candidates.push(new);
    }
    if candidates.is_empty() {
        return false;
    }

    match matcher {
        Matcher::Literal(value) => candidates.iter().any(|c| *c == value),
        Matcher::ResultColumn(result_column) => {
            let Some(rows) = current_result else {
                return false;
            };
            rows.iter()
                .filter_map(|row| row.get_by_name(result_column))
                .any(|value| candidates.iter().any(|c| *c == value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeOp;
    use crate::error::LiveQueryError;

    struct NoopDriver;

    #[async_trait]
    impl SqlDriver for NoopDriver {
        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }
    }

    fn driver() -> Arc<dyn SqlDriver> {
        Arc::new(NoopDriver)
    }

    fn update_change(table: &str, column: &str, old: Value, new: Value) -> Change {
        let mut row = HashMap::new();
        row.insert(column.to_string(), new.clone());
        let mut changes = HashMap::new();
        changes.insert(column.to_string(), (old, new));
        Change {
            table: QualifiedTable::parse(table),
            op: ChangeOp::Update,
            row,
            changes,
            hashed: HashSet::new(),
        }
    }

    fn watched(columns: &[&str]) -> HashSet<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    fn result_rows(ids: &[i32]) -> Vec<Row> {
        ids.iter()
            .map(|id| Row::new(vec!["id".into()], vec![Value::Int32(*id)]))
            .collect()
    }

    #[tokio::test]
    async fn test_tracked_column_gate_blocks_unwatched_change() {
        let change = update_change(
            "users",
            "avatar_url",
            Value::String("a".into()),
            Value::String("b".into()),
        );
        let refresh = should_refresh(
            &driver(),
            None,
            Some(&watched(&["id", "email"])),
            &RefreshPolicy::Default,
            &change,
        )
        .await
        .unwrap();
        assert!(!refresh);
    }

    #[tokio::test]
    async fn test_tracked_column_gate_passes_watched_change() {
        let change = update_change(
            "users",
            "email",
            Value::String("a@x".into()),
            Value::String("b@x".into()),
        );
        let refresh = should_refresh(
            &driver(),
            None,
            Some(&watched(&["id", "email"])),
            &RefreshPolicy::Default,
            &change,
        )
        .await
        .unwrap();
        assert!(refresh);
    }

    #[tokio::test]
    async fn test_no_watched_columns_means_no_refresh() {
        let change = update_change("users", "email", Value::Null, Value::Null);
        let refresh = should_refresh(&driver(), None, None, &RefreshPolicy::Default, &change)
            .await
            .unwrap();
        assert!(!refresh);
    }

    #[tokio::test]
    async fn test_filter_map_literal_matches_old_value() {
        // status moved pending -> shipped; the literal "pending" is in the
        // union of candidate values, so the refresh fires.
        let change = update_change(
            "orders",
            "status",
            Value::String("pending".into()),
            Value::String("shipped".into()),
        );
        let mut entry = HashMap::new();
        entry.insert(
            "status".to_string(),
            Matcher::Literal(Value::String("pending".into())),
        );
        let mut map = HashMap::new();
        map.insert(QualifiedTable::public("orders"), entry);

        let refresh = should_refresh(
            &driver(),
            None,
            Some(&watched(&["status"])),
            &RefreshPolicy::FilterMap(map),
            &change,
        )
        .await
        .unwrap();
        assert!(refresh);
    }

    #[tokio::test]
    async fn test_filter_map_literal_rejects_other_values() {
        let change = update_change(
            "orders",
            "status",
            Value::String("shipped".into()),
            Value::String("delivered".into()),
        );
        let mut entry = HashMap::new();
        entry.insert(
            "status".to_string(),
            Matcher::Literal(Value::String("pending".into())),
        );
        let mut map = HashMap::new();
        map.insert(QualifiedTable::public("orders"), entry);

        let refresh = should_refresh(
            &driver(),
            None,
            Some(&watched(&["status"])),
            &RefreshPolicy::FilterMap(map),
            &change,
        )
        .await
        .unwrap();
        assert!(!refresh);
    }

    #[tokio::test]
    async fn test_filter_map_unlisted_table_behaves_as_default() {
        let change = update_change("users", "email", Value::Null, Value::Null);
        let mut map = HashMap::new();
        map.insert(QualifiedTable::public("orders"), HashMap::new());

        let refresh = should_refresh(
            &driver(),
            None,
            Some(&watched(&["email"])),
            &RefreshPolicy::FilterMap(map),
            &change,
        )
        .await
        .unwrap();
        assert!(refresh);
    }

    #[tokio::test]
    async fn test_filter_map_result_reference() {
        let change = update_change("items", "order_id", Value::Int32(2), Value::Int32(2));
        let mut entry = HashMap::new();
        entry.insert(
            "order_id".to_string(),
            Matcher::ResultColumn("id".to_string()),
        );
        let mut map = HashMap::new();
        map.insert(QualifiedTable::public("items"), entry);
        let policy = RefreshPolicy::FilterMap(map);
        let rows = result_rows(&[1, 2]);

        let refresh = should_refresh(
            &driver(),
            Some(&rows),
            Some(&watched(&["order_id"])),
            &policy,
            &change,
        )
        .await
        .unwrap();
        assert!(refresh);

        let miss = update_change("items", "order_id", Value::Int32(99), Value::Int32(99));
        let refresh = should_refresh(
            &driver(),
            Some(&rows),
            Some(&watched(&["order_id"])),
            &policy,
            &miss,
        )
        .await
        .unwrap();
        assert!(!refresh);
    }

    #[tokio::test]
    async fn test_result_reference_empty_result_never_matches() {
        let change = update_change("items", "order_id", Value::Int32(1), Value::Int32(1));
        let mut entry = HashMap::new();
        entry.insert(
            "order_id".to_string(),
            Matcher::ResultColumn("id".to_string()),
        );
        let mut map = HashMap::new();
        map.insert(QualifiedTable::public("items"), entry);
        let policy = RefreshPolicy::FilterMap(map);

        let empty: Vec<Row> = Vec::new();
        let refresh = should_refresh(
            &driver(),
            Some(&empty),
            Some(&watched(&["order_id"])),
            &policy,
            &change,
        )
        .await
        .unwrap();
        assert!(!refresh);
    }

    #[tokio::test]
    async fn test_filter_map_null_literal_matches_null() {
        let change = update_change("users", "deleted_at", Value::Null, Value::Null);
        let mut entry = HashMap::new();
        entry.insert("deleted_at".to_string(), Matcher::Literal(Value::Null));
        let mut map = HashMap::new();
        map.insert(QualifiedTable::public("users"), entry);

        let refresh = should_refresh(
            &driver(),
            None,
            Some(&watched(&["deleted_at"])),
            &RefreshPolicy::FilterMap(map),
            &change,
        )
        .await
        .unwrap();
        assert!(refresh);
    }

    struct FixedPredicate(PredicateOutcome);

    #[async_trait]
    impl RefreshPredicate for FixedPredicate {
        async fn evaluate(
            &self,
            _driver: Arc<dyn SqlDriver>,
            _current_result: Option<&[Row]>,
            _change: &Change,
        ) -> Result<PredicateOutcome> {
            Ok(self.0)
        }
    }

    struct FailingPredicate;

    #[async_trait]
    impl RefreshPredicate for FailingPredicate {
        async fn evaluate(
            &self,
            _driver: Arc<dyn SqlDriver>,
            _current_result: Option<&[Row]>,
            _change: &Change,
        ) -> Result<PredicateOutcome> {
            Err(LiveQueryError::query_execution("lookup failed"))
        }
    }

    #[tokio::test]
    async fn test_predicate_outcomes() {
        let change = update_change("users", "email", Value::Null, Value::Null);
        let cols = watched(&["email"]);

        for (outcome, expected) in [
            (PredicateOutcome::Refresh, true),
            (PredicateOutcome::Skip, false),
            (PredicateOutcome::FallBackToTrackedColumns, true),
        ] {
            let policy = RefreshPolicy::Predicate(Arc::new(FixedPredicate(outcome)));
            let refresh = should_refresh(&driver(), None, Some(&cols), &policy, &change)
                .await
                .unwrap();
            assert_eq!(refresh, expected, "outcome {outcome:?}");
        }
    }

    #[tokio::test]
    async fn test_predicate_error_propagates() {
        let change = update_change("users", "email", Value::Null, Value::Null);
        let policy = RefreshPolicy::Predicate(Arc::new(FailingPredicate));
        let result = should_refresh(
            &driver(),
            None,
            Some(&watched(&["email"])),
            &policy,
            &change,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_predicate_not_consulted_when_gate_blocks() {
        let change = update_change("users", "avatar_url", Value::Null, Value::Null);
        let policy = RefreshPolicy::Predicate(Arc::new(FailingPredicate));
        let refresh = should_refresh(
            &driver(),
            None,
            Some(&watched(&["email"])),
            &policy,
            &change,
        )
        .await
        .unwrap();
        assert!(!refresh);
    }
}
