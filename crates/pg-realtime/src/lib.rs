//! # pg-realtime - Live queries over PostgreSQL
//!
//! Register a SQL query, get a handle whose observable value is the
//! current result of that query, re-executed automatically whenever the
//! underlying data changes. Change detection runs on PostgreSQL's own
//! LISTEN/NOTIFY plus per-table AFTER triggers this crate installs and
//! owns. No WAL decoding, no external infrastructure.
//!
//! ## How it works
//!
//! ```text
//! write -> AFTER trigger -> NOTIFY (typed JSON delta, size-bounded)
//!       -> listener -> decoder -> registry fan-out
//!       -> refresh policy -> throttler -> re-run query -> handle update
//! ```
//!
//! - **Query analysis**: the query is compiled into a temporary view and
//!   the catalog's view-dependency usage yields the tables and columns it
//!   reads, which becomes the subscription's watch spec.
//! - **Change capture**: a generated trigger emits a `{value, oid}`
//!   annotated JSON delta per row mutation, degrading oversized values to
//!   SHA-256 digests to stay under the NOTIFY payload limit.
//! - **Refresh decisions**: a change re-runs the query only when it
//!   touches watched columns, and the per-subscription policy (tracked
//!   columns, declarative filter map, or custom predicate) accepts it.
//! - **Throttled re-execution**: a leading+trailing coalescer turns any
//!   burst within one window into at most two runs, and result hashing
//!   suppresses publishes that would not change the observable value.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pg_realtime::{LiveQueries, LiveQueryConfig, PgDriver, SubscribeRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> pg_realtime::Result<()> {
//! let system = LiveQueries::start(LiveQueryConfig::new(
//!     "host=localhost user=app dbname=shop",
//! ))
//! .await?;
//!
//! let driver = Arc::new(PgDriver::connect("host=localhost user=app dbname=shop").await?);
//! let orders = system
//!     .subscribe(SubscribeRequest::new(
//!         "open-orders",
//!         driver,
//!         "SELECT id, status FROM orders WHERE status <> 'done'",
//!     ))
//!     .await?;
//!
//! println!("{:?}", orders.current());
//! orders.watch("ui", |old, new| {
//!     println!("orders changed: {} -> {} rows", old.map_or(0, Vec::len), new.len());
//! });
//! # Ok(())
//! # }
//! ```
//!
//! ## Database footprint
//!
//! Everything this crate installs carries the `_pg_realtime_` prefix: the
//! `_pg_realtime_parse_query` routine, one notify function and trigger
//! per watched table, and the `pgcrypto` extension it depends on.
//! Triggers survive unsubscribe and process restarts;
//! [`destroy_objects`] is the explicit admin sweep. PostgreSQL 14+.

pub mod analyzer;
pub mod change;
pub mod config;
pub mod decoder;
pub mod driver;
pub mod error;
pub mod listener;
pub mod refresh;
pub mod sql;
pub mod subscription;
pub mod system;
pub mod table;
pub mod throttle;
pub mod trigger;
pub mod value;

pub use analyzer::{analyze, strip_parameters, WatchSpec};
pub use change::{Change, ChangeOp};
pub use config::{LiveQueryConfig, LiveQueryConfigBuilder};
pub use driver::{PgDriver, SqlDriver};
pub use error::{
    ErrorCategory, ErrorHandler, LiveQueryError, QueryErrorHandler, Result,
};
pub use listener::ListenerStats;
pub use refresh::{
    should_refresh, FilterMap, Matcher, PredicateOutcome, RefreshPolicy, RefreshPredicate,
};
pub use subscription::{
    SubscribeRequest, SubscriptionHandle, SubscriptionManager, DEFAULT_THROTTLE,
};
pub use system::LiveQueries;
pub use table::QualifiedTable;
pub use throttle::Throttler;
pub use trigger::destroy_objects;
pub use value::{ResultSet, Row, Value};
