//! Subscription registry and result publication
//!
//! Holds the per-process registry of live subscriptions, fans decoded
//! changes out to the refresh engine, and owns each subscription's result
//! cell. Results publish through change suppression: a refresh that
//! produces a byte-identical result set (by SHA-256 of its serialized
//! form) leaves the holder untouched and wakes no observers.

use crate::analyzer::{self, WatchSpec};
use crate::driver::SqlDriver;
use crate::error::{ErrorHandler, QueryErrorHandler, Result};
use crate::refresh::{self, RefreshPolicy};
use crate::change::Change;
use crate::throttle::Throttler;
use crate::trigger;
use crate::value::{ResultSet, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Default throttle window for a subscription.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(500);

/// Observer callback invoked with the previous and new result whenever a
/// subscription's holder changes.
pub type WatchCallback = Box<dyn Fn(Option<&ResultSet>, &ResultSet) + Send + Sync>;

/// What a caller needs to open a subscription.
pub struct SubscribeRequest {
    /// Caller-chosen identifier, unique within the process. Re-subscribing
    /// with the same id supersedes the previous subscription while
    /// preserving its holder, so watchers see no spurious transient.
    pub id: String,
    /// Caller-supplied connection the query (and trigger DDL) runs on.
    pub driver: Arc<dyn SqlDriver>,
    /// SQL text, optionally with positional parameters.
    pub query: String,
    /// Parameter values for the query.
    pub params: Vec<Value>,
    /// Throttle window for re-execution.
    pub throttle: Duration,
    /// Refresh decision policy.
    pub refresh: RefreshPolicy,
    /// Handler for query-execution failures of this subscription.
    pub error_handler: Option<QueryErrorHandler>,
}

impl SubscribeRequest {
    /// Start building a request with defaults.
    pub fn new(
        id: impl Into<String>,
        driver: Arc<dyn SqlDriver>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            driver,
            query: query.into(),
            params: Vec::new(),
            throttle: DEFAULT_THROTTLE,
            refresh: RefreshPolicy::Default,
            error_handler: None,
        }
    }

    /// Set positional parameters.
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Set the throttle window.
    pub fn with_throttle(mut self, window: Duration) -> Self {
        self.throttle = window;
        self
    }

    /// Set the refresh policy.
    pub fn with_refresh(mut self, policy: RefreshPolicy) -> Self {
        self.refresh = policy;
        self
    }

    /// Set the query-execution error handler.
    pub fn with_error_handler(mut self, handler: QueryErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }
}

struct ResultCell {
    result: Option<ResultSet>,
    digest: Option<String>,
}

/// A caller's view of one subscription: the current result plus observer
/// registration. Cloning shares the underlying holder.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: String,
    cell: Arc<RwLock<ResultCell>>,
    watchers: Arc<Mutex<HashMap<String, WatchCallback>>>,
}

impl SubscriptionHandle {
    fn new(id: String) -> Self {
        Self {
            id,
            cell: Arc::new(RwLock::new(ResultCell {
                result: None,
                digest: None,
            })),
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Synchronous read of the current result. None until the first
    /// execution completes.
    pub fn current(&self) -> Option<ResultSet> {
        self.cell
            .read()
            .expect("result cell lock poisoned")
            .result
            .clone()
    }

    /// Register an observer under a caller-chosen key, replacing any
    /// previous observer with the same key. The callback fires with
    /// `(old, new)` on every published change; `old != new` is guaranteed
    /// under value equality.
    pub fn watch(
        &self,
        key: impl Into<String>,
        callback: impl Fn(Option<&ResultSet>, &ResultSet) + Send + Sync + 'static,
    ) {
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .insert(key.into(), Box::new(callback));
    }

    /// Remove an observer. Returns whether one was registered.
    pub fn unwatch(&self, key: &str) -> bool {
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .remove(key)
            .is_some()
    }
}

/// Digest of a serialized result set, for change suppression.
fn result_digest(rows: &ResultSet) -> String {
    let bytes = serde_json::to_vec(rows).unwrap_or_else(|_| format!("{rows:?}").into_bytes());
    hex::encode(Sha256::digest(bytes))
}

/// Executes one subscription's query and publishes the result.
struct QueryRunner {
    query: String,
    params: Vec<Value>,
    driver: Arc<dyn SqlDriver>,
    handle: SubscriptionHandle,
    error_handler: QueryErrorHandler,
}

impl QueryRunner {
    async fn run(&self) {
        match self.driver.query(&self.query, &self.params).await {
            Ok(rows) => self.publish(rows),
            Err(e) => {
                warn!(id = %self.handle.id(), error = %e, "refresh query failed");
                (self.error_handler)(&e, &self.query);
            }
        }
    }

    fn publish(&self, rows: ResultSet) {
        let digest = result_digest(&rows);
        let old = {
            let mut cell = self.handle.cell.write().expect("result cell lock poisoned");
            if cell.digest.as_deref() == Some(digest.as_str()) {
                trace!(id = %self.handle.id(), "result unchanged, suppressing publish");
                return;
            }
            let old = cell.result.take();
            cell.result = Some(rows.clone());
            cell.digest = Some(digest);
            old
        };

        let watchers = self.handle.watchers.lock().expect("watchers lock poisoned");
        for callback in watchers.values() {
            callback(old.as_ref(), &rows);
        }
    }
}

struct SubscriptionEntry {
    watch_spec: WatchSpec,
    refresh: RefreshPolicy,
    driver: Arc<dyn SqlDriver>,
    throttler: Arc<Throttler>,
    handle: SubscriptionHandle,
}

/// The per-process subscription registry and change dispatcher.
pub struct SubscriptionManager {
    registry: RwLock<HashMap<String, SubscriptionEntry>>,
    error_handler: ErrorHandler,
}

impl SubscriptionManager {
    /// Create an empty registry reporting to the given system error
    /// handler.
    pub fn new(error_handler: ErrorHandler) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            error_handler,
        }
    }

    /// Open a subscription: analyze the query, install triggers for every
    /// table it reads, run the query once, and register. Returns the
    /// handle; for a same-id re-subscribe, the same holder the previous
    /// handle shares.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscriptionHandle> {
        let spec = analyzer::analyze(request.driver.as_ref(), &request.query).await?;
        trigger::install_triggers(request.driver.as_ref(), &spec).await?;

        let prior = {
            let registry = self.registry.read().expect("registry lock poisoned");
            registry
                .get(&request.id)
                .map(|entry| (entry.handle.clone(), Arc::clone(&entry.throttler)))
        };

        let handle = match &prior {
            Some((handle, _)) => handle.clone(),
            None => SubscriptionHandle::new(request.id.clone()),
        };
        if let Some((_, throttler)) = prior {
            throttler.close().await;
        }

        let error_handler = request
            .error_handler
            .unwrap_or_else(default_query_error_handler);
        let runner = Arc::new(QueryRunner {
            query: request.query,
            params: request.params,
            driver: Arc::clone(&request.driver),
            handle: handle.clone(),
            error_handler,
        });

        let throttled = Arc::clone(&runner);
        let throttler = Arc::new(Throttler::spawn(request.throttle, move || {
            let runner = Arc::clone(&throttled);
            async move { runner.run().await }
        }));

        runner.run().await;

        let entry = SubscriptionEntry {
            watch_spec: spec,
            refresh: request.refresh,
            driver: request.driver,
            throttler,
            handle: handle.clone(),
        };
        self.registry
            .write()
            .expect("registry lock poisoned")
            .insert(request.id.clone(), entry);

        debug!(id = %request.id, "subscription registered");
        Ok(handle)
    }

    /// Look up the handle of an existing subscription.
    pub fn subscription(&self, id: &str) -> Option<SubscriptionHandle> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .map(|entry| entry.handle.clone())
    }

    /// Close a subscription's throttler and drop it from the registry.
    /// Installed triggers stay in place. Returns whether the id existed.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let entry = self
            .registry
            .write()
            .expect("registry lock poisoned")
            .remove(id);
        match entry {
            Some(entry) => {
                entry.throttler.close().await;
                debug!(id, "subscription removed");
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.registry.read().expect("registry lock poisoned").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan a decoded change out to every subscription that watches its
    /// table; offer a refresh signal to the throttler of each one whose
    /// policy accepts the change. Offers never block, and a signal lost to
    /// coalescing is intentional.
    pub async fn dispatch(&self, change: &Change) {
        let targets: Vec<_> = {
            let registry = self.registry.read().expect("registry lock poisoned");
            registry
                .values()
                .filter(|entry| entry.watch_spec.watches_table(&change.table))
                .map(|entry| {
                    (
                        entry.handle.clone(),
                        Arc::clone(&entry.driver),
                        entry.watch_spec.columns_for(&change.table).cloned(),
                        entry.refresh.clone(),
                        Arc::clone(&entry.throttler),
                    )
                })
                .collect()
        };

        for (handle, driver, watched, policy, throttler) in targets {
            let current = handle.current();
            let verdict = refresh::should_refresh(
                &driver,
                current.as_deref(),
                watched.as_ref(),
                &policy,
                change,
            )
            .await;

            match verdict {
                Ok(true) => {
                    trace!(id = %handle.id(), table = %change.table, "refresh signal");
                    throttler.offer();
                }
                Ok(false) => {}
                Err(e) => {
                    error!(id = %handle.id(), error = %e, "refresh policy failed");
                    (self.error_handler)(&e);
                }
            }
        }
    }

    /// Close every throttler and clear the registry.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            registry.drain().collect()
        };
        for (_, entry) in entries {
            entry.throttler.close().await;
        }
    }
}

fn default_query_error_handler() -> QueryErrorHandler {
    Arc::new(|err, query| {
        error!(error = %err, query, "subscription refresh failed");
    })
}
