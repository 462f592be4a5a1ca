//! System lifecycle
//!
//! [`LiveQueries`] ties the pieces together: the listener connection with
//! its poll task, the dispatcher draining the notification queue, and the
//! subscription registry. One instance per process is the intended shape;
//! the caller owns its lifetime.
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
//! let handle = system
//!     .subscribe(SubscribeRequest::new(
//!         "open-orders",
//!         driver,
//!         "SELECT id, status FROM orders WHERE status <> 'done'",
//!     ))
//!     .await?;
//!
//! handle.watch("ui", |_old, new| println!("now {} open orders", new.len()));
//! # Ok(())
//! # }
//! ```

use crate::config::LiveQueryConfig;
use crate::decoder;
use crate::error::{ErrorHandler, LiveQueryError, Result};
use crate::listener::{Listener, ListenerStats};
use crate::subscription::{SubscribeRequest, SubscriptionHandle, SubscriptionManager};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// The live-query system: listener, dispatcher and subscription registry.
pub struct LiveQueries {
    manager: Arc<SubscriptionManager>,
    listener: Listener,
    dispatcher: JoinHandle<()>,
}

impl LiveQueries {
    /// Start the system: open the listener connection, install the
    /// `pgcrypto` extension and the parse-query routine, LISTEN on the
    /// shared channel, and spawn the poll and dispatch tasks.
    pub async fn start(config: LiveQueryConfig) -> Result<Self> {
        config.validate()?;
        let error_handler = config
            .error_handler
            .clone()
            .unwrap_or_else(default_error_handler);

        let (listener, mut queue_rx) = Listener::start(&config).await?;
        let manager = Arc::new(SubscriptionManager::new(Arc::clone(&error_handler)));

        let dispatcher = tokio::spawn({
            let manager = Arc::clone(&manager);
            let stats = listener.stats();
            async move {
                while let Some(payload) = queue_rx.recv().await {
                    match decoder::decode(&payload) {
                        Ok(change) => manager.dispatch(&change).await,
                        Err(e) => {
                            if matches!(e, LiveQueryError::Decode(_)) {
                                stats.record_decode_error();
                            }
                            error_handler(&e);
                        }
                    }
                }
                debug!("dispatcher stopped");
            }
        });

        info!("live-query system started");
        Ok(Self {
            manager,
            listener,
            dispatcher,
        })
    }

    /// Open (or supersede) a subscription. See
    /// [`SubscriptionManager::subscribe`] for the exact sequence.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscriptionHandle> {
        self.manager.subscribe(request).await
    }

    /// Handle of an existing subscription, if the id is registered.
    pub fn subscription(&self, id: &str) -> Option<SubscriptionHandle> {
        self.manager.subscription(id)
    }

    /// Close a subscription. Installed triggers stay in place.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.manager.unsubscribe(id).await
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.manager.len()
    }

    /// Listener and dispatch counters.
    pub fn stats(&self) -> Arc<ListenerStats> {
        self.listener.stats()
    }

    /// Whether the listener connection is still delivering notifications.
    /// Reconnection is the caller's call: stop this instance and start a
    /// fresh one.
    pub fn is_healthy(&self) -> bool {
        self.listener.is_healthy()
    }

    /// Shut the system down: close every throttler, stop the poll task,
    /// close the listener connection and clear the registry. Triggers are
    /// not uninstalled; use
    /// [`destroy_objects`](crate::trigger::destroy_objects) for that.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
        self.listener.shutdown().await;
        let _ = self.dispatcher.await;
        info!("live-query system shut down");
    }
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|err| {
        error!(error = %err, code = err.error_code(), "live-query error");
    })
}
