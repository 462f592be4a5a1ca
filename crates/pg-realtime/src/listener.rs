//! Notification listener
//!
//! One dedicated connection held in LISTEN mode on the shared channel.
//! The connection-driver task forwards raw NOTIFY payloads into an
//! unbounded staging channel; a poll task wakes on a fixed interval,
//! drains whatever arrived and offers each payload to the bounded
//! dispatch queue. On overflow the newest payload is dropped; the next
//! refresh covers any still-pending change as long as one notification
//! per table survives; otherwise the result stays stale until the next
//! mutation. Drops are counted and logged.

use crate::config::LiveQueryConfig;
use crate::error::Result;
use crate::sql;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_postgres::AsyncMessage;
use tracing::{debug, error, info, warn};

/// Listener and dispatch counters.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Notifications received from the channel.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Notifications dropped to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Payloads that failed to decode (malformed or trigger-reported).
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

/// The LISTEN connection plus its poll task.
pub(crate) struct Listener {
    // Held for the lifetime of the LISTEN session.
    client: tokio_postgres::Client,
    stop: watch::Sender<bool>,
    poll_task: JoinHandle<()>,
    conn_task: JoinHandle<()>,
    stats: Arc<ListenerStats>,
    healthy: Arc<AtomicBool>,
}

impl Listener {
    /// Connect, bootstrap the server-side assets, LISTEN, and start the
    /// poll task. Returns the listener and the receiving end of the
    /// bounded dispatch queue.
    pub(crate) async fn start(
        config: &LiveQueryConfig,
    ) -> Result<(Self, mpsc::Receiver<String>)> {
        let (client, mut connection) =
            tokio_postgres::connect(&config.connection_string, tokio_postgres::NoTls).await?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<String>();
        let conn_task = tokio::spawn(async move {
            loop {
                match std::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        if n.channel() == sql::CHANNEL {
                            let _ = raw_tx.send(n.payload().to_string());
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "listener connection error");
                        break;
                    }
                    None => break,
                }
            }
        });

        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS pgcrypto")
            .await?;
        client.batch_execute(&sql::parse_query_function_sql()).await?;
        client
            .batch_execute(&format!("LISTEN {}", sql::CHANNEL))
            .await?;
        info!(channel = sql::CHANNEL, "listening for table changes");

        let (queue_tx, queue_rx) = mpsc::channel::<String>(config.notification_buffer);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stats = Arc::new(ListenerStats::default());
        let healthy = Arc::new(AtomicBool::new(true));

        let poll_stats = Arc::clone(&stats);
        let poll_healthy = Arc::clone(&healthy);
        let interval = config.poll_interval;
        let poll_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!("listener poll task stopping");
                            return;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                loop {
                    match raw_rx.try_recv() {
                        Ok(payload) => {
                            poll_stats.record_received();
                            if queue_tx.try_send(payload).is_err() {
                                poll_stats.record_dropped();
                                warn!("notification queue full, dropping newest notification");
                            }
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            error!("listener connection lost; subscriptions are quiescent");
                            poll_healthy.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        });

        let listener = Self {
            client,
            stop: stop_tx,
            poll_task,
            conn_task,
            stats,
            healthy,
        };
        Ok((listener, queue_rx))
    }

    pub(crate) fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the listener connection is still delivering notifications.
    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Stop the poll task, then tear down the connection. The dispatch
    /// queue closes when the poll task exits, letting the dispatcher
    /// drain remaining items.
    pub(crate) async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.poll_task.await;
        drop(self.client);
        self.conn_task.abort();
        let _ = self.conn_task.await;
        debug!("listener shut down");
    }
}
