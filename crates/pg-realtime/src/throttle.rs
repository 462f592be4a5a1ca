//! Per-subscription throttling
//!
//! A leading-plus-trailing coalescer: the first signal while idle runs the
//! target immediately, further signals during the cooldown collapse into
//! at most one trailing run. The signal channel holds a single slot, so a
//! burst of offers loses everything but the most recent.
//! Runs never overlap for the same throttler; close is cooperative and an
//! in-flight run completes first.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// A per-subscription leading+trailing signal coalescer.
pub struct Throttler {
    signal: mpsc::Sender<()>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Throttler {
    /// Spawn a throttler that invokes `target` per the coalescing
    /// contract, with `window` as the cooldown interval.
    pub fn spawn<F, Fut>(window: Duration, target: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (signal_tx, mut signal_rx) = mpsc::channel::<()>(1);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                // Idle: wait for a signal.
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            return;
                        }
                    }
                    signal = signal_rx.recv() => {
                        let Some(()) = signal else { return };
                        trace!("leading-edge run");
                        target().await;

                        // Cooldown: coalesce further signals, run the
                        // trailing edge when one arrived, repeat until a
                        // window passes quietly.
                        'cooldown: loop {
                            let deadline = Instant::now() + window;
                            let mut coalesced = false;
                            loop {
                                tokio::select! {
                                    changed = stop_rx.changed() => {
                                        if changed.is_err() || *stop_rx.borrow() {
                                            return;
                                        }
                                    }
                                    _ = tokio::time::sleep_until(deadline) => break,
                                    signal = signal_rx.recv() => {
                                        let Some(()) = signal else { return };
                                        coalesced = true;
                                    }
                                }
                            }
                            if !coalesced {
                                break 'cooldown;
                            }
                            trace!("trailing-edge run");
                            target().await;
                        }
                    }
                }
            }
        });

        Self {
            signal: signal_tx,
            stop: stop_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Offer a signal without blocking. Returns false when the signal was
    /// coalesced away or the throttler is closed; both are expected.
    pub fn offer(&self) -> bool {
        self.signal.try_send(()).is_ok()
    }

    /// Close the throttler and wait for its task to finish. Pending
    /// trailing work is discarded; an in-flight run completes first.
    pub async fn close(&self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}
