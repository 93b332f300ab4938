//! Single worker draining the spool: bounded in-flight publishes,
//! per-connection throttle wait, retry/drop policy (spec §4.5).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::events::OnlineFlag;
use crate::pool::ConnectionPool;
use crate::spool::Spool;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Adds up to 50% jitter to a backoff so a fleet reconnecting after a
/// shared broker-side disruption doesn't retry in lockstep.
fn jittered(base: Duration) -> Duration {
    let extra_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(extra_ms)
}

pub struct Publisher {
    pool: Arc<ConnectionPool>,
    spool: Arc<dyn Spool>,
    online: OnlineFlag,
    max_in_flight_publishes: AtomicU32,
    max_publish_retry_count: i32,
    kick_notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Publisher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        spool: Arc<dyn Spool>,
        online: OnlineFlag,
        max_in_flight_publishes: u32,
        max_publish_retry_count: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            spool,
            online,
            max_in_flight_publishes: AtomicU32::new(max_in_flight_publishes),
            max_publish_retry_count,
            kick_notify: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        })
    }

    /// Applies a newly reconfigured in-flight bound (spec §4.7 debounce
    /// step 1). Takes effect for the next headroom check in `run`'s loop.
    pub fn set_max_in_flight_publishes(&self, value: u32) {
        self.max_in_flight_publishes.store(value, Ordering::SeqCst);
    }

    /// Starts the loop if it is not already running; otherwise wakes a
    /// loop that is currently idle-waiting (e.g. for `online` to flip, or
    /// for in-flight headroom). Idempotent per spec §4.5.
    pub async fn kick(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        let needs_spawn = match handle.as_ref() {
            Some(h) => h.is_finished(),
            None => true,
        };

        if needs_spawn {
            let this = Arc::clone(self);
            *handle = Some(tokio::spawn(async move { this.run().await }));
        } else {
            self.kick_notify.notify_one();
        }
    }

    /// Cancels the loop (interrupt-style) and waits for it to exit. Any id
    /// already popped from the spool but not yet dispatched is re-enqueued
    /// before exit, preserving at-least-once delivery across shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
        self.spool.interrupt();

        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn wait_or_shutdown(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.shutdown_notify.notified() => {}
        }
    }

    async fn ensure_primary_connected(&self) -> bool {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }

            match self.pool.acquire_for_publish().await {
                Ok(conn) => {
                    if conn.state() == crate::connection::ConnectionState::Connected {
                        return true;
                    }
                    match conn.connect().await {
                        Ok(()) => return true,
                        Err(err) => {
                            warn!(error = %err, "primary connection failed; retrying");
                            self.wait_or_shutdown(jittered(RECONNECT_BACKOFF)).await;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "could not acquire a connection for publishing; retrying");
                    self.wait_or_shutdown(jittered(RECONNECT_BACKOFF)).await;
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut in_flight = JoinSet::new();

        'outer: loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if !self.ensure_primary_connected().await {
                break;
            }

            while self.online.get() && !self.shutdown.load(Ordering::SeqCst) {
                while in_flight.len() >= self.max_in_flight_publishes.load(Ordering::SeqCst) as usize {
                    tokio::select! {
                        result = in_flight.join_next() => {
                            if let Some(Err(join_err)) = result {
                                error!(error = %join_err, "publish task panicked");
                            }
                        }
                        () = self.shutdown_notify.notified() => {}
                    }
                    if self.shutdown.load(Ordering::SeqCst) {
                        break 'outer;
                    }
                }

                let Some(conn) = self.pool.least_throttled().await else {
                    self.wait_or_shutdown(jittered(RECONNECT_BACKOFF)).await;
                    continue;
                };

                let wait = conn.throttling_wait().await;
                self.wait_or_shutdown(wait).await;
                if self.shutdown.load(Ordering::SeqCst) {
                    break 'outer;
                }

                let id = match self.spool.pop_id().await {
                    Ok(id) => id,
                    Err(Error::Interrupted) => break 'outer,
                    Err(err) => {
                        warn!(error = %err, "spool pop failed; retrying");
                        continue;
                    }
                };

                if self.shutdown.load(Ordering::SeqCst) {
                    self.spool.add_id(id).await;
                    break 'outer;
                }

                let Some(entry) = self.spool.get_message_by_id(id).await else {
                    continue;
                };

                let spool = Arc::clone(&self.spool);
                let max_retry = self.max_publish_retry_count;
                let conn = Arc::clone(&conn);

                in_flight.spawn(async move {
                    let request = entry.request.clone();
                    let result = conn
                        .publish(&request.topic, request.qos, request.retain, request.payload)
                        .await;

                    match result {
                        Ok(()) => {
                            spool.remove_message_by_id(id).await;
                        }
                        Err(err) => {
                            let unlimited = max_retry < 0;
                            let should_retry = unlimited || i64::from(entry.retried) < i64::from(max_retry);
                            if should_retry {
                                debug!(id, error = %err, retried = entry.retried, "publish failed, re-enqueueing");
                                spool.add_id(id).await;
                            } else {
                                error!(id, error = %err, "publish permanently failed after max retries; dropping");
                            }
                        }
                    }
                });
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Offline: wait to be kicked again by `on_resumed`.
            self.kick_notify.notified().await;
        }

        while in_flight.join_next().await.is_some() {}
    }
}
