//! A single broker connection: connect/reconnect/close, per-operation
//! timeout, subscription bookkeeping and a publish-rate throttle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::limits::MAX_SUBSCRIPTIONS_PER_CONNECTION;
use crate::throttle::TokenBucket;
use crate::transport::{ConnectionFactory, EventSource, QosLevel, TransportConnection, TransportEvent};

/// Opaque handle identifying a pool slot. Stable for the connection's
/// lifetime; once reclaimed, a `ConnectionId` must not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// One broker connection. Owns a transport connection/event-source pair
/// and forwards inbound events to the owner (pool/registry) over a
/// channel, per the "message channel, not a back-pointer" design note.
pub struct Connection {
    pub id: ConnectionId,
    client_id: String,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    subscription_count: AtomicUsize,
    in_flight_publishes: AtomicU32,
    pending_subscribes: StdMutex<HashSet<String>>,
    throttle: Mutex<TokenBucket>,
    timeout: Duration,
    transport: Box<dyn TransportConnection>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &*self.state_rx.borrow())
            .field("subscription_count", &self.subscription_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    /// Creates a connection slot and spawns the task that polls its event
    /// source, forwarding every event to `events_tx` tagged with `id`.
    pub fn spawn(
        id: ConnectionId,
        client_id: String,
        factory: &ConnectionFactory,
        timeout: Duration,
        max_in_flight_publishes: u32,
        events_tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    ) -> Self {
        let (transport, mut source): (Box<dyn TransportConnection>, Box<dyn EventSource>) =
            factory(&client_id);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let poll_task = tokio::spawn(async move {
            loop {
                match source.poll().await {
                    Ok(event) => {
                        if events_tx.send((id, event)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, connection = id.0, "transport event source error");
                        break;
                    }
                }
            }
        });

        Self {
            id,
            client_id,
            state_tx,
            state_rx,
            subscription_count: AtomicUsize::new(0),
            in_flight_publishes: AtomicU32::new(0),
            pending_subscribes: StdMutex::new(HashSet::new()),
            throttle: Mutex::new(TokenBucket::new(
                max_in_flight_publishes.max(1),
                f64::from(max_in_flight_publishes.max(1)),
            )),
            timeout,
            transport,
            poll_task: Mutex::new(Some(poll_task)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Blocks (bounded by the connection's operation timeout) until the
    /// connection reaches `Connected`, or returns an error if it settles
    /// into `Closing`/`Closed` first.
    async fn wait_connected(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return Err(Error::Interrupted);
                }
                match *rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closing | ConnectionState::Closed => return Err(Error::Interrupted),
                    _ => continue,
                }
            }
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }

    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        self.transport.connect().await?;
        self.set_state(ConnectionState::Connected);
        debug!(connection = self.id.0, client_id = %self.client_id, "connected");
        Ok(())
    }

    /// Idempotent teardown + reconnect: drives `Connected -> Connecting ->
    /// Connected` (or establishes the initial connection if not yet up).
    pub async fn reconnect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Connecting);
            let _ = self.transport.disconnect().await;
        }
        self.connect().await
    }

    pub async fn close(&self) -> Result<()> {
        self.set_state(ConnectionState::Closing);
        let result = self.transport.disconnect().await;
        self.set_state(ConnectionState::Closed);
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }
        result
    }

    /// Same as `close`, but never surfaces an error — used when tearing
    /// down the whole pool on facade shutdown.
    pub async fn close_on_shutdown(&self) {
        if let Err(err) = self.close().await {
            warn!(error = %err, connection = self.id.0, "error while closing connection on shutdown");
        }
    }

    pub async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()> {
        {
            let mut pending = self.pending_subscribes.lock().unwrap();
            if pending.contains(filter) {
                return Err(Error::Timeout);
            }
            pending.insert(filter.to_owned());
        }

        self.wait_connected().await?;
        let result = tokio::time::timeout(self.timeout, self.transport.subscribe(filter, qos)).await;

        match result {
            Ok(Ok(())) => {
                self.pending_subscribes.lock().unwrap().remove(filter);
                self.subscription_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(err)) => {
                self.pending_subscribes.lock().unwrap().remove(filter);
                Err(err)
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.wait_connected().await?;
        tokio::time::timeout(self.timeout, self.transport.unsubscribe(filter))
            .await
            .map_err(|_| Error::Timeout)??;
        self.subscription_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn publish(&self, topic: &str, qos: QosLevel, retain: bool, payload: Bytes) -> Result<()> {
        self.wait_connected().await?;
        self.in_flight_publishes.fetch_add(1, Ordering::SeqCst);
        self.throttle.lock().await.acquire();
        let result = tokio::time::timeout(
            self.timeout,
            self.transport.publish(topic, qos, retain, payload),
        )
        .await;
        self.in_flight_publishes.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_count.load(Ordering::SeqCst)
    }

    pub fn has_pending_subscribe(&self) -> bool {
        !self.pending_subscribes.lock().unwrap().is_empty()
    }

    pub fn can_accept_subscription(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.subscription_count() < MAX_SUBSCRIPTIONS_PER_CONNECTION
            && !self.has_pending_subscribe()
    }

    pub fn is_closable(&self) -> bool {
        self.subscription_count() == 0 && !self.has_pending_subscribe()
    }

    /// The wait that would make the next publish on this connection
    /// non-blocking. The publisher loop sleeps this, then proceeds.
    pub async fn throttling_wait(&self) -> Duration {
        self.throttle.lock().await.wait_for_next_token()
    }
}
