//! Maps local subscribers to their bound connection, maps active
//! broker-side filters to the connection that owns them, and performs
//! wildcard-aware consolidation between the two (spec §4.4).
//!
//! Generalizes `beluga-mqtt`'s `SubscriberManager`, which only ever
//! tracked exact-topic-string subscriptions against a single connection,
//! to superset-aware matching across a pool of connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::topic::{is_superset_of, validate_subscribe_topic};
use crate::transport::{Publish, QosLevel};

/// Identity of a local subscriber: topic filter, requested QoS and a
/// caller-supplied callback id. Two subscribers on the same filter with
/// different callback ids are distinct registry entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalSubscriptionKey {
    pub topic_filter: String,
    pub qos: QosLevelKey,
    pub callback_id: u64,
}

/// `QosLevel` doesn't implement `Hash`/`Eq` upstream; this mirrors it for
/// use as a map-key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosLevelKey {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QosLevel> for QosLevelKey {
    fn from(value: QosLevel) -> Self {
        match value {
            QosLevel::AtMostOnce => QosLevelKey::AtMostOnce,
            QosLevel::AtLeastOnce => QosLevelKey::AtLeastOnce,
        }
    }
}

struct LocalEntry {
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<Publish>,
}

#[derive(Default)]
struct RegistryState {
    local: HashMap<LocalSubscriptionKey, LocalEntry>,
    broker: HashMap<String, ConnectionId>,
}

/// A handle a local caller uses to receive messages matching its
/// subscription. Dropping it does not automatically unsubscribe — callers
/// must call `SubscriptionRegistry::unsubscribe` explicitly, per spec
/// (unsubscribe is a distinct, synchronous facade operation).
#[derive(Debug)]
pub struct Subscriber {
    receiver: mpsc::UnboundedReceiver<Publish>,
}

impl Subscriber {
    pub async fn recv(&mut self) -> Option<Publish> {
        self.receiver.recv().await
    }
}

pub struct SubscriptionRegistry {
    pool: Arc<ConnectionPool>,
    state: RwLock<RegistryState>,
    next_callback_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            state: RwLock::new(RegistryState::default()),
            next_callback_id: AtomicU64::new(0),
        }
    }

    pub fn next_callback_id(&self) -> u64 {
        self.next_callback_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Subscribes `callback_id` to `topic_filter`. If an existing
    /// broker-side filter is already a superset, binds to it with no
    /// broker traffic; otherwise acquires a connection and issues a new
    /// broker SUBSCRIBE.
    pub async fn subscribe(
        &self,
        topic_filter: &str,
        qos: QosLevel,
        callback_id: u64,
        device_configured_for_cloud: bool,
    ) -> Result<Subscriber> {
        validate_subscribe_topic(topic_filter)?;

        let (tx, rx) = mpsc::unbounded_channel();

        if !device_configured_for_cloud {
            debug!(topic = topic_filter, "device not configured for cloud; subscribe is a silent no-op");
            return Ok(Subscriber { receiver: rx });
        }

        let mut state = self.state.write().await;

        let key = LocalSubscriptionKey {
            topic_filter: topic_filter.to_owned(),
            qos: qos.into(),
            callback_id,
        };

        if let Some((_, conn_id)) = state
            .broker
            .iter()
            .find(|(filter, _)| is_superset_of(filter, topic_filter))
        {
            let conn_id = *conn_id;
            state.local.insert(key, LocalEntry { connection: conn_id, sender: tx });
            return Ok(Subscriber { receiver: rx });
        }

        let conn = self.pool.acquire_for_subscribe().await?;
        conn.subscribe(topic_filter, qos).await?;

        state.broker.insert(topic_filter.to_owned(), conn.id);
        state.local.insert(key, LocalEntry { connection: conn.id, sender: tx });

        Ok(Subscriber { receiver: rx })
    }

    /// Removes `callback_id`'s binding to `topic_filter`. If that was the
    /// last local subscription covered by a broker-side filter, issues an
    /// UNSUBSCRIBE and rebinds any remaining overlapping locals to another
    /// surviving superset if one exists.
    pub async fn unsubscribe(&self, topic_filter: &str, callback_id: u64) -> Result<()> {
        self.unsubscribe_matching(|key| key.topic_filter == topic_filter && key.callback_id == callback_id)
            .await
    }

    /// Removes every local subscription registered under `topic_filter`,
    /// regardless of callback id. Used by a facade that doesn't expose
    /// per-call callback ids to its caller (one client, one identity).
    pub async fn unsubscribe_all(&self, topic_filter: &str) -> Result<()> {
        self.unsubscribe_matching(|key| key.topic_filter == topic_filter).await
    }

    async fn unsubscribe_matching(&self, matches: impl Fn(&LocalSubscriptionKey) -> bool) -> Result<()> {
        let mut state = self.state.write().await;

        state.local.retain(|key, _| !matches(key));

        let dead: Vec<(String, ConnectionId)> = state
            .broker
            .iter()
            .filter(|(filter, _)| {
                !state
                    .local
                    .keys()
                    .any(|local| is_superset_of(filter, &local.topic_filter))
            })
            .map(|(filter, conn)| (filter.clone(), *conn))
            .collect();

        for (filter, conn_id) in dead {
            let Some(conn) = self.pool.get(conn_id).await else {
                state.broker.remove(&filter);
                continue;
            };

            match conn.unsubscribe(&filter).await {
                Ok(()) => {
                    state.broker.remove(&filter);

                    let orphaned: Vec<LocalSubscriptionKey> = state
                        .local
                        .iter()
                        .filter(|(key, entry)| {
                            entry.connection == conn_id && is_superset_of(&filter, &key.topic_filter)
                        })
                        .map(|(key, _)| key.clone())
                        .collect();

                    for key in orphaned {
                        if let Some((replacement_filter, replacement_conn)) = state
                            .broker
                            .iter()
                            .find(|(candidate, _)| is_superset_of(candidate, &key.topic_filter))
                            .map(|(f, c)| (f.clone(), *c))
                        {
                            debug!(
                                topic = %key.topic_filter,
                                new_filter = %replacement_filter,
                                "rebinding orphaned local subscription to surviving superset"
                            );
                            if let Some(entry) = state.local.get_mut(&key) {
                                entry.connection = replacement_conn;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(filter = %filter, error = %err, "broker unsubscribe failed");
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Fans out `message`, arrived on `arriving_connection`, to every
    /// matching local subscriber. Prefers subscribers bound to the
    /// arriving connection (prevents duplicate delivery when overlapping
    /// filters span two pool connections); falls back to any matching
    /// subscriber if none are bound to the arriving connection (the
    /// broker occasionally routes a response back on the requesting
    /// connection rather than the subscribing one).
    pub async fn fanout(&self, message: Publish, arriving_connection: ConnectionId) {
        let state = self.state.read().await;

        let mut owning: Vec<&LocalEntry> = state
            .local
            .iter()
            .filter(|(key, entry)| {
                entry.connection == arriving_connection && is_superset_of(&key.topic_filter, &message.topic)
            })
            .map(|(_, entry)| entry)
            .collect();

        if owning.is_empty() {
            let fallback: Vec<&LocalEntry> = state
                .local
                .iter()
                .filter(|(key, _)| is_superset_of(&key.topic_filter, &message.topic))
                .map(|(_, entry)| entry)
                .collect();

            if !fallback.is_empty() {
                debug!(
                    topic = %message.topic,
                    connection = arriving_connection.0,
                    "message arrived on a non-owning connection; falling back to all matching subscribers"
                );
            }
            owning = fallback;
        }

        if owning.is_empty() {
            debug!(topic = %message.topic, "no local subscriber matches; dropping");
            return;
        }

        for entry in owning {
            if let Err(err) = entry.sender.send(message.clone()) {
                warn!(topic = %message.topic, error = %err, "subscriber channel closed; message not delivered");
            }
        }
    }

    pub async fn broker_subscription_count(&self) -> usize {
        self.state.read().await.broker.len()
    }

    pub async fn local_subscription_count(&self) -> usize {
        self.state.read().await.local.len()
    }
}
