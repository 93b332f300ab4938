//! Device-side MQTT client manager: a pool of broker connections behind a
//! wildcard-consolidating subscription registry and an offline publish
//! spool, so callers get a single always-available facade regardless of
//! how many underlying connections the pool currently holds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

pub use error::{Error, InvalidRequest};

pub mod config;
mod connection;
mod error;
mod events;
pub mod limits;
mod pool;
mod publisher;
mod reconfig;
mod registry;
pub mod spool;
mod throttle;
mod topic;
pub mod transport;

pub use registry::Subscriber;
pub use spool::{PublishRequest, Spool, SpoolConfig, StorageType};
pub use transport::{ConnectionFactory, Publish, QosLevel};

use config::ConfigStore;
use connection::ConnectionId;
use events::{ConnectionEventHandler, OnlineFlag};
use pool::ConnectionPool;
use publisher::Publisher;
use reconfig::ReconfigController;
use registry::SubscriptionRegistry;
use spool::MemorySpool;
use transport::{RumqttcTransport, TransportEvent};

pub type Result<T> = core::result::Result<T, Error>;

/// Builds an [`MqttClient`]. Required fields mirror the teacher's builder:
/// thing name, endpoint and the three TLS materials. Numeric tunables are
/// optional and clamp to the same defaults/caps the device configuration
/// store would apply (spec §6), since a caller that skips the config
/// store entirely should still get sane behavior.
#[derive(Default)]
pub struct MqttClientBuilder<'a> {
    certificate: Option<&'a [u8]>,
    private_key: Option<&'a [u8]>,
    certificate_authority: Option<&'a [u8]>,
    thing_name: Option<&'a str>,
    endpoint: Option<&'a str>,
    port: u16,
    operation_timeout: Duration,
    max_in_flight_publishes: u32,
    max_publish_retry: i32,
    max_message_size: usize,
    keep_qos0_when_offline: bool,
    spool_size_in_bytes: usize,
}

impl<'a> MqttClientBuilder<'a> {
    pub fn new() -> Self {
        Self {
            port: limits::DEFAULT_PORT,
            operation_timeout: Duration::from_millis(limits::DEFAULT_OPERATION_TIMEOUT_MS),
            max_in_flight_publishes: limits::DEFAULT_MAX_IN_FLIGHT_PUBLISHES,
            max_publish_retry: limits::DEFAULT_MQTT_MAX_OF_PUBLISH_RETRY_COUNT,
            max_message_size: limits::DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES,
            keep_qos0_when_offline: false,
            spool_size_in_bytes: limits::DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES * 64,
            certificate: None,
            private_key: None,
            certificate_authority: None,
            thing_name: None,
            endpoint: None,
        }
    }

    pub const fn thing_name(mut self, name: &'a str) -> Self {
        self.thing_name = Some(name);
        self
    }

    pub const fn endpoint(mut self, endpoint: &'a str) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub const fn certificate(mut self, cert: &'a [u8]) -> Self {
        self.certificate = Some(cert);
        self
    }

    pub const fn private_key(mut self, key: &'a [u8]) -> Self {
        self.private_key = Some(key);
        self
    }

    pub const fn ca(mut self, ca: &'a [u8]) -> Self {
        self.certificate_authority = Some(ca);
        self
    }

    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub const fn max_in_flight_publishes(mut self, max: u32) -> Self {
        self.max_in_flight_publishes = max;
        self
    }

    /// `-1` means unlimited retries.
    pub const fn max_publish_retry(mut self, max: i32) -> Self {
        self.max_publish_retry = max;
        self
    }

    pub const fn max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub const fn keep_qos0_when_offline(mut self, keep: bool) -> Self {
        self.keep_qos0_when_offline = keep;
        self
    }

    pub const fn spool_size_in_bytes(mut self, size: usize) -> Self {
        self.spool_size_in_bytes = size;
        self
    }

    /// Builds an MQTT client with the configured options, TLS-connected to
    /// a single initial connection in the pool.
    pub async fn build(self) -> Result<MqttClient> {
        let thing_name = self.thing_name.ok_or(Error::ThingName)?;
        let endpoint = self.endpoint.ok_or(Error::Endpoint)?;
        let ca = self.certificate_authority.ok_or(Error::Ca)?.to_vec();
        let certificate = self.certificate.ok_or(Error::Certificate)?.to_vec();
        let private_key = self.private_key.ok_or(Error::PrivateKey)?.to_vec();

        let rumqttc_transport = rumqttc::Transport::tls(ca, (certificate, private_key).into(), None);
        let factory = Arc::new(RumqttcTransport::new(endpoint, self.port, rumqttc_transport)).factory();

        self.build_with_factory(thing_name.to_owned(), factory).await
    }

    /// Builds a client against a caller-supplied [`ConnectionFactory`]
    /// instead of a real `rumqttc` transport. Public so integration tests
    /// (and any embedder with a transport of its own) can exercise the
    /// pool/registry/spool/publisher stack without a live broker.
    pub async fn build_with_factory(self, thing_name: String, factory: ConnectionFactory) -> Result<MqttClient> {
        let max_in_flight = self
            .max_in_flight_publishes
            .min(limits::IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES)
            .max(1);
        let max_message_size = self.max_message_size.min(limits::MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES);

        let spool_config = SpoolConfig {
            keep_qos0_when_offline: self.keep_qos0_when_offline,
            spool_size_in_bytes: self.spool_size_in_bytes,
            storage_type: StorageType::Memory,
        };

        MqttClient::new(
            thing_name,
            factory,
            self.operation_timeout,
            max_in_flight,
            self.max_publish_retry,
            max_message_size,
            Arc::new(MemorySpool::new(spool_config)),
        )
        .await
    }
}

/// Facade over the connection pool, subscription registry, spool and
/// publisher loop. Cloning shares all underlying state; dropping the last
/// clone tears everything down, mirroring `SubscriberManager::drop`.
#[derive(Clone)]
pub struct MqttClient {
    thing_name: String,
    pool: Arc<ConnectionPool>,
    registry: Arc<SubscriptionRegistry>,
    spool: Arc<dyn Spool>,
    publisher: Arc<Publisher>,
    online: OnlineFlag,
    /// Live, reconfigurable payload size cap (spec §4.7 debounce step 1).
    max_message_size: Arc<AtomicUsize>,
    /// Set by [`MqttClient::watch_config`]; `None` (the default, for a
    /// caller that never attaches a config store) is treated as
    /// configured, since the builder's TLS path already established the
    /// device's identity directly.
    config: Arc<RwLock<Option<Arc<dyn ConfigStore>>>>,
    subscribe_lock: Arc<Mutex<()>>,
    close_tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient").field("thing_name", &self.thing_name).finish()
    }
}

impl MqttClient {
    async fn new(
        thing_name: String,
        factory: ConnectionFactory,
        operation_timeout: Duration,
        max_in_flight_publishes: u32,
        max_publish_retry: i32,
        max_message_size: usize,
        spool: Arc<dyn Spool>,
    ) -> Result<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ConnectionPool::new(
            factory,
            thing_name.clone(),
            operation_timeout,
            max_in_flight_publishes,
            events_tx,
        ));
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&pool)));
        let online = OnlineFlag::new();
        let publisher = Publisher::new(
            Arc::clone(&pool),
            Arc::clone(&spool),
            online.clone(),
            max_in_flight_publishes,
            max_publish_retry,
        );

        let event_handler = ConnectionEventHandler::new(online.clone(), Arc::clone(&spool));
        let registry_for_events = Arc::clone(&registry);
        let publisher_for_events = Arc::clone(&publisher);
        tokio::spawn(async move {
            while let Some((conn_id, event)) = events_rx.recv().await {
                route_event(conn_id, event, &event_handler, &registry_for_events, &publisher_for_events).await;
            }
        });

        let (close_tx, close_rx) = mpsc::channel::<()>(1);
        tokio::spawn(shutdown_listener(close_rx, Arc::clone(&pool), Arc::clone(&publisher)));

        let first = pool.acquire_for_publish().await?;
        first.connect().await?;
        online.set(true);
        publisher.kick().await;

        Ok(Self {
            thing_name,
            pool,
            registry,
            spool,
            publisher,
            online,
            max_message_size: Arc::new(AtomicUsize::new(max_message_size)),
            config: Arc::new(RwLock::new(None)),
            subscribe_lock: Arc::new(Mutex::new(())),
            close_tx,
        })
    }

    /// Wires up a reconfiguration controller against `config`, spawning the
    /// task that drives debounced reconnects (spec §4.7), and makes
    /// `config.current()` the source of truth for `subscribe`/`publish`'s
    /// cloud-configured checks. Optional: a caller with no config backend
    /// to watch never calls this.
    pub fn watch_config(&self, config: Arc<dyn ConfigStore>) {
        if let Ok(mut slot) = self.config.try_write() {
            *slot = Some(Arc::clone(&config));
        }

        let pool = Arc::clone(&self.pool);
        let publisher = Arc::clone(&self.publisher);
        let max_message_size = Arc::clone(&self.max_message_size);
        let changes = config.watch();
        tokio::spawn(async move {
            ReconfigController::new(config, pool, publisher, max_message_size).run(changes).await;
        });
    }

    /// Whether the device currently has enough identity/endpoint
    /// configuration to talk to the cloud (spec §4.4 step 2, §4.8 step 1).
    /// With no config store attached, treated as configured.
    async fn is_configured_for_cloud(&self) -> bool {
        match self.config.read().await.as_ref() {
            Some(config) => config.current().is_device_configured_to_talk_to_cloud(),
            None => true,
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    pub fn connected(&self) -> bool {
        self.online.get()
    }

    /// Subscribes to `topic_filter` at `qos`, consolidating against any
    /// existing broker-side superset filter (spec §4.4). Serialized against
    /// concurrent `subscribe`/`unsubscribe` calls on this client instance.
    pub async fn subscribe(&self, topic_filter: &str, qos: QosLevel) -> Result<Subscriber> {
        let _guard = self.subscribe_lock.lock().await;
        let configured = self.is_configured_for_cloud().await;
        let callback_id = self.registry.next_callback_id();
        self.registry.subscribe(topic_filter, qos, callback_id, configured).await
    }

    /// Removes this client's subscription(s) to `topic_filter`. One
    /// `MqttClient` carries a single caller identity, so this drops every
    /// local entry registered under the filter regardless of which
    /// `subscribe` call created it.
    pub async fn unsubscribe(&self, topic_filter: &str) -> Result<()> {
        let _guard = self.subscribe_lock.lock().await;
        self.registry.unsubscribe_all(topic_filter).await
    }

    /// Publishes `payload` to `topic`. Validates the topic and payload
    /// size synchronously; when offline, QoS 0 publishes are dropped
    /// unless the spool is configured to keep them, matching spec §4.7.
    /// The returned future resolves once the request is durably
    /// spool-enqueued, not once the broker has acknowledged it (see
    /// DESIGN.md's Open Question decision).
    pub async fn publish(&self, topic: &str, qos: QosLevel, retain: bool, payload: Bytes) -> Result<()> {
        if !self.is_configured_for_cloud().await {
            debug!(topic, "device not configured for cloud; rejecting as a spool-store failure");
            return Err(Error::SpoolFull);
        }

        topic::validate_publish_topic(topic)?;
        let max_message_size = self.max_message_size.load(Ordering::SeqCst);
        if payload.len() > max_message_size {
            return Err(InvalidRequest::PayloadTooLarge {
                max: max_message_size,
                actual: payload.len(),
            }
            .into());
        }

        if !self.online.get()
            && matches!(qos, QosLevel::AtMostOnce)
            && !self.spool.spool_config().keep_qos0_when_offline
        {
            debug!(topic, "offline and qos0 drop policy active; dropping publish");
            return Err(Error::OfflineDrop);
        }

        let request = PublishRequest {
            topic: topic.to_owned(),
            payload,
            qos,
            retain,
        };

        self.spool.add_message(request).await?;
        self.publisher.kick().await;
        Ok(())
    }

    /// Idempotent graceful shutdown: cancels the publisher loop (any
    /// popped-but-unpublished id is re-enqueued) and closes every pool
    /// connection.
    pub async fn close(&self) {
        let _ = self.close_tx.try_send(());
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.close_tx.try_send(());
    }
}

async fn route_event(
    conn_id: ConnectionId,
    event: TransportEvent,
    event_handler: &ConnectionEventHandler,
    registry: &SubscriptionRegistry,
    publisher: &Arc<Publisher>,
) {
    match event {
        TransportEvent::Incoming(publish) => {
            registry.fanout(publish, conn_id).await;
        }
        TransportEvent::Interrupted(reason) => {
            event_handler.on_interrupted(&reason).await;
        }
        TransportEvent::Resumed { session_present } => {
            event_handler.on_resumed(session_present);
            publisher.kick().await;
        }
    }
}

async fn shutdown_listener(mut close_rx: mpsc::Receiver<()>, pool: Arc<ConnectionPool>, publisher: Arc<Publisher>) {
    if close_rx.recv().await.is_some() {
        debug!("closing mqtt client");
        publisher.shutdown().await;
        pool.close().await;
    }
}
