//! Typed device configuration snapshot and change-notification stream
//! (spec §4.7/§6). The device configuration store itself is an external
//! collaborator; this module defines the lookup surface plus a couple of
//! reference implementations (`StaticConfigStore` for tests, and
//! `WatchConfigStore` for wiring to a real backend that can push updates).

use std::sync::Arc;

use tokio::sync::watch;

use crate::limits::{
    DEFAULT_KEEP_ALIVE_TIMEOUT_MS, DEFAULT_MAX_IN_FLIGHT_PUBLISHES,
    DEFAULT_MQTT_MAX_OF_PUBLISH_RETRY_COUNT, DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_PING_TIMEOUT_MS,
    DEFAULT_PORT, DEFAULT_SOCKET_TIMEOUT_MS, DEFAULT_THREAD_POOL_SIZE,
    IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES, MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES,
};

/// Kind of a single config change event, as delivered by the device
/// configuration store's change-notification stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    NodeUpdated,
    NodeRemoved,
    /// Filtered out by the reconfiguration controller — never qualifies a
    /// reconnect on its own.
    TimestampUpdated,
    /// Filtered out — a new interior (non-leaf) node appearing.
    InteriorAdded,
}

/// A single `(kind, node)` change notification. `node` is the dotted path
/// of the node that changed, e.g. `"mqtt.port"` or `"privateKeyPath"`.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub kind: ChangeKind,
    pub node: Option<String>,
}

/// Clamped, typed snapshot of the recognized `mqtt.*` options plus the
/// identity/connectivity fields every connection needs, per spec §6.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub thing_name: String,
    pub iot_data_endpoint: String,
    pub region: Option<String>,
    pub proxy_configured: bool,

    pub private_key_path: String,
    pub certificate_path: String,
    pub root_ca_path: String,

    pub operation_timeout_ms: u64,
    pub keep_alive_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    pub port: u16,
    pub thread_pool_size: usize,
    pub max_in_flight_publishes: u32,
    pub max_message_size_in_bytes: usize,
    /// `-1` means unlimited.
    pub max_publish_retry: i32,
}

impl DeviceConfig {
    /// Whether this device has enough identity/endpoint configuration to
    /// talk to the cloud at all; subscribe becomes a silent no-op and
    /// publish is rejected as an offline drop when this is false.
    pub fn is_device_configured_to_talk_to_cloud(&self) -> bool {
        !self.thing_name.is_empty() && !self.iot_data_endpoint.is_empty()
    }

    /// Applies the spec §6 clamps: `maxInFlightPublishes` capped to the
    /// IoT Core in-flight QoS 1 limit, `maxMessageSizeInBytes` capped to
    /// the hard ceiling. A config store round-trip cannot be trusted to
    /// pre-clamp, so the facade re-applies this on every snapshot.
    pub fn clamped(mut self) -> Self {
        self.max_in_flight_publishes = self
            .max_in_flight_publishes
            .min(IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES)
            .max(1);
        self.max_message_size_in_bytes = self
            .max_message_size_in_bytes
            .min(MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES);
        self
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            thing_name: String::new(),
            iot_data_endpoint: String::new(),
            region: None,
            proxy_configured: false,
            private_key_path: String::new(),
            certificate_path: String::new(),
            root_ca_path: String::new(),
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            keep_alive_timeout_ms: DEFAULT_KEEP_ALIVE_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            socket_timeout_ms: DEFAULT_SOCKET_TIMEOUT_MS,
            port: DEFAULT_PORT,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            max_in_flight_publishes: DEFAULT_MAX_IN_FLIGHT_PUBLISHES,
            max_message_size_in_bytes: crate::limits::DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES,
            max_publish_retry: DEFAULT_MQTT_MAX_OF_PUBLISH_RETRY_COUNT,
        }
    }
}

/// Device config lookup + change notification. An external collaborator
/// per spec §1; a real implementation reads a node-tree config service.
pub trait ConfigStore: Send + Sync {
    fn current(&self) -> DeviceConfig;

    /// A cloned receiver of `(kind, node)` change notifications. Every
    /// clone sees every change emitted after its creation.
    fn watch(&self) -> watch::Receiver<ConfigChange>;
}

/// Fixed, never-changing configuration — what tests and simple callers
/// reach for when there's no real config backend to watch.
pub struct StaticConfigStore {
    config: DeviceConfig,
    change_rx: watch::Receiver<ConfigChange>,
}

impl StaticConfigStore {
    pub fn new(config: DeviceConfig) -> Self {
        let (_tx, change_rx) = watch::channel(ConfigChange { kind: ChangeKind::NodeUpdated, node: None });
        Self { config: config.clamped(), change_rx }
    }
}

impl ConfigStore for StaticConfigStore {
    fn current(&self) -> DeviceConfig {
        self.config.clone()
    }

    fn watch(&self) -> watch::Receiver<ConfigChange> {
        self.change_rx.clone()
    }
}

/// Config store backed by a `watch` channel a caller can push updates
/// into, for wiring to a real backend or driving reconfiguration tests.
pub struct WatchConfigStore {
    config_rx: watch::Receiver<DeviceConfig>,
    change_tx: watch::Sender<ConfigChange>,
    change_rx: watch::Receiver<ConfigChange>,
}

impl WatchConfigStore {
    pub fn new(initial: DeviceConfig) -> (Arc<Self>, ConfigUpdater) {
        let (config_tx, config_rx) = watch::channel(initial.clamped());
        let (change_tx, change_rx) = watch::channel(ConfigChange { kind: ChangeKind::NodeUpdated, node: None });
        let store = Arc::new(Self { config_rx, change_tx: change_tx.clone(), change_rx });
        (store, ConfigUpdater { config_tx, change_tx })
    }
}

impl ConfigStore for WatchConfigStore {
    fn current(&self) -> DeviceConfig {
        self.config_rx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<ConfigChange> {
        self.change_rx.clone()
    }
}

/// The write side of a `WatchConfigStore`: the facade's caller uses this
/// to push new snapshots and emit change notifications.
pub struct ConfigUpdater {
    config_tx: watch::Sender<DeviceConfig>,
    change_tx: watch::Sender<ConfigChange>,
}

impl ConfigUpdater {
    pub fn apply(&self, config: DeviceConfig, change: ConfigChange) {
        let _ = self.config_tx.send(config.clamped());
        let _ = self.change_tx.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_caps_in_flight_and_message_size() {
        let config = DeviceConfig {
            max_in_flight_publishes: 1000,
            max_message_size_in_bytes: usize::MAX,
            ..DeviceConfig::default()
        }
        .clamped();

        assert_eq!(config.max_in_flight_publishes, IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES);
        assert_eq!(config.max_message_size_in_bytes, MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES);
    }

    #[test]
    fn not_configured_without_thing_name_or_endpoint() {
        let config = DeviceConfig::default();
        assert!(!config.is_device_configured_to_talk_to_cloud());
    }

    #[test]
    fn watch_config_store_propagates_updates() {
        let (store, updater) = WatchConfigStore::new(DeviceConfig::default());
        let mut changes = store.watch();

        let mut next = store.current();
        next.thing_name = "thing-a".to_owned();
        updater.apply(next, ConfigChange { kind: ChangeKind::NodeUpdated, node: Some("thingName".to_owned()) });

        assert!(changes.has_changed().unwrap());
        assert_eq!(store.current().thing_name, "thing-a");
    }
}
