//! Constants mirroring the device configuration defaults and hard caps.

/// Maximum number of broker-side subscriptions a single connection may own.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 50;

/// IoT-Core-imposed ceiling on concurrently in-flight QoS 1 publishes per connection.
pub const IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES: u32 = 100;

/// Hard ceiling on publish payload size, in bytes.
pub const MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES: usize = 268_435_456;

/// Default publish payload size cap, in bytes.
pub const DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES: usize = 131_072;

/// Maximum number of `/`-separated levels (minus one) a non-reserved topic may contain.
pub const MAX_NUMBER_OF_FORWARD_SLASHES: usize = 7;

/// Maximum topic length in bytes, after reserved-prefix stripping.
pub const MAX_LENGTH_OF_TOPIC: usize = 256;

/// Default bound on publish retry attempts before a spool entry is dropped.
/// `-1` means unlimited.
pub const DEFAULT_MQTT_MAX_OF_PUBLISH_RETRY_COUNT: i32 = 100;

/// `mqtt.operationTimeoutMs` default.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;

/// `mqtt.keepAliveTimeoutMs` default.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT_MS: u64 = 60_000;

/// `mqtt.pingTimeoutMs` default.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 30_000;

/// `mqtt.socketTimeoutMs` default.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 3_000;

/// `mqtt.port` default.
pub const DEFAULT_PORT: u16 = 8883;

/// `mqtt.threadPoolSize` default.
pub const DEFAULT_THREAD_POOL_SIZE: usize = 1;

/// `mqtt.maxInFlightPublishes` default.
pub const DEFAULT_MAX_IN_FLIGHT_PUBLISHES: u32 = 5;

/// Reconfiguration debounce window.
pub const RECONFIGURE_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(1);

/// Case-insensitive Basic Ingest prefix: `$aws/rules/<rule>/`.
pub const BASIC_INGEST_PREFIX_SEGMENTS: usize = 3;

pub(crate) fn is_basic_ingest_prefix(first_two_segments: (&str, &str)) -> bool {
    first_two_segments.0.eq_ignore_ascii_case("$aws") && first_two_segments.1.eq_ignore_ascii_case("rules")
}
