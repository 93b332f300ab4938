use rumqttc::{ClientError, ConnectionError};

/// Errors surfaced by the facade, the registry, the spool and the publisher
/// loop. Variant boundaries follow the error kinds laid out in the spec:
/// validation failures never touch the spool, offline drops never touch the
/// broker, and transport failures are distinguished from spool failures so
/// callers can tell "your request was wrong" apart from "the system is
/// currently unable to honor it".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing endpoint")]
    Endpoint,
    #[error("missing thing name")]
    ThingName,
    #[error("missing certificate")]
    Certificate,
    #[error("missing private key")]
    PrivateKey,
    #[error("missing authority")]
    Ca,

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] InvalidRequest),

    #[error("publish dropped while offline (qos 0, keep_qos0_when_offline=false)")]
    OfflineDrop,

    #[error("spool is full")]
    SpoolFull,

    #[error("spool operation interrupted")]
    SpoolInterrupted,

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    ConnectionError(#[from] ConnectionError),

    #[error(transparent)]
    Mqtt(#[from] ClientError),

    #[error("operation cancelled")]
    Interrupted,
}

/// Validation failures, surfaced synchronously, never retried, never spooled.
#[derive(Debug, thiserror::Error)]
pub enum InvalidRequest {
    #[error("wildcards are not permitted in a publish topic: {0}")]
    WildcardInPublishTopic(String),
    #[error("topic exceeds maximum length of {max} bytes: {actual}")]
    TopicTooLong { max: usize, actual: usize },
    #[error("topic has too many forward slashes: max {max}, found {actual}")]
    TooManySlashes { max: usize, actual: usize },
    #[error("topic filter is malformed: {0}")]
    MalformedFilter(String),
    #[error("payload exceeds maximum size of {max} bytes: {actual}")]
    PayloadTooLarge { max: usize, actual: usize },
}

pub type Result<T> = core::result::Result<T, Error>;
