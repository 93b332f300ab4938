//! The MQTT transport is an external collaborator (spec §1): this module
//! only defines the interface the rest of the crate programs against, plus
//! a `rumqttc`-backed concrete implementation. Tests exercise the core
//! logic against `FakeTransport` instead of a live broker, since wire-level
//! MQTT is explicitly out of scope.

use std::sync::Arc;

use bytes::Bytes;
pub use rumqttc::QoS;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Transport as RumqttTransport};

use crate::error::{Error, Result};

/// A single inbound publish, decoupled from `rumqttc`'s own type so fake
/// transports in tests don't need to construct a real `rumqttc::Publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

/// A reduced QoS enum covering the two levels this crate supports (spec
/// explicitly excludes QoS 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QosLevel> for QoS {
    fn from(value: QosLevel) -> Self {
        match value {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Events delivered off a connection's event loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Incoming(Publish),
    Interrupted(String),
    Resumed { session_present: bool },
}

/// Operations on a single broker connection. One instance per pool slot.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()>;
    async fn unsubscribe(&self, filter: &str) -> Result<()>;
    async fn publish(&self, topic: &str, qos: QosLevel, retain: bool, payload: Bytes) -> Result<()>;
}

/// Delivers events for one connection; owned exclusively by that
/// connection's polling task.
#[async_trait::async_trait]
pub trait EventSource: Send {
    async fn poll(&mut self) -> Result<TransportEvent>;
}

/// Produces a `(TransportConnection, EventSource)` pair for a new pool slot.
/// Modeled on the `StreamFactory` pattern used by connection-pool
/// implementations in this corpus: a plain `Fn` so the pool can create
/// connections lazily without depending on a concrete transport type.
pub type ConnectionFactory =
    Arc<dyn Fn(&str) -> (Box<dyn TransportConnection>, Box<dyn EventSource>) + Send + Sync>;

/// Builds a [`ConnectionFactory`] backed by real `rumqttc` connections.
pub struct RumqttcTransport {
    endpoint: String,
    port: u16,
    transport: RumqttTransport,
}

impl RumqttcTransport {
    pub fn new(endpoint: impl Into<String>, port: u16, transport: RumqttTransport) -> Self {
        Self {
            endpoint: endpoint.into(),
            port,
            transport,
        }
    }

    pub fn factory(self: Arc<Self>) -> ConnectionFactory {
        Arc::new(move |client_id: &str| {
            let mut options = MqttOptions::new(client_id, self.endpoint.clone(), self.port);
            options.set_transport(self.transport.clone());
            let (client, event_loop) = AsyncClient::new(options, 64);
            let conn: Box<dyn TransportConnection> = Box::new(RumqttcConnection(client));
            let source: Box<dyn EventSource> = Box::new(RumqttcEventSource(event_loop));
            (conn, source)
        })
    }
}

struct RumqttcConnection(AsyncClient);

#[async_trait::async_trait]
impl TransportConnection for RumqttcConnection {
    async fn connect(&self) -> Result<()> {
        // rumqttc connects implicitly via the event loop; nothing to do here
        // beyond letting the caller know the request is accepted.
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.0.disconnect().await.map_err(Error::from)
    }

    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()> {
        self.0.subscribe(filter, qos.into()).await.map_err(Error::from)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.0.unsubscribe(filter).await.map_err(Error::from)
    }

    async fn publish(&self, topic: &str, qos: QosLevel, retain: bool, payload: Bytes) -> Result<()> {
        self.0
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(Error::from)
    }
}

struct RumqttcEventSource(rumqttc::EventLoop);

#[async_trait::async_trait]
impl EventSource for RumqttcEventSource {
    async fn poll(&mut self) -> Result<TransportEvent> {
        loop {
            match self.0.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let qos = match p.qos {
                        QoS::AtMostOnce => QosLevel::AtMostOnce,
                        _ => QosLevel::AtLeastOnce,
                    };
                    return Ok(TransportEvent::Incoming(Publish {
                        topic: p.topic,
                        payload: p.payload,
                        qos,
                        retain: p.retain,
                    }));
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return Ok(TransportEvent::Resumed {
                        session_present: ack.session_present,
                    });
                }
                Ok(_) => continue,
                Err(err) => return Err(Error::from(err)),
            }
        }
    }
}

