//! In-process fake transport standing in for a live broker, so the
//! consolidation/pool/spool/publisher stack can be exercised end to end
//! without network I/O (spec explicitly treats wire-level MQTT as an
//! external collaborator).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mqtt_spool_client::transport::{ConnectionFactory, EventSource, Publish, QosLevel, TransportConnection, TransportEvent};
use mqtt_spool_client::{Error, Result};
use tokio::sync::mpsc;

struct ConnHandle {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashSet<String>,
    publishes: Vec<(String, QosLevel, bool, Bytes)>,
    fail_next_publishes: usize,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, ConnHandle>,
    creation_order: Vec<String>,
}

pub struct FakeBroker {
    inner: Mutex<Inner>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Inner::default()) })
    }

    pub fn factory(self: &Arc<Self>) -> ConnectionFactory {
        let broker = Arc::clone(self);
        Arc::new(move |client_id: &str| {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let mut inner = broker.inner.lock().unwrap();
            inner.connections.insert(
                client_id.to_owned(),
                ConnHandle {
                    events_tx,
                    subscriptions: HashSet::new(),
                    publishes: Vec::new(),
                    fail_next_publishes: 0,
                },
            );
            inner.creation_order.push(client_id.to_owned());

            let conn: Box<dyn TransportConnection> =
                Box::new(FakeConnection { broker: Arc::clone(&broker), client_id: client_id.to_owned() });
            let source: Box<dyn EventSource> = Box::new(FakeEventSource { events_rx });
            (conn, source)
        })
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().creation_order.len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().creation_order.clone()
    }

    pub fn subscriptions_for(&self, client_id: &str) -> HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .get(client_id)
            .map(|c| c.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn publishes_for(&self, client_id: &str) -> Vec<(String, QosLevel, bool, Bytes)> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .get(client_id)
            .map(|c| c.publishes.clone())
            .unwrap_or_default()
    }

    pub fn total_publish_count(&self) -> usize {
        self.inner.lock().unwrap().connections.values().map(|c| c.publishes.len()).sum()
    }

    pub fn set_fail_next_publishes(&self, client_id: &str, count: usize) {
        if let Some(conn) = self.inner.lock().unwrap().connections.get_mut(client_id) {
            conn.fail_next_publishes = count;
        }
    }

    pub fn deliver(&self, client_id: &str, publish: Publish) {
        if let Some(conn) = self.inner.lock().unwrap().connections.get(client_id) {
            let _ = conn.events_tx.send(TransportEvent::Incoming(publish));
        }
    }

    pub fn interrupt(&self, client_id: &str, reason: &str) {
        if let Some(conn) = self.inner.lock().unwrap().connections.get(client_id) {
            let _ = conn.events_tx.send(TransportEvent::Interrupted(reason.to_owned()));
        }
    }

    pub fn resume(&self, client_id: &str, session_present: bool) {
        if let Some(conn) = self.inner.lock().unwrap().connections.get(client_id) {
            let _ = conn.events_tx.send(TransportEvent::Resumed { session_present });
        }
    }
}

struct FakeConnection {
    broker: Arc<FakeBroker>,
    client_id: String,
}

#[async_trait::async_trait]
impl TransportConnection for FakeConnection {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QosLevel) -> Result<()> {
        let mut inner = self.broker.inner.lock().unwrap();
        if let Some(conn) = inner.connections.get_mut(&self.client_id) {
            conn.subscriptions.insert(filter.to_owned());
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let mut inner = self.broker.inner.lock().unwrap();
        if let Some(conn) = inner.connections.get_mut(&self.client_id) {
            conn.subscriptions.remove(filter);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QosLevel, retain: bool, payload: Bytes) -> Result<()> {
        let mut inner = self.broker.inner.lock().unwrap();
        let Some(conn) = inner.connections.get_mut(&self.client_id) else {
            return Ok(());
        };

        if conn.fail_next_publishes > 0 {
            conn.fail_next_publishes -= 1;
            return Err(Error::Interrupted);
        }

        conn.publishes.push((topic.to_owned(), qos, retain, payload));
        Ok(())
    }
}

struct FakeEventSource {
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait::async_trait]
impl EventSource for FakeEventSource {
    async fn poll(&mut self) -> Result<TransportEvent> {
        self.events_rx.recv().await.ok_or(Error::Interrupted)
    }
}
