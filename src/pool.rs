//! Ordered set of broker connections. Grows lazily when no existing
//! connection can accept a new subscription, reclaims idle duplicates
//! opportunistically, and hands out connections for publish round-robin
//! or by least-throttled selection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionId};
use crate::error::Result;
use crate::transport::{ConnectionFactory, TransportEvent};

pub struct ConnectionPool {
    connections: RwLock<Vec<Arc<Connection>>>,
    factory: ConnectionFactory,
    client_id_prefix: String,
    timeout: Duration,
    max_in_flight_publishes: u32,
    events_tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    next_id: AtomicU64,
    round_robin: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(
        factory: ConnectionFactory,
        client_id_prefix: String,
        timeout: Duration,
        max_in_flight_publishes: u32,
        events_tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    ) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            factory,
            client_id_prefix,
            timeout,
            max_in_flight_publishes,
            events_tx,
            next_id: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn new_connection(&self) -> Arc<Connection> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let client_id = format!("{}-{}", self.client_id_prefix, id.0);
        Arc::new(Connection::spawn(
            id,
            client_id,
            &self.factory,
            self.timeout,
            self.max_in_flight_publishes,
            self.events_tx.clone(),
        ))
    }

    /// Returns a connection able to accept a new subscription, creating and
    /// connecting one if none currently can (spec §4.3).
    pub async fn acquire_for_subscribe(&self) -> Result<Arc<Connection>> {
        {
            let conns = self.connections.read().await;
            if let Some(c) = conns.iter().find(|c| c.can_accept_subscription()) {
                return Ok(c.clone());
            }
        }

        let mut conns = self.connections.write().await;
        if let Some(c) = conns.iter().find(|c| c.can_accept_subscription()) {
            return Ok(c.clone());
        }

        let new_conn = self.new_connection();
        new_conn.connect().await?;
        info!(connection = new_conn.id.0, "grew pool for new subscription");
        conns.push(new_conn.clone());
        self.reclaim_idle(&mut conns).await;
        Ok(new_conn)
    }

    /// Returns a connection for publishing, round-robin over the pool,
    /// creating one if the pool is empty.
    pub async fn acquire_for_publish(&self) -> Result<Arc<Connection>> {
        {
            let conns = self.connections.read().await;
            if !conns.is_empty() {
                let idx = self.round_robin.fetch_add(1, Ordering::SeqCst) % conns.len();
                return Ok(conns[idx].clone());
            }
        }

        let mut conns = self.connections.write().await;
        if conns.is_empty() {
            let new_conn = self.new_connection();
            new_conn.connect().await?;
            conns.push(new_conn.clone());
            return Ok(new_conn);
        }
        let idx = self.round_robin.fetch_add(1, Ordering::SeqCst) % conns.len();
        Ok(conns[idx].clone())
    }

    /// Scans the pool for the connection whose throttle would block the
    /// least; used by the publisher loop instead of round robin so it can
    /// make forward progress on whichever connection has headroom.
    pub async fn least_throttled(&self) -> Option<Arc<Connection>> {
        let conns = self.connections.read().await;
        if conns.is_empty() {
            return None;
        }

        let mut best: Option<(Arc<Connection>, Duration)> = None;
        for conn in conns.iter() {
            let wait = conn.throttling_wait().await;
            if best.as_ref().map(|(_, w)| wait < *w).unwrap_or(true) {
                best = Some((conn.clone(), wait));
            }
        }
        best.map(|(conn, _)| conn)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.iter().find(|c| c.id == id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.clone()
    }

    pub async fn any_connected(&self) -> bool {
        self.connections
            .read()
            .await
            .iter()
            .any(|c| c.state() == crate::connection::ConnectionState::Connected)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Closes and removes every closable connection from the pool, except
    /// it always keeps at least one connection so a following publish/
    /// subscribe has somewhere to go.
    async fn reclaim_idle(&self, conns: &mut Vec<Arc<Connection>>) {
        let acceptable = conns.iter().filter(|c| c.can_accept_subscription()).count();
        if acceptable <= 1 {
            return;
        }

        let mut kept_one_closable = false;
        let mut keep = Vec::with_capacity(conns.len());
        for conn in conns.drain(..) {
            if conn.is_closable() {
                if kept_one_closable {
                    debug!(connection = conn.id.0, "reclaiming idle connection");
                    conn.close_on_shutdown().await;
                    continue;
                }
                kept_one_closable = true;
            }
            keep.push(conn);
        }
        *conns = keep;
    }

    /// Tears down every connection in the pool and empties it.
    pub async fn close(&self) {
        let mut conns = self.connections.write().await;
        for conn in conns.drain(..) {
            conn.close_on_shutdown().await;
        }
    }
}
