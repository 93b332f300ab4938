//! Reacts to device configuration changes that force reconnection, with a
//! cancel-and-reschedule debounce so a burst of related changes produces
//! exactly one reconnect wave (spec §4.7).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ChangeKind, ConfigChange, ConfigStore};
use crate::limits::RECONFIGURE_DEBOUNCE;
use crate::pool::ConnectionPool;
use crate::publisher::Publisher;

const RECONNECT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

fn jittered(base: Duration) -> Duration {
    let extra_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(extra_ms)
}

/// Node paths whose change mandates a reconnect, per spec §4.7. A node
/// "qualifies" if it is this path or a descendant of it (dotted-prefix
/// match).
const RECONNECT_NODES: &[&str] = &[
    "mqtt",
    "thingName",
    "iotDataEndpoint",
    "privateKeyPath",
    "certificatePath",
    "rootCaPath",
];

fn is_descendant_of(node: &str, ancestor: &str) -> bool {
    node == ancestor || node.starts_with(&format!("{ancestor}."))
}

fn qualifies(change: &ConfigChange, proxy_configured: bool) -> bool {
    if matches!(change.kind, ChangeKind::TimestampUpdated | ChangeKind::InteriorAdded) {
        return false;
    }

    let Some(node) = change.node.as_deref() else {
        return false;
    };

    if RECONNECT_NODES.iter().any(|ancestor| is_descendant_of(node, ancestor)) {
        return true;
    }

    is_descendant_of(node, "region") && proxy_configured
}

/// Owns the debounce task. Created alongside the facade and driven by a
/// background task subscribed to the config store's change stream.
pub struct ReconfigController {
    config: Arc<dyn ConfigStore>,
    pool: Arc<ConnectionPool>,
    publisher: Arc<Publisher>,
    max_message_size: Arc<AtomicUsize>,
}

impl ReconfigController {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        pool: Arc<ConnectionPool>,
        publisher: Arc<Publisher>,
        max_message_size: Arc<AtomicUsize>,
    ) -> Self {
        Self { config, pool, publisher, max_message_size }
    }

    /// Runs until `changes` closes. Every qualifying change (re)starts a
    /// 1-second debounce timer; when the timer elapses with no further
    /// qualifying change in the window, reconnects every pool connection,
    /// retrying individual failures until all succeed.
    pub async fn run(&self, mut changes: watch::Receiver<ConfigChange>) {
        loop {
            if changes.changed().await.is_err() {
                return;
            }

            let change = changes.borrow_and_update().clone();
            let proxy_configured = self.config.current().proxy_configured;
            if !qualifies(&change, proxy_configured) {
                continue;
            }

            debug!(node = ?change.node, "qualifying config change observed; starting debounce");

            loop {
                tokio::select! {
                    result = changes.changed() => {
                        if result.is_err() {
                            return;
                        }
                        let next = changes.borrow_and_update().clone();
                        if qualifies(&next, self.config.current().proxy_configured) {
                            debug!(node = ?next.node, "debounce window extended by new qualifying change");
                            continue;
                        }
                    }
                    () = tokio::time::sleep(RECONFIGURE_DEBOUNCE) => {
                        break;
                    }
                }
            }

            self.apply_publish_limits();
            self.reconnect_all().await;
        }
    }

    /// Spec §4.7 debounce step 1: re-reads the config store's clamped
    /// `maxInFlightPublishes`/`maxMessageSizeInBytes` and pushes them into
    /// the live publisher/facade state before reconnecting.
    fn apply_publish_limits(&self) {
        let config = self.config.current().clamped();
        self.publisher.set_max_in_flight_publishes(config.max_in_flight_publishes);
        self.max_message_size.store(config.max_message_size_in_bytes, Ordering::SeqCst);
        info!(
            max_in_flight_publishes = config.max_in_flight_publishes,
            max_message_size_in_bytes = config.max_message_size_in_bytes,
            "applied reconfigured publish limits"
        );
    }

    async fn reconnect_all(&self) {
        info!("reconnecting all pool connections after qualifying configuration change");
        for conn in self.pool.all().await {
            loop {
                match conn.reconnect().await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(connection = conn.id.0, error = %err, "reconnect failed; retrying");
                        tokio::time::sleep(RECONNECT_RETRY_BACKOFF).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thing_name_change_qualifies() {
        let change = ConfigChange { kind: ChangeKind::NodeUpdated, node: Some("thingName".to_owned()) };
        assert!(qualifies(&change, false));
    }

    #[test]
    fn mqtt_descendant_qualifies() {
        let change = ConfigChange { kind: ChangeKind::NodeUpdated, node: Some("mqtt.port".to_owned()) };
        assert!(qualifies(&change, false));
    }

    #[test]
    fn region_change_only_qualifies_with_proxy() {
        let change = ConfigChange { kind: ChangeKind::NodeUpdated, node: Some("region".to_owned()) };
        assert!(!qualifies(&change, false));
        assert!(qualifies(&change, true));
    }

    #[test]
    fn timestamp_updated_never_qualifies() {
        let change = ConfigChange { kind: ChangeKind::TimestampUpdated, node: Some("mqtt.port".to_owned()) };
        assert!(!qualifies(&change, true));
    }

    #[test]
    fn interior_added_never_qualifies() {
        let change = ConfigChange { kind: ChangeKind::InteriorAdded, node: Some("mqtt".to_owned()) };
        assert!(!qualifies(&change, true));
    }

    #[test]
    fn unrelated_node_does_not_qualify() {
        let change = ConfigChange { kind: ChangeKind::NodeUpdated, node: Some("logging.level".to_owned()) };
        assert!(!qualifies(&change, true));
    }
}
