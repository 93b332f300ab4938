//! Reacts to connection interrupted/resumed notifications: toggles the
//! online flag and purges volatile (QoS 0) spool entries (spec §4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::spool::Spool;

/// Single atomic flag shared across the publisher loop, the facade and the
/// event handler.
#[derive(Clone)]
pub struct OnlineFlag(Arc<AtomicBool>);

impl OnlineFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }
}

impl Default for OnlineFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionEventHandler {
    online: OnlineFlag,
    spool: Arc<dyn Spool>,
}

impl ConnectionEventHandler {
    pub fn new(online: OnlineFlag, spool: Arc<dyn Spool>) -> Self {
        Self { online, spool }
    }

    /// `false -> true` only happens here; toggling off purges QoS 0
    /// entries unless the spool is configured to keep them while offline.
    pub async fn on_interrupted(&self, reason: &str) {
        self.online.set(false);
        info!(reason, "connection interrupted; marking offline");
        if !self.spool.spool_config().keep_qos0_when_offline {
            debug!("purging QoS 0 spool entries while offline");
            self.spool.pop_all_qos0().await;
        }
    }

    /// Marking online is the caller's (the event-routing task's) job to
    /// follow up with a publisher kick — this handler only flips the flag.
    pub fn on_resumed(&self, session_present: bool) {
        self.online.set(true);
        info!(session_present, "connection resumed; marking online");
    }
}
