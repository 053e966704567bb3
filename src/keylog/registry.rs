use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionId;
use crate::media::CaptureError;
use crate::server::commands::Event;
use crate::server::hub::ConnectionHub;

use super::source::KeySource;

#[derive(Debug, Clone)]
pub struct KeyLogSubscription {
    pub connection: ConnectionId,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<ConnectionId, KeyLogSubscription>,
    relay_task: Option<JoinHandle<()>>,
}

/// Fans one physical key source out to every subscribed connection.
///
/// The source runs exactly while the subscriber set is non-empty: the first
/// subscribe starts it, the last unsubscribe stops it. Both transitions happen
/// under the registry lock.
pub struct KeyLogRegistry {
    source: Box<dyn KeySource>,
    hub: Arc<ConnectionHub>,
    inner: Mutex<Inner>,
    this: Weak<KeyLogRegistry>,
}

impl KeyLogRegistry {
    pub fn new(source: Box<dyn KeySource>, hub: Arc<ConnectionHub>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self { source, hub, inner: Mutex::new(Inner::default()), this: this.clone() })
    }

    pub fn describe_source(&self) -> &'static str { self.source.describe() }

    /// Add `conn`; returns whether it was newly added.
    pub fn subscribe(&self, conn: &ConnectionId) -> Result<bool, CaptureError> {
        let mut inner = self.inner.lock();
        if inner.subscribers.contains_key(conn) { return Ok(false); }
        if inner.subscribers.is_empty() {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            self.source.start(tx)?;
            let this = self.this.clone();
            inner.relay_task = Some(tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    let Some(registry) = this.upgrade() else { break; };
                    registry.relay(&text);
                }
            }));
            info!(target: "keylog", "key source started");
        }
        inner.subscribers.insert(conn.clone(), KeyLogSubscription { connection: conn.clone(), started_at: Utc::now() });
        debug!(target: "keylog", conn = %conn, subscribers = inner.subscribers.len(), "subscribed");
        Ok(true)
    }

    /// Remove `conn`; returns whether it was subscribed. Idempotent.
    pub fn unsubscribe(&self, conn: &ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        if inner.subscribers.remove(conn).is_none() { return false; }
        debug!(target: "keylog", conn = %conn, subscribers = inner.subscribers.len(), "unsubscribed");
        if inner.subscribers.is_empty() {
            self.source.stop();
            if let Some(task) = inner.relay_task.take() { task.abort(); }
            info!(target: "keylog", "key source stopped");
        }
        true
    }

    /// Push `text` to every current subscriber; returns how many received it.
    /// A gone subscriber never blocks delivery to the others.
    pub fn relay(&self, text: &str) -> usize {
        let payload = text.replace("\r\n", "\n");
        let targets: Vec<ConnectionId> = self.inner.lock().subscribers.keys().cloned().collect();
        let mut delivered = 0;
        for conn in targets {
            match self.hub.send(&conn, Event::key_log(payload.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(target: "keylog", conn = %conn, "key relay skipped: {}", e),
            }
        }
        delivered
    }

    pub fn is_subscribed(&self, conn: &ConnectionId) -> bool { self.inner.lock().subscribers.contains_key(conn) }

    pub fn subscriptions(&self) -> Vec<KeyLogSubscription> { self.inner.lock().subscribers.values().cloned().collect() }

    pub fn active_count(&self) -> usize { self.inner.lock().subscribers.len() }
}
