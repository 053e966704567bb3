use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::connection::ConnectionId;
use crate::error::{AppError, AppResult};

use super::commands::Event;

/// Outbound push channels, one per live connection.
///
/// Each connection owns a single ordered queue drained by its socket writer,
/// so events sent to one connection arrive in send order.
#[derive(Default)]
pub struct ConnectionHub {
    peers: DashMap<ConnectionId, UnboundedSender<Event>>,
}

impl ConnectionHub {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, conn: &ConnectionId) -> UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(conn.clone(), tx);
        rx
    }

    pub fn unregister(&self, conn: &ConnectionId) { self.peers.remove(conn); }

    pub fn send(&self, conn: &ConnectionId, event: Event) -> AppResult<()> {
        let Some(tx) = self.peers.get(conn).map(|t| t.clone()) else {
            return Err(AppError::transient("peer_gone", "connection is no longer registered"));
        };
        tx.send(event).map_err(|_| AppError::transient("peer_closed", "connection writer has shut down"))
    }

    pub fn is_connected(&self, conn: &ConnectionId) -> bool { self.peers.contains_key(conn) }

    pub fn len(&self) -> usize { self.peers.len() }

    pub fn is_empty(&self) -> bool { self.peers.is_empty() }
}
