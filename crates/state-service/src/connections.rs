//! Registry of live realtime connections.
//!
//! Maps a client id to at most one [`ConnectionHandle`]. The registry is
//! process-local: a client connected to another instance is not visible
//! here.
//!
//! The map is a `DashMap`. Sends never wait: a message is pushed with
//! `try_send`, so a client that stops draining its channel loses messages
//! instead of stalling the sender or the rest of a broadcast.

use crate::clock::{SharedClock, SystemClock};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sending side of one client connection.
pub struct ConnectionHandle<M> {
    connection_id: Uuid,
    sender: mpsc::Sender<M>,
    connected_at: DateTime<Utc>,
    closed: CancellationToken,
}

// Manual impl: cloning a handle must not require `M: Clone`
impl<M> Clone for ConnectionHandle<M> {
    fn clone(&self) -> Self {
        Self {
            connection_id: self.connection_id,
            sender: self.sender.clone(),
            connected_at: self.connected_at,
            closed: self.closed.clone(),
        }
    }
}

impl<M> fmt::Debug for ConnectionHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<M> ConnectionHandle<M> {
    pub fn new(sender: mpsc::Sender<M>, connected_at: DateTime<Utc>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            sender,
            connected_at,
            closed: CancellationToken::new(),
        }
    }

    /// Create a handle together with the receiver the transport task drains.
    pub fn channel(buffer: usize, connected_at: DateTime<Utc>) -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx, connected_at), rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Token cancelled when the handle is closed. Transport tasks select on it.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Signal the transport to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the handle was closed or its receiver dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }
}

/// Client id to live connection map.
pub struct ConnectionRegistry<M> {
    connections: DashMap<String, ConnectionHandle<M>>,
    clock: SharedClock,
}

impl<M> fmt::Debug for ConnectionRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl<M> Default for ConnectionRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ConnectionRegistry<M> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            connections: DashMap::new(),
            clock,
        }
    }

    /// Open a channel for a new connection, stamped with the registry clock.
    ///
    /// The handle still has to be passed to [`ConnectionRegistry::register`].
    pub fn open(&self, buffer: usize) -> (ConnectionHandle<M>, mpsc::Receiver<M>) {
        ConnectionHandle::channel(buffer, self.clock.now())
    }

    fn publish_gauge(&self) {
        metrics::set_connections_active(self.connections.len());
    }

    /// Register a handle, replacing any existing one for the client.
    ///
    /// Returns the superseded handle. The registry does not close it; the
    /// caller must.
    pub fn register(
        &self,
        client_id: impl Into<String>,
        handle: ConnectionHandle<M>,
    ) -> Option<ConnectionHandle<M>> {
        let client_id = client_id.into();
        let connection_id = handle.connection_id;
        let previous = self.connections.insert(client_id.clone(), handle);
        self.publish_gauge();

        info!(
            target: "state.connections",
            client_id = %client_id,
            connection_id = %connection_id,
            replaced = previous.is_some(),
            "Connection registered"
        );
        previous
    }

    /// Remove the client's handle, whichever connection it belongs to.
    pub fn unregister(&self, client_id: &str) -> Option<ConnectionHandle<M>> {
        let removed = self.connections.remove(client_id).map(|(_, handle)| handle);
        if removed.is_some() {
            self.publish_gauge();
            debug!(target: "state.connections", client_id = %client_id, "Connection unregistered");
        }
        removed
    }

    /// Remove the client's handle only if it is still `connection_id`.
    ///
    /// Used on disconnect, so a superseded connection cannot evict the one
    /// that replaced it.
    pub fn unregister_connection(&self, client_id: &str, connection_id: Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(client_id, |_, handle| handle.connection_id == connection_id)
            .is_some();
        if removed {
            self.publish_gauge();
            debug!(
                target: "state.connections",
                client_id = %client_id,
                connection_id = %connection_id,
                "Connection unregistered"
            );
        }
        removed
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectionHandle<M>> {
        self.connections
            .get(client_id)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl<M> ConnectionRegistry<M> {
    /// Deliver a message to the client's current connection without waiting.
    ///
    /// Returns `false` if the client is not registered, its channel is full,
    /// or its transport has gone away. A full channel drops the message and
    /// keeps the connection; a dead transport is removed from the registry.
    pub fn send(&self, client_id: &str, message: M) -> bool {
        let Some(handle) = self.get(client_id) else {
            return false;
        };

        if !handle.is_closed() {
            match handle.sender.try_send(message) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => {
                    metrics::record_message_dropped("full");
                    warn!(
                        target: "state.connections",
                        client_id = %client_id,
                        connection_id = %handle.connection_id,
                        "Connection channel full, message dropped"
                    );
                    return false;
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        metrics::record_message_dropped("closed");
        debug!(
            target: "state.connections",
            client_id = %client_id,
            connection_id = %handle.connection_id,
            "Pruning dead connection"
        );
        self.unregister_connection(client_id, handle.connection_id);
        false
    }

    /// Send a copy of `message` to every registered client. Returns how many
    /// deliveries succeeded.
    pub fn broadcast(&self, message: M) -> usize
    where
        M: Clone,
    {
        self.client_ids()
            .iter()
            .filter(|client_id| self.send(client_id, message.clone()))
            .count()
    }
}
