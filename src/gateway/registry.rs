//! Connection Registry
//!
//! In-process table of live connections keyed by connection id, with indexes
//! by user and by channel. Owns the connection handles and their metadata;
//! connections are never shared across processes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use super::frames::ServerFrame;
use crate::domain::{ChannelId, ConnectionId, Identity, UserId};
use crate::infrastructure::metrics;

/// Liveness classification maintained by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
}

/// Socket session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

/// Why a connection left the registry, recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    ClientClosed,
    TransportError,
    HeartbeatTimeout,
    QueueOverflow,
    Shutdown,
}

impl DisconnectCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectCause::ClientClosed => "client_closed",
            DisconnectCause::TransportError => "transport_error",
            DisconnectCause::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectCause::QueueOverflow => "queue_overflow",
            DisconnectCause::Shutdown => "shutdown",
        }
    }
}

/// Result of pushing a frame onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Queue is at its configured depth; the connection is a slow consumer.
    Full,
    /// Connection already closed.
    Closed,
}

/// One live socket session. The handle owns the outbound queue sender; the
/// write task on the other end drains it into the socket, so pushes never
/// block and delivery never interferes with probing.
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    username: String,
    device_id: String,
    sender: Mutex<Option<mpsc::Sender<ServerFrame>>>,
    channels: RwLock<HashSet<ChannelId>>,
    last_heartbeat: Mutex<Instant>,
    liveness: AtomicU8,
    state: AtomicU8,
    closed: Notify,
}

impl ConnectionHandle {
    pub fn new(identity: Identity, device_id: String, sender: mpsc::Sender<ServerFrame>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: identity.user_id,
            username: identity.username,
            device_id,
            sender: Mutex::new(Some(sender)),
            channels: RwLock::new(HashSet::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            liveness: AtomicU8::new(Liveness::Alive as u8),
            state: AtomicU8::new(ConnectionState::Open as u8),
            closed: Notify::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Snapshot of the channels this connection is subscribed to.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.channels.read().iter().copied().collect()
    }

    pub fn is_subscribed(&self, channel_id: ChannelId) -> bool {
        self.channels.read().contains(&channel_id)
    }

    /// Enqueue a frame for delivery. Non-blocking: a full queue is reported
    /// to the caller, which treats the connection as dead.
    pub fn push(&self, frame: ServerFrame) -> Result<(), PushError> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            None => Err(PushError::Closed),
            Some(tx) => tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PushError::Full,
                mpsc::error::TrySendError::Closed(_) => PushError::Closed,
            }),
        }
    }

    /// Record heartbeat activity: refresh the timestamp and restore ALIVE.
    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
        self.liveness.store(Liveness::Alive as u8, Ordering::Release);
    }

    /// Time since the last heartbeat (or since the connection opened).
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn liveness(&self) -> Liveness {
        match self.liveness.load(Ordering::Acquire) {
            0 => Liveness::Alive,
            1 => Liveness::Suspect,
            _ => Liveness::Dead,
        }
    }

    pub fn mark_suspect(&self) {
        self.liveness.store(Liveness::Suspect as u8, Ordering::Release);
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Close the outbound side. The write task drains whatever is already
    /// queued and then shuts the socket; further pushes fail with `Closed`.
    pub(crate) fn close(&self) {
        self.state
            .store(ConnectionState::Closing as u8, Ordering::Release);
        self.liveness.store(Liveness::Dead as u8, Ordering::Release);
        self.sender.lock().take();
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.closed.notify_waiters();
    }

    /// Resolves once the connection has been closed (possibly by another
    /// component, e.g. the heartbeat monitor).
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry change notification, consumed by the presence tracker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    ConnectionAdded { user_id: UserId },
    ConnectionRemoved { user_id: UserId },
}

/// In-process table of live connections with per-user and per-channel
/// indexes. All maps are sharded; operations on independent users and
/// channels proceed concurrently.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    by_channel: DashMap<ChannelId, HashSet<ConnectionId>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl ConnectionRegistry {
    /// Create a registry together with the receiving end of its change feed.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_channel: DashMap::new(),
            events,
        });
        (registry, rx)
    }

    /// Register a connection carrying a validated identity. Registering the
    /// same handle twice is a no-op.
    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id();
        let user_id = handle.user_id();

        if self.connections.insert(id, handle.clone()).is_some() {
            return;
        }
        self.by_user.entry(user_id).or_default().insert(id);

        metrics::set_connections(self.connections.len() as i64);
        tracing::info!(
            user_id = %user_id,
            session_id = %id,
            device = handle.device_id(),
            "connection registered"
        );
        let _ = self.events.send(RegistryEvent::ConnectionAdded { user_id });
    }

    /// Remove a connection. Idempotent: socket-close and heartbeat-timeout
    /// paths may race to remove the same connection, and the loser sees a
    /// no-op. Returns the handle when this call actually removed it.
    pub fn unregister(
        &self,
        id: ConnectionId,
        cause: DisconnectCause,
    ) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(&id)?;
        handle.close();

        let user_id = handle.user_id();
        let mut user_gone = false;
        if let Some(mut ids) = self.by_user.get_mut(&user_id) {
            ids.remove(&id);
            user_gone = ids.is_empty();
        }
        if user_gone {
            self.by_user.remove_if(&user_id, |_, ids| ids.is_empty());
        }

        for channel_id in handle.channels() {
            if let Some(mut ids) = self.by_channel.get_mut(&channel_id) {
                ids.remove(&id);
            }
            self.by_channel.remove_if(&channel_id, |_, ids| ids.is_empty());
        }

        metrics::set_connections(self.connections.len() as i64);
        metrics::record_disconnect(cause.as_str());
        tracing::info!(
            user_id = %user_id,
            session_id = %id,
            cause = cause.as_str(),
            "connection unregistered"
        );
        let _ = self.events.send(RegistryEvent::ConnectionRemoved { user_id });
        Some(handle)
    }

    /// Add a connection to a channel's local fan-out set. Idempotent; returns
    /// true when the subscription is new so the caller can refcount broker
    /// interest.
    pub fn subscribe(&self, handle: &ConnectionHandle, channel_id: ChannelId) -> bool {
        if !handle.channels.write().insert(channel_id) {
            return false;
        }
        self.by_channel.entry(channel_id).or_default().insert(handle.id());
        tracing::debug!(
            session_id = %handle.id(),
            channel_id = %channel_id,
            "subscribed to channel"
        );
        true
    }

    /// Remove a connection from a channel's local fan-out set. Idempotent;
    /// returns true when a subscription was actually removed.
    pub fn unsubscribe(&self, handle: &ConnectionHandle, channel_id: ChannelId) -> bool {
        if !handle.channels.write().remove(&channel_id) {
            return false;
        }
        if let Some(mut ids) = self.by_channel.get_mut(&channel_id) {
            ids.remove(&handle.id());
        }
        self.by_channel.remove_if(&channel_id, |_, ids| ids.is_empty());
        tracing::debug!(
            session_id = %handle.id(),
            channel_id = %channel_id,
            "unsubscribed from channel"
        );
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|e| e.value().clone())
    }

    /// Snapshot of connections subscribed to a channel.
    pub fn connections_for_channel(&self, channel_id: ChannelId) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = match self.by_channel.get(&channel_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    /// Snapshot of a user's connections across all their devices.
    pub fn connections_for_user(&self, user_id: UserId) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = match self.by_user.get(&user_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    /// Snapshot of every live connection.
    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn unique_user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn active_channel_count(&self) -> usize {
        self.by_channel.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test_support::handle_for;
    use pretty_assertions::assert_eq;

    #[test]
    fn register_and_unregister_are_idempotent() {
        let (registry, mut events) = ConnectionRegistry::new();
        let (conn, _rx) = handle_for(Uuid::new_v4(), "web", 8);

        registry.register(conn.clone());
        registry.register(conn.clone());
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ConnectionAdded { user_id: conn.user_id() }
        );
        assert!(events.try_recv().is_err());

        assert!(registry.unregister(conn.id(), DisconnectCause::ClientClosed).is_some());
        assert!(registry.unregister(conn.id(), DisconnectCause::HeartbeatTimeout).is_none());
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::ConnectionRemoved { user_id: conn.user_id() }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn unregistering_unknown_connection_is_a_noop() {
        let (registry, _events) = ConnectionRegistry::new();
        assert!(registry.unregister(Uuid::new_v4(), DisconnectCause::ClientClosed).is_none());
    }

    #[test]
    fn double_subscribe_keeps_one_entry() {
        let (registry, _events) = ConnectionRegistry::new();
        let channel = Uuid::new_v4();
        let (conn, _rx) = handle_for(Uuid::new_v4(), "web", 8);
        registry.register(conn.clone());

        assert!(registry.subscribe(&conn, channel));
        assert!(!registry.subscribe(&conn, channel));
        assert_eq!(registry.connections_for_channel(channel).len(), 1);

        assert!(registry.unsubscribe(&conn, channel));
        assert!(!registry.unsubscribe(&conn, channel));
        assert!(registry.connections_for_channel(channel).is_empty());
        assert_eq!(registry.active_channel_count(), 0);
    }

    #[test]
    fn unregister_clears_channel_membership() {
        let (registry, _events) = ConnectionRegistry::new();
        let channel = Uuid::new_v4();
        let (a, _rx_a) = handle_for(Uuid::new_v4(), "web", 8);
        let (b, _rx_b) = handle_for(Uuid::new_v4(), "ios", 8);
        registry.register(a.clone());
        registry.register(b.clone());
        registry.subscribe(&a, channel);
        registry.subscribe(&b, channel);

        registry.unregister(a.id(), DisconnectCause::TransportError);

        let remaining = registry.connections_for_channel(channel);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), b.id());
    }

    #[test]
    fn user_index_tracks_multiple_devices() {
        let (registry, _events) = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (d1, _rx1) = handle_for(user, "web", 8);
        let (d2, _rx2) = handle_for(user, "ios", 8);
        registry.register(d1.clone());
        registry.register(d2.clone());

        assert_eq!(registry.connections_for_user(user).len(), 2);
        assert_eq!(registry.unique_user_count(), 1);

        registry.unregister(d1.id(), DisconnectCause::ClientClosed);
        assert_eq!(registry.connections_for_user(user).len(), 1);
        registry.unregister(d2.id(), DisconnectCause::ClientClosed);
        assert!(registry.connections_for_user(user).is_empty());
        assert_eq!(registry.unique_user_count(), 0);
    }

    #[test]
    fn push_after_close_fails() {
        let (conn, _rx) = handle_for(Uuid::new_v4(), "web", 1);
        assert!(conn.push(ServerFrame::Pong).is_ok());
        assert_eq!(conn.push(ServerFrame::Pong), Err(PushError::Full));
        conn.close();
        assert_eq!(conn.push(ServerFrame::Pong), Err(PushError::Closed));
        assert!(conn.is_closed());
    }
}
