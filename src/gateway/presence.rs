//! Presence Tracker
//!
//! Derives a per-user online/away/offline status from the set of live
//! connections for that user. Status is a pure function of the connection set
//! at the instant of computation; the per-user cache exists only to detect
//! transitions, never as a separate source of truth.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::interval;

use super::bridge::EventPublisher;
use super::registry::{ConnectionRegistry, RegistryEvent};
use super::typing::TypingCoordinator;
use crate::domain::{DomainEvent, EventSink, GatewayEvent, PresenceEvent, PresenceStatus, Topic, UserId};
use crate::infrastructure::metrics;

struct PresenceEntry {
    status: PresenceStatus,
}

/// Tracks per-user presence and publishes transitions exactly once per actual
/// status change. Evaluation for a given user is serialized by the per-key
/// map entry lock, so transitions for one user are strictly ordered without
/// any global locking.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<dyn EventPublisher>,
    events: Arc<dyn EventSink>,
    typing: Arc<TypingCoordinator>,
    statuses: DashMap<UserId, PresenceEntry>,
    away_threshold: Duration,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<dyn EventPublisher>,
        events: Arc<dyn EventSink>,
        typing: Arc<TypingCoordinator>,
        away_threshold: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            publisher,
            events,
            typing,
            statuses: DashMap::new(),
            away_threshold,
        })
    }

    /// Current aggregate status for a user.
    pub fn current_status(&self, user_id: UserId) -> PresenceStatus {
        self.statuses
            .get(&user_id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Users currently online or away.
    pub fn online_users(&self) -> Vec<UserId> {
        self.statuses.iter().map(|e| *e.key()).collect()
    }

    /// Derive status from the live connection set. Online beats away beats
    /// offline: one active device keeps the user online no matter how many
    /// idle devices they have.
    fn derive(&self, user_id: UserId) -> PresenceStatus {
        let connections = self.registry.connections_for_user(user_id);
        if connections.is_empty() {
            return PresenceStatus::Offline;
        }
        if connections
            .iter()
            .any(|c| c.heartbeat_age() < self.away_threshold)
        {
            PresenceStatus::Online
        } else {
            PresenceStatus::Away
        }
    }

    /// Recompute a user's status and publish iff it changed. Redundant
    /// re-evaluations are silent to avoid broadcast storms.
    ///
    /// Derivation, the cache update, and publication all happen under the
    /// user's entry lock. Evaluations race in from connection read tasks and
    /// the presence task; without that lock a stale derivation could win and
    /// announce `online` for a user who just went offline. The publish path
    /// never blocks (`try_send` all the way down), so holding the lock across
    /// it is safe.
    pub fn evaluate(&self, user_id: UserId) {
        let changed = match self.statuses.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let status = self.derive(user_id);
                if entry.get().status == status {
                    false
                } else {
                    // Publish first: remove() consumes the guard and would
                    // release the lock too early.
                    self.publish_transition(user_id, status);
                    if status == PresenceStatus::Offline {
                        entry.remove();
                    } else {
                        entry.insert(PresenceEntry { status });
                    }
                    true
                }
            }
            Entry::Vacant(entry) => {
                let status = self.derive(user_id);
                if status == PresenceStatus::Offline {
                    // Never observed online; nothing to announce.
                    false
                } else {
                    self.publish_transition(user_id, status);
                    entry.insert(PresenceEntry { status });
                    true
                }
            }
        };

        // len() takes shard locks, so it must run after the entry guard is
        // released.
        if changed {
            metrics::set_users_online(self.statuses.len() as i64);
        }
    }

    /// Apply one registry change notification.
    pub fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::ConnectionAdded { user_id } => self.evaluate(user_id),
            RegistryEvent::ConnectionRemoved { user_id } => {
                self.evaluate(user_id);
                // A user with no connections left cannot be typing anywhere.
                if self.current_status(user_id) == PresenceStatus::Offline {
                    self.typing.clear_user(user_id);
                }
            }
        }
    }

    fn publish_transition(&self, user_id: UserId, status: PresenceStatus) {
        tracing::debug!(user_id = %user_id, status = %status, "presence changed");
        self.publisher.publish(
            Topic::Presence(user_id),
            GatewayEvent::PresenceChanged(PresenceEvent {
                user_id,
                status,
                changed_at: Utc::now(),
            }),
        );
        self.events.record(DomainEvent::presence_changed(user_id, status));
    }

    /// Re-evaluate every tracked user, downgrading idle users to away. Stale
    /// results are bounded by the tick period.
    pub fn sweep(&self) {
        let users: Vec<UserId> = self.statuses.iter().map(|e| *e.key()).collect();
        for user_id in users {
            self.evaluate(user_id);
        }
    }

    /// Drive the tracker: apply registry change notifications as they arrive
    /// and periodically re-evaluate away transitions.
    pub async fn run(
        self: Arc<Self>,
        mut registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
        tick: Duration,
    ) {
        let mut ticker = interval(tick);
        loop {
            tokio::select! {
                event = registry_events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::debug!("registry event feed closed; presence task exiting");
                        break;
                    }
                },
                _ = ticker.tick() => self.sweep(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::registry::DisconnectCause;
    use crate::gateway::test_support::{handle_for, RecordingPublisher, RecordingSink};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    const AWAY: Duration = Duration::from_secs(300);

    fn tracker(
        registry: Arc<ConnectionRegistry>,
    ) -> (Arc<PresenceTracker>, Arc<TypingCoordinator>, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = Arc::new(RecordingSink::default());
        let typing = TypingCoordinator::new(
            publisher.clone(),
            sink.clone(),
            Duration::from_secs(10),
            Duration::from_secs(2),
        );
        let tracker = PresenceTracker::new(registry, publisher.clone(), sink, typing.clone(), AWAY);
        (tracker, typing, publisher)
    }

    fn presence_statuses(publisher: &RecordingPublisher) -> Vec<PresenceStatus> {
        publisher
            .take()
            .into_iter()
            .filter_map(|(_, event)| match event {
                GatewayEvent::PresenceChanged(e) => Some(e.status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connect_disconnect_publishes_each_transition_once() {
        let (registry, mut events) = ConnectionRegistry::new();
        let (tracker, _typing, publisher) = tracker(registry.clone());
        let user = Uuid::new_v4();
        let (conn, _rx) = handle_for(user, "web", 8);

        registry.register(conn.clone());
        registry.register(conn.clone());
        while let Ok(event) = events.try_recv() {
            tracker.handle_event(event);
        }
        assert_eq!(presence_statuses(&publisher), vec![PresenceStatus::Online]);

        registry.unregister(conn.id(), DisconnectCause::ClientClosed);
        registry.unregister(conn.id(), DisconnectCause::ClientClosed);
        while let Ok(event) = events.try_recv() {
            tracker.handle_event(event);
        }
        assert_eq!(presence_statuses(&publisher), vec![PresenceStatus::Offline]);
    }

    #[tokio::test]
    async fn second_device_keeps_user_online() {
        let (registry, mut events) = ConnectionRegistry::new();
        let (tracker, _typing, publisher) = tracker(registry.clone());
        let user = Uuid::new_v4();
        let (d1, _rx1) = handle_for(user, "web", 8);
        let (d2, _rx2) = handle_for(user, "ios", 8);

        registry.register(d1.clone());
        registry.register(d2.clone());
        registry.unregister(d1.id(), DisconnectCause::ClientClosed);
        while let Ok(event) = events.try_recv() {
            tracker.handle_event(event);
        }
        assert_eq!(tracker.current_status(user), PresenceStatus::Online);
        assert_eq!(presence_statuses(&publisher), vec![PresenceStatus::Online]);

        registry.unregister(d2.id(), DisconnectCause::ClientClosed);
        while let Ok(event) = events.try_recv() {
            tracker.handle_event(event);
        }
        assert_eq!(tracker.current_status(user), PresenceStatus::Offline);
        assert_eq!(presence_statuses(&publisher), vec![PresenceStatus::Offline]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_user_is_downgraded_to_away_and_restored() {
        let (registry, _events) = ConnectionRegistry::new();
        let (tracker, _typing, publisher) = tracker(registry.clone());
        let user = Uuid::new_v4();
        let (conn, _rx) = handle_for(user, "web", 8);
        registry.register(conn.clone());
        tracker.evaluate(user);
        assert_eq!(presence_statuses(&publisher), vec![PresenceStatus::Online]);

        tokio::time::advance(AWAY + Duration::from_secs(1)).await;
        tracker.sweep();
        tracker.sweep();
        assert_eq!(tracker.current_status(user), PresenceStatus::Away);
        assert_eq!(presence_statuses(&publisher), vec![PresenceStatus::Away]);

        conn.record_heartbeat();
        tracker.evaluate(user);
        assert_eq!(presence_statuses(&publisher), vec![PresenceStatus::Online]);
    }

    #[tokio::test]
    async fn evaluate_without_connections_never_announces_offline_twice() {
        let (registry, _events) = ConnectionRegistry::new();
        let (tracker, _typing, publisher) = tracker(registry);
        let user = Uuid::new_v4();

        tracker.evaluate(user);
        tracker.evaluate(user);
        assert!(presence_statuses(&publisher).is_empty());
        assert_eq!(tracker.current_status(user), PresenceStatus::Offline);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_evaluations_never_leave_stale_status() {
        let (registry, _events) = ConnectionRegistry::new();
        let (tracker, _typing, publisher) = tracker(registry.clone());
        let user = Uuid::new_v4();

        for _ in 0..50 {
            let (conn, _rx) = handle_for(user, "web", 8);
            registry.register(conn.clone());

            let heartbeats: Vec<_> = (0..4)
                .map(|_| {
                    let tracker = tracker.clone();
                    tokio::spawn(async move { tracker.evaluate(user) })
                })
                .collect();
            let teardown = {
                let registry = registry.clone();
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    registry.unregister(conn.id(), DisconnectCause::ClientClosed);
                    tracker.evaluate(user);
                })
            };
            for task in heartbeats {
                task.await.unwrap();
            }
            teardown.await.unwrap();

            // However evaluations interleave, the connection is gone, so a
            // stale in-flight derivation must not resurrect the user.
            assert_eq!(tracker.current_status(user), PresenceStatus::Offline);
        }

        let statuses = presence_statuses(&publisher);
        for pair in statuses.windows(2) {
            assert_ne!(pair[0], pair[1], "same status announced twice in a row");
        }
        if let Some(last) = statuses.last() {
            assert_eq!(*last, PresenceStatus::Offline);
        }
    }

    #[tokio::test]
    async fn disconnecting_last_device_clears_typing_indicators() {
        let (registry, mut events) = ConnectionRegistry::new();
        let (tracker, typing, publisher) = tracker(registry.clone());
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let (conn, _rx) = handle_for(user, "web", 8);

        registry.register(conn.clone());
        while let Ok(event) = events.try_recv() {
            tracker.handle_event(event);
        }
        typing.start(channel, user);
        publisher.take();

        registry.unregister(conn.id(), DisconnectCause::ClientClosed);
        while let Ok(event) = events.try_recv() {
            tracker.handle_event(event);
        }

        assert!(!typing.is_typing(channel, user));
        let stops: Vec<bool> = publisher
            .take()
            .into_iter()
            .filter_map(|(_, event)| match event {
                GatewayEvent::TypingChanged(e) => Some(e.typing),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![false]);
    }
}
