//! Typing Coordinator
//!
//! Short-lived typing indicators per (channel, user). Indicators expire on a
//! TTL when the client never sends an explicit stop, and repeated starts are
//! debounced so a held-down key does not become a broadcast storm.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{interval, Instant};

use super::bridge::EventPublisher;
use crate::domain::{ChannelId, DomainEvent, EventSink, GatewayEvent, Topic, TypingEvent, UserId};

struct TypingEntry {
    expires_at: Instant,
    last_broadcast: Instant,
}

/// Coordinates typing indicators. State lives only in process memory; a lost
/// indicator self-heals on the next `typing.start`.
pub struct TypingCoordinator {
    publisher: Arc<dyn EventPublisher>,
    events: Arc<dyn EventSink>,
    states: DashMap<(ChannelId, UserId), TypingEntry>,
    ttl: Duration,
    debounce: Duration,
}

impl TypingCoordinator {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        events: Arc<dyn EventSink>,
        ttl: Duration,
        debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            publisher,
            events,
            states: DashMap::new(),
            ttl,
            debounce,
        })
    }

    pub fn is_typing(&self, channel_id: ChannelId, user_id: UserId) -> bool {
        self.states.contains_key(&(channel_id, user_id))
    }

    pub fn typing_users(&self, channel_id: ChannelId) -> Vec<UserId> {
        self.states
            .iter()
            .filter(|e| e.key().0 == channel_id)
            .map(|e| e.key().1)
            .collect()
    }

    /// Start (or refresh) a typing indicator. The first start broadcasts;
    /// refreshes within the debounce window only extend the TTL.
    pub fn start(&self, channel_id: ChannelId, user_id: UserId) {
        let now = Instant::now();
        let broadcast = match self.states.entry((channel_id, user_id)) {
            Entry::Vacant(entry) => {
                entry.insert(TypingEntry {
                    expires_at: now + self.ttl,
                    last_broadcast: now,
                });
                true
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.expires_at = now + self.ttl;
                if now.duration_since(state.last_broadcast) >= self.debounce {
                    state.last_broadcast = now;
                    true
                } else {
                    false
                }
            }
        };
        if broadcast {
            self.publish(channel_id, user_id, true);
        }
    }

    /// Stop a typing indicator. Idempotent; stopping an indicator that was
    /// never started (or already expired) broadcasts nothing.
    pub fn stop(&self, channel_id: ChannelId, user_id: UserId) {
        if self.states.remove(&(channel_id, user_id)).is_some() {
            self.publish(channel_id, user_id, false);
        }
    }

    /// Drop a user's indicators in every channel, e.g. when their last
    /// connection goes away mid-keystroke.
    pub fn clear_user(&self, user_id: UserId) {
        let keys: Vec<(ChannelId, UserId)> = self
            .states
            .iter()
            .filter(|e| e.key().1 == user_id)
            .map(|e| *e.key())
            .collect();
        for (channel_id, user_id) in keys {
            self.stop(channel_id, user_id);
        }
    }

    /// Expire overdue indicators, broadcasting one stop per expiry. The
    /// `remove_if` guard closes the race with a concurrent refresh.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(ChannelId, UserId)> = self
            .states
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| *e.key())
            .collect();
        for key in expired {
            if self
                .states
                .remove_if(&key, |_, state| state.expires_at <= now)
                .is_some()
            {
                self.publish(key.0, key.1, false);
            }
        }
    }

    fn publish(&self, channel_id: ChannelId, user_id: UserId, typing: bool) {
        tracing::debug!(
            channel_id = %channel_id,
            user_id = %user_id,
            typing,
            "typing indicator changed"
        );
        self.publisher.publish(
            Topic::Channel(channel_id),
            GatewayEvent::TypingChanged(TypingEvent {
                channel_id,
                user_id,
                typing,
            }),
        );
        self.events
            .record(DomainEvent::typing_changed(channel_id, user_id, typing));
    }

    /// Periodic TTL sweep task.
    pub async fn run(self: Arc<Self>, sweep_interval: Duration) {
        let mut ticker = interval(sweep_interval);
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }
}
