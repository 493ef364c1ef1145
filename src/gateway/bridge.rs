//! Pub/Sub Bridge
//!
//! Connects the in-process registry to the Redis pub/sub backbone. Outbound:
//! events produced locally are serialized and queued for publication.
//! Inbound: broker messages on subscribed topics are parsed and fanned out to
//! local connections. Broker-side subscriptions are refcounted per topic so
//! one subscription serves every local connection interested in it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::registry::{ConnectionHandle, ConnectionRegistry, DisconnectCause, PushError};
use crate::domain::{GatewayEvent, Topic};
use crate::gateway::frames::ServerFrame;
use crate::infrastructure::metrics;

/// Producer-side interface for components that emit fan-out events. Publish
/// is fire-and-forget so producers never block on broker I/O.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: Topic, event: GatewayEvent);
}

/// A serialized event queued for broker publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
}

/// Broker subscription change requested by the bridge front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterestChange {
    Subscribe(String),
    Unsubscribe(String),
}

/// Front-end of the bridge: owned by the gateway components, feeds the broker
/// tasks through queues. Holds the topic interest refcounts.
pub struct PubSubBridge {
    registry: Arc<ConnectionRegistry>,
    publish_tx: mpsc::Sender<OutboundMessage>,
    control_tx: mpsc::UnboundedSender<InterestChange>,
    interest: DashMap<String, usize>,
}

/// Back-end of the bridge: the receiving ends of the queues, driven against a
/// real broker by [`BridgeBackend::run`]. Split from the front-end so tests
/// can inspect queued publishes and inject broker traffic directly.
pub struct BridgeBackend {
    pub publish_rx: mpsc::Receiver<OutboundMessage>,
    pub control_rx: mpsc::UnboundedReceiver<InterestChange>,
}

impl PubSubBridge {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        publish_queue_depth: usize,
    ) -> (Arc<Self>, BridgeBackend) {
        let (publish_tx, publish_rx) = mpsc::channel(publish_queue_depth);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            registry,
            publish_tx,
            control_tx,
            interest: DashMap::new(),
        });
        (bridge, BridgeBackend { publish_rx, control_rx })
    }

    /// Register interest in a topic. The first interested connection triggers
    /// the broker-side subscription; later ones only bump the refcount.
    pub fn subscribe_topic(&self, topic: Topic) {
        let name = topic.name();
        match self.interest.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(1);
                tracing::debug!(topic = %name, "subscribing to broker topic");
                let _ = self.control_tx.send(InterestChange::Subscribe(name));
            }
        }
    }

    /// Release interest in a topic, unsubscribing broker-side when the last
    /// interested connection is gone.
    pub fn release_topic(&self, topic: Topic) {
        let name = topic.name();
        let mut unsubscribe = false;
        if let Entry::Occupied(mut entry) = self.interest.entry(name.clone()) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                entry.remove();
                unsubscribe = true;
            }
        }
        if unsubscribe {
            tracing::debug!(topic = %name, "unsubscribing from broker topic");
            let _ = self.control_tx.send(InterestChange::Unsubscribe(name));
        }
    }

    /// Topics currently subscribed broker-side.
    pub fn topics(&self) -> Vec<String> {
        self.interest.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear down a connection: unregister it and release every broker topic
    /// it was holding interest in. Safe to call from any teardown path; the
    /// registry's idempotent removal makes the loser of a race a no-op.
    pub fn drop_connection(&self, handle: &ConnectionHandle, cause: DisconnectCause) {
        let Some(handle) = self.registry.unregister(handle.id(), cause) else {
            return;
        };
        for channel_id in handle.channels() {
            self.release_topic(Topic::Channel(channel_id));
        }
        self.release_topic(Topic::Presence(handle.user_id()));
    }

    /// Handle one message received from the broker: parse it and fan out to
    /// every local connection the topic addresses. Malformed payloads are
    /// dropped with a warning; one bad producer must not wedge the stream.
    pub fn handle_broker_message(&self, topic_name: &str, payload: &str) {
        let Some(topic) = Topic::parse(topic_name) else {
            tracing::warn!(topic = topic_name, "message on unrecognized topic");
            return;
        };
        let event: GatewayEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(topic = topic_name, error = %err, "undecodable broker payload");
                return;
            }
        };
        self.fan_out(topic, event);
    }

    /// Deliver an event to the local connections addressed by the topic.
    /// Pushes are non-blocking; a connection whose queue is full is torn down
    /// rather than allowed to stall everyone else.
    fn fan_out(&self, topic: Topic, event: GatewayEvent) {
        let targets = match topic {
            Topic::Channel(channel_id) => self.registry.connections_for_channel(channel_id),
            Topic::Presence(user_id) => self.registry.connections_for_user(user_id),
        };
        if targets.is_empty() {
            return;
        }

        let kind = event.kind();
        let frame = ServerFrame::from(event);
        let mut delivered = 0u64;
        for conn in &targets {
            match conn.push(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(PushError::Full) => {
                    tracing::warn!(
                        session_id = %conn.id(),
                        user_id = %conn.user_id(),
                        "outbound queue full; dropping slow connection"
                    );
                    self.drop_connection(conn, DisconnectCause::QueueOverflow);
                }
                Err(PushError::Closed) => {}
            }
        }
        metrics::record_fan_out(kind, delivered);
    }
}

impl EventPublisher for PubSubBridge {
    fn publish(&self, topic: Topic, event: GatewayEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, kind = event.kind(), "unserializable event");
                return;
            }
        };
        let message = OutboundMessage { topic: topic.name(), payload };
        if let Err(mpsc::error::TrySendError::Full(message)) = self.publish_tx.try_send(message) {
            tracing::warn!(topic = %message.topic, "publish queue full; dropping event");
            metrics::record_dropped_publish();
        }
    }
}

impl BridgeBackend {
    /// Drive the bridge against a real broker. Spawns the publish and
    /// subscribe loops; each reconnects independently with exponential
    /// backoff, resubscribing the full interest set after a reconnect.
    pub fn run(
        self,
        bridge: Arc<PubSubBridge>,
        client: redis::Client,
        backoff_base: Duration,
        backoff_max: Duration,
    ) {
        tokio::spawn(publish_loop(
            self.publish_rx,
            client.clone(),
            backoff_base,
            backoff_max,
        ));
        tokio::spawn(subscribe_loop(
            self.control_rx,
            bridge,
            client,
            backoff_base,
            backoff_max,
        ));
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

async fn publish_loop(
    mut publish_rx: mpsc::Receiver<OutboundMessage>,
    client: redis::Client,
    backoff_base: Duration,
    backoff_max: Duration,
) {
    let mut conn = loop {
        match client.get_connection_manager().await {
            Ok(conn) => break conn,
            Err(err) => {
                tracing::error!(error = %err, "broker unavailable for publishing; retrying");
                tokio::time::sleep(backoff_base).await;
            }
        }
    };

    while let Some(message) = publish_rx.recv().await {
        let mut backoff = backoff_base;
        // Retry the same message until it lands; publication order per topic
        // is part of the delivery contract.
        loop {
            match conn
                .publish::<&str, &str, i64>(&message.topic, &message.payload)
                .await
            {
                Ok(receivers) => {
                    tracing::trace!(topic = %message.topic, receivers, "published");
                    break;
                }
                Err(err) => {
                    tracing::error!(
                        topic = %message.topic,
                        error = %err,
                        "publish failed; retrying after backoff"
                    );
                    metrics::record_broker_reconnect();
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, backoff_max);
                }
            }
        }
    }
    tracing::debug!("publish queue closed; publish loop exiting");
}

async fn subscribe_loop(
    mut control_rx: mpsc::UnboundedReceiver<InterestChange>,
    bridge: Arc<PubSubBridge>,
    client: redis::Client,
    backoff_base: Duration,
    backoff_max: Duration,
) {
    let mut backoff = backoff_base;
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                tracing::error!(error = %err, "broker unavailable for subscribing; retrying");
                metrics::record_broker_reconnect();
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, backoff_max);
                continue;
            }
        };

        // The interest map is the source of truth across reconnects.
        let topics = bridge.topics();
        let mut resubscribed = true;
        for topic in &topics {
            if let Err(err) = pubsub.subscribe(topic).await {
                tracing::error!(topic = %topic, error = %err, "resubscribe failed");
                resubscribed = false;
                break;
            }
        }
        if !resubscribed {
            metrics::record_broker_reconnect();
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, backoff_max);
            continue;
        }
        if !topics.is_empty() {
            tracing::info!(topics = topics.len(), "broker subscriptions restored");
        }
        backoff = backoff_base;

        let (mut sink, mut stream) = pubsub.split();
        loop {
            tokio::select! {
                change = control_rx.recv() => match change {
                    Some(InterestChange::Subscribe(topic)) => {
                        if let Err(err) = sink.subscribe(&topic).await {
                            tracing::error!(topic = %topic, error = %err, "subscribe failed");
                            break;
                        }
                    }
                    Some(InterestChange::Unsubscribe(topic)) => {
                        if let Err(err) = sink.unsubscribe(&topic).await {
                            tracing::error!(topic = %topic, error = %err, "unsubscribe failed");
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("control channel closed; subscribe loop exiting");
                        return;
                    }
                },
                message = stream.next() => match message {
                    Some(message) => {
                        let topic = message.get_channel_name().to_string();
                        match message.get_payload::<String>() {
                            Ok(payload) => bridge.handle_broker_message(&topic, &payload),
                            Err(err) => {
                                tracing::warn!(topic = %topic, error = %err, "non-text broker payload");
                            }
                        }
                    }
                    None => {
                        tracing::error!("broker subscription stream ended; reconnecting");
                        break;
                    }
                },
            }
        }
        metrics::record_broker_reconnect();
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, backoff_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TypingEvent;
    use crate::gateway::test_support::handle_for;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn typing_event(channel_id: Uuid, user_id: Uuid) -> GatewayEvent {
        GatewayEvent::TypingChanged(TypingEvent { channel_id, user_id, typing: true })
    }

    #[tokio::test]
    async fn fan_out_targets_channel_subscribers_only() {
        let (registry, _events) = ConnectionRegistry::new();
        let (bridge, _backend) = PubSubBridge::new(registry.clone(), 16);
        let channel = Uuid::new_v4();
        let (a, mut rx_a) = handle_for(Uuid::new_v4(), "web", 8);
        let (b, mut rx_b) = handle_for(Uuid::new_v4(), "web", 8);
        registry.register(a.clone());
        registry.register(b.clone());
        registry.subscribe(&a, channel);

        let event = typing_event(channel, b.user_id());
        let payload = serde_json::to_string(&event).unwrap();
        bridge.handle_broker_message(&Topic::Channel(channel).name(), &payload);

        assert_eq!(rx_a.try_recv().unwrap(), ServerFrame::from(event));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_preserves_arrival_order() {
        let (registry, _events) = ConnectionRegistry::new();
        let (bridge, _backend) = PubSubBridge::new(registry.clone(), 16);
        let channel = Uuid::new_v4();
        let (a, mut rx_a) = handle_for(Uuid::new_v4(), "web", 8);
        registry.register(a.clone());
        registry.subscribe(&a, channel);

        let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for user in &users {
            let payload = serde_json::to_string(&typing_event(channel, *user)).unwrap();
            bridge.handle_broker_message(&Topic::Channel(channel).name(), &payload);
        }

        for user in &users {
            match rx_a.try_recv().unwrap() {
                ServerFrame::TypingChanged(e) => assert_eq!(e.user_id, *user),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_connection_is_torn_down_on_overflow() {
        let (registry, _events) = ConnectionRegistry::new();
        let (bridge, _backend) = PubSubBridge::new(registry.clone(), 16);
        let channel = Uuid::new_v4();
        let (slow, _rx) = handle_for(Uuid::new_v4(), "web", 1);
        registry.register(slow.clone());
        registry.subscribe(&slow, channel);
        bridge.subscribe_topic(Topic::Channel(channel));
        bridge.subscribe_topic(Topic::Presence(slow.user_id()));

        for _ in 0..2 {
            let payload =
                serde_json::to_string(&typing_event(channel, Uuid::new_v4())).unwrap();
            bridge.handle_broker_message(&Topic::Channel(channel).name(), &payload);
        }

        assert_eq!(registry.connection_count(), 0);
        assert!(slow.is_closed());
        assert!(bridge.topics().is_empty());
    }

    #[tokio::test]
    async fn interest_is_refcounted_per_topic() {
        let (registry, _events) = ConnectionRegistry::new();
        let (bridge, mut backend) = PubSubBridge::new(registry, 16);
        let channel = Uuid::new_v4();
        let topic = Topic::Channel(channel);

        bridge.subscribe_topic(topic);
        bridge.subscribe_topic(topic);
        assert_eq!(
            backend.control_rx.try_recv().unwrap(),
            InterestChange::Subscribe(topic.name())
        );
        assert!(backend.control_rx.try_recv().is_err());

        bridge.release_topic(topic);
        assert!(backend.control_rx.try_recv().is_err());
        bridge.release_topic(topic);
        assert_eq!(
            backend.control_rx.try_recv().unwrap(),
            InterestChange::Unsubscribe(topic.name())
        );
        bridge.release_topic(topic);
        assert!(backend.control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_queues_serialized_event() {
        let (registry, _events) = ConnectionRegistry::new();
        let (bridge, mut backend) = PubSubBridge::new(registry, 16);
        let channel = Uuid::new_v4();
        let event = typing_event(channel, Uuid::new_v4());

        bridge.publish(Topic::Channel(channel), event.clone());

        let message = backend.publish_rx.try_recv().unwrap();
        assert_eq!(message.topic, Topic::Channel(channel).name());
        let back: GatewayEvent = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn malformed_broker_traffic_is_ignored() {
        let (registry, _events) = ConnectionRegistry::new();
        let (bridge, _backend) = PubSubBridge::new(registry.clone(), 16);
        let channel = Uuid::new_v4();
        let (a, mut rx_a) = handle_for(Uuid::new_v4(), "web", 8);
        registry.register(a.clone());
        registry.subscribe(&a, channel);

        bridge.handle_broker_message("not-a-topic", "{}");
        bridge.handle_broker_message(&Topic::Channel(channel).name(), "not json");
        assert!(rx_a.try_recv().is_err());
    }
}
