//! Message Router
//!
//! Dispatches parsed client frames to the owning component. The match over
//! frame kinds is exhaustive, so an unhandled kind is a compile error rather
//! than a silent drop.

use std::sync::Arc;

use validator::Validate;

use super::bridge::{EventPublisher, PubSubBridge};
use super::frames::{ClientFrame, ServerFrame};
use super::presence::PresenceTracker;
use super::registry::{ConnectionHandle, ConnectionRegistry, DisconnectCause, PushError};
use super::typing::TypingCoordinator;
use crate::domain::{
    DomainEvent, EventSink, GatewayEvent, MessageDeletedEvent, MessageEvent, MessageStore,
    NewMessage, Topic,
};
use crate::shared::error::GatewayError;

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<PubSubBridge>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingCoordinator>,
    store: Arc<dyn MessageStore>,
    events: Arc<dyn EventSink>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<PubSubBridge>,
        presence: Arc<PresenceTracker>,
        typing: Arc<TypingCoordinator>,
        store: Arc<dyn MessageStore>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self { registry, bridge, presence, typing, store, events })
    }

    /// Route one inbound frame. Any inbound traffic counts as heartbeat
    /// activity, so a chatty client never needs explicit heartbeats.
    pub async fn dispatch(&self, conn: &Arc<ConnectionHandle>, frame: ClientFrame) {
        conn.record_heartbeat();
        match frame {
            ClientFrame::ChatSend(payload) => {
                if let Err(err) = self.chat_send(conn, payload).await {
                    self.reply_error(conn, err);
                }
            }
            ClientFrame::ChatEdit(payload) => {
                if let Err(err) = self.chat_edit(conn, payload).await {
                    self.reply_error(conn, err);
                }
            }
            ClientFrame::ChatDelete(payload) => {
                if let Err(err) = self.chat_delete(conn, payload).await {
                    self.reply_error(conn, err);
                }
            }
            ClientFrame::TypingStart { channel_id } => {
                self.typing.start(channel_id, conn.user_id());
            }
            ClientFrame::TypingStop { channel_id } => {
                self.typing.stop(channel_id, conn.user_id());
            }
            ClientFrame::Heartbeat => {
                self.reply(conn, ServerFrame::Pong);
                self.presence.evaluate(conn.user_id());
            }
            ClientFrame::Subscribe { channel_id } => {
                if self.registry.subscribe(conn, channel_id) {
                    self.bridge.subscribe_topic(Topic::Channel(channel_id));
                }
                self.reply(conn, ServerFrame::Subscribed { channel_id });
            }
            ClientFrame::Unsubscribe { channel_id } => {
                if self.registry.unsubscribe(conn, channel_id) {
                    self.bridge.release_topic(Topic::Channel(channel_id));
                }
                self.reply(conn, ServerFrame::Unsubscribed { channel_id });
            }
        }
    }

    /// Persist a new message, then publish its fan-out event. Persistence
    /// failure surfaces to the sender only; nothing is published.
    async fn chat_send(
        &self,
        conn: &Arc<ConnectionHandle>,
        payload: super::frames::ChatSendPayload,
    ) -> Result<(), GatewayError> {
        payload
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        let record = self
            .store
            .create_message(NewMessage {
                channel_id: payload.channel_id,
                author_id: conn.user_id(),
                content: payload.content,
            })
            .await?;

        // The sender stops typing by sending.
        self.typing.stop(record.channel_id, conn.user_id());
        self.bridge.publish(
            Topic::Channel(record.channel_id),
            GatewayEvent::MessageCreated(MessageEvent::from_record(&record, conn.username())),
        );
        self.events.record(DomainEvent::message_created(&record));
        Ok(())
    }

    async fn chat_edit(
        &self,
        conn: &Arc<ConnectionHandle>,
        payload: super::frames::ChatEditPayload,
    ) -> Result<(), GatewayError> {
        payload
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        let record = self
            .store
            .edit_message(payload.message_id, conn.user_id(), payload.content)
            .await?;

        self.bridge.publish(
            Topic::Channel(record.channel_id),
            GatewayEvent::MessageUpdated(MessageEvent::from_record(&record, conn.username())),
        );
        self.events.record(DomainEvent::message_edited(&record));
        Ok(())
    }

    async fn chat_delete(
        &self,
        conn: &Arc<ConnectionHandle>,
        payload: super::frames::ChatDeletePayload,
    ) -> Result<(), GatewayError> {
        let record = self
            .store
            .delete_message(payload.message_id, conn.user_id())
            .await?;

        self.bridge.publish(
            Topic::Channel(record.channel_id),
            GatewayEvent::MessageDeleted(MessageDeletedEvent {
                id: record.id,
                channel_id: record.channel_id,
            }),
        );
        self.events.record(DomainEvent::message_deleted(&record));
        Ok(())
    }

    fn reply(&self, conn: &Arc<ConnectionHandle>, frame: ServerFrame) {
        match conn.push(frame) {
            Ok(()) | Err(PushError::Closed) => {}
            Err(PushError::Full) => {
                self.bridge.drop_connection(conn, DisconnectCause::QueueOverflow);
            }
        }
    }

    fn reply_error(&self, conn: &Arc<ConnectionHandle>, err: GatewayError) {
        tracing::debug!(
            session_id = %conn.id(),
            code = err.code(),
            "rejecting client frame"
        );
        let frame = ServerFrame::Error {
            code: err.code(),
            message: err.client_message(),
        };
        self.reply(conn, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageRecord, MockMessageStore};
    use crate::gateway::frames::{ChatDeletePayload, ChatEditPayload, ChatSendPayload};
    use crate::gateway::test_support::{handle_for, RecordingSink};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<PubSubBridge>,
        publish_rx: mpsc::Receiver<crate::gateway::bridge::OutboundMessage>,
        router: Arc<MessageRouter>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(store: MockMessageStore) -> Fixture {
        let (registry, _events) = ConnectionRegistry::new();
        let (bridge, backend) = PubSubBridge::new(registry.clone(), 16);
        let sink = Arc::new(RecordingSink::default());
        let typing = TypingCoordinator::new(
            bridge.clone(),
            sink.clone(),
            Duration::from_secs(10),
            Duration::from_secs(2),
        );
        let presence = PresenceTracker::new(
            registry.clone(),
            bridge.clone(),
            sink.clone(),
            typing.clone(),
            Duration::from_secs(300),
        );
        let router = MessageRouter::new(
            registry.clone(),
            bridge.clone(),
            presence,
            typing,
            Arc::new(store),
            sink.clone(),
        );
        Fixture { registry, bridge, publish_rx: backend.publish_rx, router, sink }
    }

    fn record(channel_id: Uuid, author_id: Uuid, content: &str) -> MessageRecord {
        MessageRecord {
            id: Uuid::new_v4(),
            channel_id,
            author_id,
            content: content.to_string(),
            created_at: Utc::now(),
            edited_at: None,
        }
    }

    #[tokio::test]
    async fn chat_send_persists_then_publishes() {
        let channel = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stored = record(channel, user, "hello");
        let mut store = MockMessageStore::new();
        let returned = stored.clone();
        store
            .expect_create_message()
            .withf(move |m| m.channel_id == channel && m.content == "hello")
            .return_once(move |_| Ok(returned));

        let mut fx = fixture(store);
        let (conn, _rx) = handle_for(user, "web", 8);
        fx.registry.register(conn.clone());

        fx.router
            .dispatch(
                &conn,
                ClientFrame::ChatSend(ChatSendPayload {
                    channel_id: channel,
                    content: "hello".into(),
                }),
            )
            .await;

        let message = fx.publish_rx.try_recv().unwrap();
        assert_eq!(message.topic, Topic::Channel(channel).name());
        let event: GatewayEvent = serde_json::from_str(&message.payload).unwrap();
        match event {
            GatewayEvent::MessageCreated(e) => {
                assert_eq!(e.id, stored.id);
                assert_eq!(e.author_name, conn.username());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(fx.sink.take().len(), 1);
    }

    #[tokio::test]
    async fn failed_persistence_publishes_nothing() {
        let mut store = MockMessageStore::new();
        store
            .expect_create_message()
            .return_once(|_| Err(GatewayError::Database(sqlx::Error::PoolClosed)));

        let mut fx = fixture(store);
        let (conn, mut rx) = handle_for(Uuid::new_v4(), "web", 8);
        fx.registry.register(conn.clone());

        fx.router
            .dispatch(
                &conn,
                ClientFrame::ChatSend(ChatSendPayload {
                    channel_id: Uuid::new_v4(),
                    content: "hello".into(),
                }),
            )
            .await;

        assert!(fx.publish_rx.try_recv().is_err());
        assert!(fx.sink.take().is_empty());
        match rx.try_recv().unwrap() {
            ServerFrame::Error { code, .. } => assert_eq!(code, "persistence_failed"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_content_is_rejected_without_store_call() {
        let mut store = MockMessageStore::new();
        store.expect_create_message().times(0);

        let mut fx = fixture(store);
        let (conn, mut rx) = handle_for(Uuid::new_v4(), "web", 8);
        fx.registry.register(conn.clone());

        fx.router
            .dispatch(
                &conn,
                ClientFrame::ChatSend(ChatSendPayload {
                    channel_id: Uuid::new_v4(),
                    content: String::new(),
                }),
            )
            .await;

        assert!(fx.publish_rx.try_recv().is_err());
        match rx.try_recv().unwrap() {
            ServerFrame::Error { code, .. } => assert_eq!(code, "validation_failed"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn edit_by_non_author_surfaces_forbidden() {
        let mut store = MockMessageStore::new();
        store
            .expect_edit_message()
            .return_once(|_, _, _| Err(GatewayError::Forbidden("not the author".into())));

        let mut fx = fixture(store);
        let (conn, mut rx) = handle_for(Uuid::new_v4(), "web", 8);
        fx.registry.register(conn.clone());

        fx.router
            .dispatch(
                &conn,
                ClientFrame::ChatEdit(ChatEditPayload {
                    message_id: Uuid::new_v4(),
                    content: "edited".into(),
                }),
            )
            .await;

        assert!(fx.publish_rx.try_recv().is_err());
        match rx.try_recv().unwrap() {
            ServerFrame::Error { code, .. } => assert_eq!(code, "forbidden"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_publishes_without_content() {
        let channel = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stored = record(channel, user, "secret");
        let mut store = MockMessageStore::new();
        let returned = stored.clone();
        store
            .expect_delete_message()
            .return_once(move |_, _| Ok(returned));

        let mut fx = fixture(store);
        let (conn, _rx) = handle_for(user, "web", 8);
        fx.registry.register(conn.clone());

        fx.router
            .dispatch(&conn, ClientFrame::ChatDelete(ChatDeletePayload { message_id: stored.id }))
            .await;

        let message = fx.publish_rx.try_recv().unwrap();
        assert!(!message.payload.contains("secret"));
        let event: GatewayEvent = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(
            event,
            GatewayEvent::MessageDeleted(MessageDeletedEvent { id: stored.id, channel_id: channel })
        );
    }

    #[tokio::test]
    async fn heartbeat_pongs_and_refreshes() {
        let fx = fixture(MockMessageStore::new());
        let (conn, mut rx) = handle_for(Uuid::new_v4(), "web", 8);
        fx.registry.register(conn.clone());
        conn.mark_suspect();

        fx.router.dispatch(&conn, ClientFrame::Heartbeat).await;

        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Pong);
        assert_eq!(conn.liveness(), crate::gateway::registry::Liveness::Alive);
    }

    #[tokio::test]
    async fn subscribe_is_acked_and_idempotent() {
        let fx = fixture(MockMessageStore::new());
        let channel = Uuid::new_v4();
        let (conn, mut rx) = handle_for(Uuid::new_v4(), "web", 8);
        fx.registry.register(conn.clone());

        fx.router.dispatch(&conn, ClientFrame::Subscribe { channel_id: channel }).await;
        fx.router.dispatch(&conn, ClientFrame::Subscribe { channel_id: channel }).await;

        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Subscribed { channel_id: channel });
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Subscribed { channel_id: channel });
        assert_eq!(fx.bridge.topics(), vec![Topic::Channel(channel).name()]);
        assert_eq!(fx.registry.connections_for_channel(channel).len(), 1);

        fx.router.dispatch(&conn, ClientFrame::Unsubscribe { channel_id: channel }).await;
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Unsubscribed { channel_id: channel });
        assert!(fx.bridge.topics().is_empty());
    }

    #[tokio::test]
    async fn typing_frames_reach_the_coordinator() {
        let mut fx = fixture(MockMessageStore::new());
        let channel = Uuid::new_v4();
        let (conn, _rx) = handle_for(Uuid::new_v4(), "web", 8);
        fx.registry.register(conn.clone());

        fx.router.dispatch(&conn, ClientFrame::TypingStart { channel_id: channel }).await;
        fx.router.dispatch(&conn, ClientFrame::TypingStop { channel_id: channel }).await;

        let first = fx.publish_rx.try_recv().unwrap();
        let second = fx.publish_rx.try_recv().unwrap();
        assert!(first.payload.contains(r#""typing":true"#));
        assert!(second.payload.contains(r#""typing":false"#));
    }
}
