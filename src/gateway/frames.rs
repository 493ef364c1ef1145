//! Wire Frames
//!
//! Typed frames exchanged with clients over the WebSocket transport. Inbound
//! frame kinds form a closed enum so adding one is a compile-time-checked
//! decision in the router's match, not a runtime lookup miss.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::{
    ChannelId, ConnectionId, GatewayEvent, MessageDeletedEvent, MessageEvent, MessageId,
    PresenceEvent, TypingEvent, UserId,
};

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "chat.send")]
    ChatSend(ChatSendPayload),
    #[serde(rename = "chat.edit")]
    ChatEdit(ChatEditPayload),
    #[serde(rename = "chat.delete")]
    ChatDelete(ChatDeletePayload),
    #[serde(rename = "typing.start")]
    TypingStart { channel_id: ChannelId },
    #[serde(rename = "typing.stop")]
    TypingStop { channel_id: ChannelId },
    #[serde(rename = "presence.heartbeat")]
    Heartbeat,
    #[serde(rename = "subscribe")]
    Subscribe { channel_id: ChannelId },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channel_id: ChannelId },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct ChatSendPayload {
    pub channel_id: ChannelId,
    #[validate(length(min = 1, max = 4000))]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
pub struct ChatEditPayload {
    pub message_id: MessageId,
    #[validate(length(min = 1, max = 4000))]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatDeletePayload {
    pub message_id: MessageId,
}

/// Frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake greeting with the heartbeat contract.
    #[serde(rename = "hello")]
    Hello { heartbeat_interval_ms: u64 },
    /// Connection registered and ready for traffic.
    #[serde(rename = "ready")]
    Ready {
        session_id: ConnectionId,
        user_id: UserId,
    },
    /// Liveness probe for a connection that missed its heartbeat window.
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "subscribed")]
    Subscribed { channel_id: ChannelId },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { channel_id: ChannelId },
    #[serde(rename = "message.created")]
    MessageCreated(MessageEvent),
    #[serde(rename = "message.updated")]
    MessageUpdated(MessageEvent),
    #[serde(rename = "message.deleted")]
    MessageDeleted(MessageDeletedEvent),
    #[serde(rename = "typing.changed")]
    TypingChanged(TypingEvent),
    #[serde(rename = "presence.changed")]
    PresenceChanged(PresenceEvent),
    #[serde(rename = "error")]
    Error { code: &'static str, message: String },
}

impl From<GatewayEvent> for ServerFrame {
    fn from(event: GatewayEvent) -> Self {
        match event {
            GatewayEvent::MessageCreated(e) => ServerFrame::MessageCreated(e),
            GatewayEvent::MessageUpdated(e) => ServerFrame::MessageUpdated(e),
            GatewayEvent::MessageDeleted(e) => ServerFrame::MessageDeleted(e),
            GatewayEvent::TypingChanged(e) => ServerFrame::TypingChanged(e),
            GatewayEvent::PresenceChanged(e) => ServerFrame::PresenceChanged(e),
        }
    }
}
