//! Gateway Events and Topics
//!
//! `GatewayEvent` is the cluster-wide fan-out event carried over the pub/sub
//! backbone; `Topic` scopes who receives it. `DomainEvent` is the immutable
//! record handed to the external event log for downstream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::collaborators::MessageRecord;
use super::presence::PresenceStatus;
use super::{ChannelId, MessageId, UserId};

/// Pub/sub topic. One topic per channel for chat and typing events, one topic
/// per user for presence events, so fan-out cost is bounded to interested
/// parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Channel(ChannelId),
    Presence(UserId),
}

impl Topic {
    /// Broker-side topic name.
    pub fn name(&self) -> String {
        match self {
            Topic::Channel(id) => format!("channel:{id}"),
            Topic::Presence(id) => format!("presence:{id}"),
        }
    }

    /// Parse a broker topic name back into a topic.
    pub fn parse(name: &str) -> Option<Topic> {
        if let Some(raw) = name.strip_prefix("channel:") {
            return Uuid::parse_str(raw).ok().map(Topic::Channel);
        }
        if let Some(raw) = name.strip_prefix("presence:") {
            return Uuid::parse_str(raw).ok().map(Topic::Presence);
        }
        None
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Cluster-wide fan-out event (broker wire format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum GatewayEvent {
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
}

impl GatewayEvent {
    /// Event kind tag, used for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::MessageCreated(_) => "message.created",
            GatewayEvent::MessageUpdated(_) => "message.updated",
            GatewayEvent::MessageDeleted(_) => "message.deleted",
            GatewayEvent::TypingChanged(_) => "typing.changed",
            GatewayEvent::PresenceChanged(_) => "presence.changed",
        }
    }
}

/// Payload for created/updated message events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl MessageEvent {
    pub fn from_record(record: &MessageRecord, author_name: &str) -> Self {
        Self {
            id: record.id,
            channel_id: record.channel_id,
            author_id: record.author_id,
            author_name: author_name.to_string(),
            content: record.content.clone(),
            created_at: record.created_at,
            edited_at: record.edited_at,
        }
    }
}

/// Payload for deleted message events. Content is not echoed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeletedEvent {
    pub id: MessageId,
    pub channel_id: ChannelId,
}

/// Payload for typing indicator changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub typing: bool,
}

/// Payload for presence transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub changed_at: DateTime<Utc>,
}

/// Category of a domain event, mapped to an event-log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    MessageCreated,
    MessageEdited,
    MessageDeleted,
    PresenceChanged,
    TypingChanged,
}

impl DomainEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEventKind::MessageCreated => "message.created",
            DomainEventKind::MessageEdited => "message.edited",
            DomainEventKind::MessageDeleted => "message.deleted",
            DomainEventKind::PresenceChanged => "presence.changed",
            DomainEventKind::TypingChanged => "typing.changed",
        }
    }

    /// Event-log stream this category is appended to.
    pub fn stream(&self) -> &'static str {
        match self {
            DomainEventKind::MessageCreated
            | DomainEventKind::MessageEdited
            | DomainEventKind::MessageDeleted => "signalink:messages",
            DomainEventKind::PresenceChanged => "signalink:presence",
            DomainEventKind::TypingChanged => "signalink:typing",
        }
    }
}

/// Immutable record of something that happened, produced once per originating
/// action and handed off to the event-log collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    #[serde(rename = "event_type")]
    pub kind: DomainEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl DomainEvent {
    fn new(kind: DomainEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            user_id: None,
            channel_id: None,
            message_id: None,
            payload: None,
        }
    }

    pub fn message_created(record: &MessageRecord) -> Self {
        Self::message_event(DomainEventKind::MessageCreated, record)
    }

    pub fn message_edited(record: &MessageRecord) -> Self {
        Self::message_event(DomainEventKind::MessageEdited, record)
    }

    pub fn message_deleted(record: &MessageRecord) -> Self {
        let mut event = Self::new(DomainEventKind::MessageDeleted);
        event.user_id = Some(record.author_id);
        event.channel_id = Some(record.channel_id);
        event.message_id = Some(record.id);
        event
    }

    pub fn presence_changed(user_id: UserId, status: PresenceStatus) -> Self {
        let mut event = Self::new(DomainEventKind::PresenceChanged);
        event.user_id = Some(user_id);
        event.payload = Some(serde_json::json!({ "status": status.as_str() }));
        event
    }

    pub fn typing_changed(channel_id: ChannelId, user_id: UserId, typing: bool) -> Self {
        let mut event = Self::new(DomainEventKind::TypingChanged);
        event.user_id = Some(user_id);
        event.channel_id = Some(channel_id);
        event.payload = Some(serde_json::json!({ "typing": typing }));
        event
    }

    fn message_event(kind: DomainEventKind, record: &MessageRecord) -> Self {
        let mut event = Self::new(kind);
        event.user_id = Some(record.author_id);
        event.channel_id = Some(record.channel_id);
        event.message_id = Some(record.id);
        event.payload = Some(serde_json::json!({ "content": record.content }));
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn topic_names_round_trip() {
        let channel = Topic::Channel(Uuid::new_v4());
        let presence = Topic::Presence(Uuid::new_v4());
        assert_eq!(Topic::parse(&channel.name()), Some(channel));
        assert_eq!(Topic::parse(&presence.name()), Some(presence));
    }

    #[test_case("channel:not-a-uuid")]
    #[test_case("queue:0193a1a4-0000-7000-8000-000000000000")]
    #[test_case("")]
    fn invalid_topic_names_are_rejected(name: &str) {
        assert_eq!(Topic::parse(name), None);
    }

    #[test]
    fn gateway_event_wire_format_is_tagged() {
        let event = GatewayEvent::TypingChanged(TypingEvent {
            channel_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            typing: true,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""t":"typing.changed""#));
        let back: GatewayEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn domain_event_streams_by_category() {
        assert_eq!(DomainEventKind::MessageCreated.stream(), "signalink:messages");
        assert_eq!(DomainEventKind::PresenceChanged.stream(), "signalink:presence");
        assert_eq!(DomainEventKind::TypingChanged.stream(), "signalink:typing");
    }
}
