//! Collaborator Contracts
//!
//! The gateway's narrow interfaces to the conventional parts of the product:
//! authentication, message persistence, and the downstream event log. The
//! gateway never reaches past these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::event::DomainEvent;
use super::{ChannelId, MessageId, UserId};
use crate::shared::error::GatewayError;

/// Validated identity of a client, produced by the authentication
/// collaborator before a connection may enter the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

/// Authentication collaborator. An unauthenticated socket is invalid input
/// and never reaches the registry.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, GatewayError>;
}

/// A message to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
}

/// A persisted message, as returned by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// Persistence collaborator. The router calls these before publishing any
/// fan-out event and publishes nothing on failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message and return the stored record.
    async fn create_message(&self, message: NewMessage) -> Result<MessageRecord, GatewayError>;

    /// Replace the content of a message owned by `editor`.
    async fn edit_message(
        &self,
        id: MessageId,
        editor: UserId,
        content: String,
    ) -> Result<MessageRecord, GatewayError>;

    /// Delete a message owned by `requester`, returning the removed record.
    async fn delete_message(
        &self,
        id: MessageId,
        requester: UserId,
    ) -> Result<MessageRecord, GatewayError>;
}

/// Event-log collaborator. Fire-and-forget: recording an event must never
/// block or fail the real-time fan-out path.
pub trait EventSink: Send + Sync {
    fn record(&self, event: DomainEvent);
}
