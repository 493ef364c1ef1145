//! # Domain Layer
//!
//! Core vocabulary of the real-time gateway: identifiers, presence states,
//! fan-out events, event-log records, and the traits behind which the
//! conventional parts of the product (authentication, persistence, event log)
//! live.
//!
//! ## Design Principles
//!
//! - No dependencies on infrastructure or presentation layers
//! - Collaborator traits define the gateway's external contracts
//! - Presence is a derived view, never stored truth

pub mod collaborators;
pub mod event;
pub mod presence;

pub use collaborators::{Authenticator, EventSink, Identity, MessageRecord, MessageStore, NewMessage};
#[cfg(test)]
pub use collaborators::MockMessageStore;
pub use event::{
    DomainEvent, DomainEventKind, GatewayEvent, MessageDeletedEvent, MessageEvent, PresenceEvent,
    Topic, TypingEvent,
};
pub use presence::PresenceStatus;

use uuid::Uuid;

/// Logical user identifier (one human, any number of devices).
pub type UserId = Uuid;

/// Channel identifier.
pub type ChannelId = Uuid;

/// Message identifier.
pub type MessageId = Uuid;

/// Connection identifier (one socket session), unique per process lifetime.
pub type ConnectionId = Uuid;
