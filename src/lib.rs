//! # Signalink Gateway
//!
//! Real-time fan-out and presence subsystem for the Signalink chat product:
//! - WebSocket gateway for chat, typing, and presence traffic
//! - Redis pub/sub backbone for cross-instance fan-out
//! - PostgreSQL for message persistence
//! - Redis streams as the downstream event log
//!
//! ## Module Structure
//!
//! ```text
//! signalink_gateway/
//! +-- config/         Configuration management
//! +-- domain/         Events, topics, and collaborator traits
//! +-- gateway/        Registry, heartbeat, presence, typing, bridge, router
//! +-- infrastructure/ Database, event log, auth, and metrics
//! +-- presentation/   HTTP routes and the WebSocket handler
//! +-- shared/         Common utilities (errors)
//! ```

// Configuration module
pub mod config;

// Domain layer - events, topics, collaborator contracts
pub mod domain;

// Gateway core - connection and fan-out machinery
pub mod gateway;

// Infrastructure layer - external implementations
pub mod infrastructure;

// Presentation layer - HTTP and WebSocket handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
