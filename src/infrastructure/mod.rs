//! Infrastructure adapters: PostgreSQL persistence, Redis event log, JWT
//! authentication, and Prometheus metrics.

pub mod auth;
pub mod database;
pub mod event_log;
pub mod metrics;
pub mod store;

pub use auth::JwtAuthenticator;
pub use database::{create_pool, run_migrations};
pub use event_log::RedisEventLog;
pub use store::PgMessageStore;
