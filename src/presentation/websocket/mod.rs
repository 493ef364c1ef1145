//! WebSocket transport for the real-time gateway.

pub mod handler;

pub use handler::ws_handler;
