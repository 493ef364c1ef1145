//! Presentation layer: HTTP routes, WebSocket transport, and middleware.

pub mod http;
pub mod middleware;
pub mod websocket;
