//! CORS Middleware Configuration

use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};

use crate::config::CorsSettings;

/// Build the CORS layer for the gateway's HTTP surface.
///
/// An empty origin list means a local development setup: the layer is left
/// wide open. Otherwise only the configured origins may call in, and browsers
/// cache preflight results for the configured `max_age_secs`.
pub fn create_cors_layer(settings: &CorsSettings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(settings.max_age())
    }
}
