//! Application Startup
//!
//! Wires the gateway components together, spawns their background tasks, and
//! runs the server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio::net::TcpListener;

use crate::config::Settings;
use crate::domain::Authenticator;
use crate::gateway::{
    ConnectionRegistry, HeartbeatMonitor, MessageRouter, PresenceTracker, PubSubBridge,
    TypingCoordinator,
};
use crate::infrastructure::{database, JwtAuthenticator, PgMessageStore, RedisEventLog};
use crate::presentation::http::routes;
use crate::presentation::middleware::{cors, logging};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: ConnectionManager,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingCoordinator>,
    pub bridge: Arc<PubSubBridge>,
    pub router: Arc<MessageRouter>,
    pub authenticator: Arc<dyn Authenticator>,
    pub settings: Arc<Settings>,
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application from settings
    pub async fn build(settings: Settings) -> Result<Self> {
        let db = database::create_pool(&settings.database).await?;
        tracing::info!("Database connection pool created");
        database::run_migrations(&db).await?;
        tracing::info!("Database migrations applied");

        let redis_client = redis::Client::open(settings.redis.url.as_str())?;
        let redis = redis_client.get_connection_manager().await?;
        tracing::info!("Redis connection established");

        let gw = &settings.gateway;
        let (registry, registry_events) = ConnectionRegistry::new();
        let (bridge, backend) = PubSubBridge::new(registry.clone(), gw.publish_queue_depth);
        let event_log = RedisEventLog::spawn(redis.clone(), gw.event_log_queue_depth);

        let typing = TypingCoordinator::new(
            bridge.clone(),
            event_log.clone(),
            gw.typing_ttl(),
            gw.typing_debounce(),
        );
        let presence = PresenceTracker::new(
            registry.clone(),
            bridge.clone(),
            event_log.clone(),
            typing.clone(),
            gw.away_threshold(),
        );
        let store = Arc::new(PgMessageStore::new(db.clone()));
        let message_router = MessageRouter::new(
            registry.clone(),
            bridge.clone(),
            presence.clone(),
            typing.clone(),
            store,
            event_log,
        );
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            bridge.clone(),
            gw.heartbeat_interval(),
            gw.heartbeat_grace(),
        );
        let authenticator: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::new(&settings.jwt));

        // Background tasks
        backend.run(
            bridge.clone(),
            redis_client,
            gw.broker_backoff_base(),
            gw.broker_backoff_max(),
        );
        tokio::spawn(presence.clone().run(registry_events, gw.presence_tick()));
        tokio::spawn(typing.clone().run(gw.typing_sweep()));
        tokio::spawn(monitor.run());

        let state = AppState {
            db,
            redis,
            registry,
            presence,
            typing,
            bridge,
            router: message_router,
            authenticator,
            settings: Arc::new(settings.clone()),
        };

        let router = routes::create_router(state)
            .layer(logging::create_trace_layer())
            .layer(cors::create_cors_layer(&settings.cors));

        let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on {}", addr);

        Ok(Self { listener, router })
    }

    /// Run the server until stopped
    pub async fn run_until_stopped(self) -> Result<()> {
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }
}
