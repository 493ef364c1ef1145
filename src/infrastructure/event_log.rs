//! Redis Stream Event Log
//!
//! Appends domain events to per-category Redis streams for downstream
//! consumers (analytics, notifications). Recording is fire-and-forget through
//! a bounded queue; the fan-out path never waits on event-log I/O.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::domain::{DomainEvent, EventSink};
use crate::infrastructure::metrics;

pub struct RedisEventLog {
    tx: mpsc::Sender<DomainEvent>,
}

impl RedisEventLog {
    /// Spawn the append worker and return the sink handle.
    pub fn spawn(conn: ConnectionManager, queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_depth);
        tokio::spawn(append_worker(conn, rx));
        Arc::new(Self { tx })
    }
}

impl EventSink for RedisEventLog {
    fn record(&self, event: DomainEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            tracing::warn!(
                kind = event.kind.as_str(),
                "event log queue full; dropping event"
            );
            metrics::record_dropped_event();
        }
    }
}

async fn append_worker(mut conn: ConnectionManager, mut rx: mpsc::Receiver<DomainEvent>) {
    while let Some(event) = rx.recv().await {
        let stream = event.kind.stream();
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "unserializable domain event");
                continue;
            }
        };
        // A lost append is acceptable; losing the fan-out path is not.
        if let Err(err) = conn
            .xadd::<&str, &str, &str, &str, String>(stream, "*", &[("event", &payload)])
            .await
        {
            tracing::error!(stream, error = %err, "event log append failed");
            metrics::record_dropped_event();
        }
    }
    tracing::debug!("event log queue closed; append worker exiting");
}
