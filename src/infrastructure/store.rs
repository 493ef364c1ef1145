//! Message Store Implementation
//!
//! PostgreSQL implementation of the persistence collaborator. Edits and
//! deletes are author-scoped in the query itself, so ownership enforcement
//! and existence checking happen in a single round trip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{MessageRecord, MessageStore, MessageId, NewMessage, UserId};
use crate::shared::error::GatewayError;

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish "no such message" from "not yours": a second existence
    /// probe only on the failure path.
    async fn classify_miss(&self, id: MessageId) -> GatewayError {
        match sqlx::query_scalar::<_, i32>("SELECT 1 FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => GatewayError::Forbidden("message belongs to another user".into()),
            Ok(None) => GatewayError::NotFound(format!("message {id}")),
            Err(err) => err.into(),
        }
    }
}

/// Internal row type for message queries.
#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    channel_id: Uuid,
    author_id: Uuid,
    content: String,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    fn into_record(self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            channel_id: self.channel_id,
            author_id: self.author_id,
            content: self.content,
            created_at: self.created_at,
            edited_at: self.edited_at,
        }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_message(&self, message: NewMessage) -> Result<MessageRecord, GatewayError> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (id, channel_id, author_id, content)
            VALUES ($1, $2, $3, $4)
            RETURNING id, channel_id, author_id, content, created_at, edited_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message.channel_id)
        .bind(message.author_id)
        .bind(&message.content)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_record())
    }

    async fn edit_message(
        &self,
        id: MessageId,
        editor: UserId,
        content: String,
    ) -> Result<MessageRecord, GatewayError> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages
            SET content = $3, edited_at = NOW()
            WHERE id = $1 AND author_id = $2
            RETURNING id, channel_id, author_id, content, created_at, edited_at
            "#,
        )
        .bind(id)
        .bind(editor)
        .bind(&content)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into_record()),
            None => Err(self.classify_miss(id).await),
        }
    }

    async fn delete_message(
        &self,
        id: MessageId,
        requester: UserId,
    ) -> Result<MessageRecord, GatewayError> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            DELETE FROM messages
            WHERE id = $1 AND author_id = $2
            RETURNING id, channel_id, author_id, content, created_at, edited_at
            "#,
        )
        .bind(id)
        .bind(requester)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into_record()),
            None => Err(self.classify_miss(id).await),
        }
    }
}
