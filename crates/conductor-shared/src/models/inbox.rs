//! # Inbox Dedup
//!
//! At-most-once reply processing per handler: a conditional insert on the
//! (`message_id`, `handler`) key. A false return means the message has been
//! processed before and must be dropped. The insert runs on the handler's
//! transaction connection so a failed handler rolls the mark back and the
//! transport redelivery gets another chance.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::ConductorResult;

/// One processed-message marker
#[derive(Debug, Clone, FromRow)]
pub struct InboxKey {
    pub message_id: Uuid,
    pub handler: String,
    pub processed_at: DateTime<Utc>,
}

impl InboxKey {
    /// Insert the (message, handler) marker if absent.
    ///
    /// Returns `true` iff the row was inserted, i.e. this is the first
    /// delivery seen by this handler.
    pub async fn mark_if_absent(
        executor: impl sqlx::PgExecutor<'_>,
        message_id: Uuid,
        handler: &str,
    ) -> ConductorResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (message_id, handler)
            VALUES ($1, $2)
            ON CONFLICT (message_id, handler) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(handler)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn find(
        executor: impl sqlx::PgExecutor<'_>,
        message_id: Uuid,
        handler: &str,
    ) -> ConductorResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT * FROM inbox WHERE message_id = $1 AND handler = $2",
        )
        .bind(message_id)
        .bind(handler)
        .fetch_optional(executor)
        .await?;
        Ok(row)
    }
}
