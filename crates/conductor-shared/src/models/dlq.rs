//! # Command Dead-Letter Queue
//!
//! Append-only parking area for commands that failed terminally. Rows carry
//! enough metadata (error class, message, attempts, payload) for operators
//! to diagnose and manually replay.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::ConductorResult;
use crate::models::command::CommandRow;

/// One parked command
#[derive(Debug, Clone, FromRow)]
pub struct DlqEntry {
    pub id: i64,
    pub command_id: Uuid,
    pub command_name: String,
    pub business_key: String,
    pub payload: Json<Value>,
    pub failed_status: String,
    pub error_class: String,
    pub error_message: String,
    pub attempts: i32,
    pub parked_by: String,
    pub parked_at: DateTime<Utc>,
}

impl DlqEntry {
    /// Park a terminally failed command. Returns the DLQ row id.
    pub async fn park(
        executor: impl sqlx::PgExecutor<'_>,
        command: &CommandRow,
        error_class: &str,
        error_message: &str,
        attempts: i32,
        parked_by: &str,
    ) -> ConductorResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO command_dlq
                (command_id, command_name, business_key, payload, failed_status,
                 error_class, error_message, attempts, parked_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(command.id)
        .bind(&command.name)
        .bind(&command.business_key)
        .bind(&command.payload)
        .bind(command.status.as_str())
        .bind(error_class)
        .bind(error_message)
        .bind(attempts)
        .bind(parked_by)
        .fetch_one(executor)
        .await?;
        Ok(id)
    }

    pub async fn find_by_command_id(
        executor: impl sqlx::PgExecutor<'_>,
        command_id: Uuid,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM command_dlq WHERE command_id = $1 ORDER BY parked_at",
        )
        .bind(command_id)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    /// Most recently parked entries, newest first
    pub async fn recent(
        executor: impl sqlx::PgExecutor<'_>,
        limit: i64,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM command_dlq ORDER BY parked_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }
}
