//! # Command Registry
//!
//! The `command` table tracks every dispatched command from PENDING through
//! RUNNING to a terminal status. The partial unique index on
//! `idempotency_key WHERE status = 'PENDING'` is the single source of truth
//! for duplicate submissions; inserts surface collisions as
//! [`ConductorError::IdempotencyConflict`] rather than emulating the check
//! with read-then-write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::classifier::is_unique_violation;
use crate::errors::{ConductorError, ConductorResult};

/// Command lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Succeeded => "SUCCEEDED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::TimedOut => "TIMED_OUT",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::TimedOut
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(CommandStatus::Pending),
            "RUNNING" => Ok(CommandStatus::Running),
            "SUCCEEDED" => Ok(CommandStatus::Succeeded),
            "FAILED" => Ok(CommandStatus::Failed),
            "TIMED_OUT" => Ok(CommandStatus::TimedOut),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

impl TryFrom<String> for CommandStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Reply-routing hints persisted with the command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRouting {
    pub reply_to: String,
    pub correlation_id: Uuid,
}

/// One row of the command registry
#[derive(Debug, Clone, FromRow)]
pub struct CommandRow {
    pub id: Uuid,
    pub name: String,
    pub business_key: String,
    pub payload: Json<Value>,
    pub idempotency_key: String,
    #[sqlx(try_from = "String")]
    pub status: CommandStatus,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retries: i32,
    pub processing_lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reply: Option<Json<ReplyRouting>>,
}

impl CommandRow {
    /// Build a PENDING command ready for insert
    pub fn new(
        name: impl Into<String>,
        business_key: impl Into<String>,
        payload: Value,
        idempotency_key: impl Into<String>,
        reply: ReplyRouting,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            business_key: business_key.into(),
            payload: Json(payload),
            idempotency_key: idempotency_key.into(),
            status: CommandStatus::Pending,
            requested_at: now,
            updated_at: now,
            retries: 0,
            processing_lease_until: None,
            last_error: None,
            reply: Some(Json(reply)),
        }
    }

    /// Insert the command; an idempotency-key collision with another PENDING
    /// command is a permanent error.
    pub async fn insert(&self, executor: impl sqlx::PgExecutor<'_>) -> ConductorResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO command
                (id, name, business_key, payload, idempotency_key, status, requested_at,
                 updated_at, retries, processing_lease_until, last_error, reply)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.business_key)
        .bind(&self.payload)
        .bind(&self.idempotency_key)
        .bind(self.status.as_str())
        .bind(self.requested_at)
        .bind(self.updated_at)
        .bind(self.retries)
        .bind(self.processing_lease_until)
        .bind(&self.last_error)
        .bind(&self.reply)
        .execute(executor)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(ConductorError::IdempotencyConflict {
                key: self.idempotency_key.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_id(
        executor: impl sqlx::PgExecutor<'_>,
        id: Uuid,
    ) -> ConductorResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM command WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(row)
    }

    pub async fn find_by_idempotency_key(
        executor: impl sqlx::PgExecutor<'_>,
        key: &str,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM command WHERE idempotency_key = $1 ORDER BY requested_at",
        )
        .bind(key)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    /// Transition PENDING → RUNNING with a processing lease
    pub async fn mark_running(
        executor: impl sqlx::PgExecutor<'_>,
        id: Uuid,
        lease_until: DateTime<Utc>,
    ) -> ConductorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE command
            SET status = 'RUNNING', processing_lease_until = $2, updated_at = now()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(lease_until)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Transition to a terminal status, recording the error if any
    pub async fn mark_terminal(
        executor: impl sqlx::PgExecutor<'_>,
        id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> ConductorResult<()> {
        debug_assert!(status.is_terminal());
        sqlx::query(
            r#"
            UPDATE command
            SET status = $2, last_error = $3, processing_lease_until = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Expire RUNNING commands whose lease has passed.
    ///
    /// Transitions them to TIMED_OUT with "Lease expired" in one statement
    /// and returns the expired rows so the caller can feed them through the
    /// reply pipeline.
    pub async fn expire_leases(
        executor: impl sqlx::PgExecutor<'_>,
        now: DateTime<Utc>,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            UPDATE command
            SET status = 'TIMED_OUT', last_error = 'Lease expired',
                processing_lease_until = NULL, updated_at = now()
            WHERE status = 'RUNNING' AND processing_lease_until < $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }
}
