//! # Transactional Outbox
//!
//! Outbound envelopes are appended in the same transaction as the business
//! state they belong to; dispatcher workers later claim committed rows and
//! publish them. Delivery is at-least-once: effects rely on consumer-side
//! idempotency, not on publish-exactly-once.
//!
//! Claim rule: a row is visible for claim iff `status IN (NEW, FAILED)` and
//! `next_at` is null or due. CLAIMED rows older than the claim timeout are
//! re-claimable. `attempts` is incremented once per claim; `reschedule` does
//! not touch it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{ConductorError, ConductorResult};
use crate::messaging::envelope::{headers, Envelope, MessageCategory};

/// Publish backoff cap
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Publish backoff base
pub const BASE_BACKOFF_MS: u64 = 1_000;

/// Outbox row lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    New,
    Claimed,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Claimed => "CLAIMED",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NEW" => Ok(OutboxStatus::New),
            "CLAIMED" => Ok(OutboxStatus::Claimed),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

impl TryFrom<String> for OutboxStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One queued outbound envelope
#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub category: String,
    pub topic: String,
    pub key: Option<String>,
    #[sqlx(rename = "type")]
    pub message_type: String,
    pub payload: String,
    pub headers: Json<HashMap<String, String>>,
    #[sqlx(try_from = "String")]
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxRow {
    /// Append an envelope to the outbox inside the caller's transaction.
    ///
    /// The envelope's identity fields travel in the headers column so the
    /// row publishes back into an identical envelope.
    pub async fn enqueue(
        executor: impl sqlx::PgExecutor<'_>,
        topic: &str,
        key: Option<&str>,
        envelope: &Envelope,
    ) -> ConductorResult<i64> {
        let mut row_headers = envelope.headers.clone();
        row_headers.insert(
            headers::MESSAGE_ID.to_string(),
            envelope.message_id.to_string(),
        );
        row_headers.insert(
            headers::CORRELATION_ID.to_string(),
            envelope.correlation_id.to_string(),
        );
        row_headers.insert(
            headers::BUSINESS_KEY.to_string(),
            envelope.business_key.clone(),
        );
        if let Some(command_id) = envelope.command_id {
            row_headers.insert(headers::COMMAND_ID.to_string(), command_id.to_string());
        }
        if let Some(causation_id) = envelope.causation_id {
            row_headers.insert(headers::CAUSATION_ID.to_string(), causation_id.to_string());
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (category, topic, key, type, payload, headers, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'NEW')
            RETURNING id
            "#,
        )
        .bind(envelope.category.as_str())
        .bind(topic)
        .bind(key)
        .bind(&envelope.message_type)
        .bind(&envelope.payload)
        .bind(Json(&row_headers))
        .fetch_one(executor)
        .await?;
        Ok(id)
    }

    /// Rebuild the wire envelope from this row
    pub fn to_envelope(&self) -> ConductorResult<Envelope> {
        let header_uuid = |name: &str| -> ConductorResult<Uuid> {
            self.headers
                .0
                .get(name)
                .ok_or_else(|| {
                    ConductorError::validation(format!("outbox row {} missing {name}", self.id))
                })?
                .parse()
                .map_err(|e| {
                    ConductorError::validation(format!(
                        "outbox row {} has invalid {name}: {e}",
                        self.id
                    ))
                })
        };

        let category: MessageCategory = self
            .category
            .parse()
            .map_err(ConductorError::validation)?;
        let message_id = header_uuid(headers::MESSAGE_ID)?;
        let correlation_id = header_uuid(headers::CORRELATION_ID)?;
        let command_id = match self.headers.0.get(headers::COMMAND_ID) {
            Some(_) => Some(header_uuid(headers::COMMAND_ID)?),
            None => None,
        };
        let causation_id = match self.headers.0.get(headers::CAUSATION_ID) {
            Some(_) => Some(header_uuid(headers::CAUSATION_ID)?),
            None => None,
        };
        let business_key = self
            .headers
            .0
            .get(headers::BUSINESS_KEY)
            .cloned()
            .unwrap_or_default();

        Ok(Envelope {
            message_id,
            category,
            message_type: self.message_type.clone(),
            command_id,
            correlation_id,
            causation_id,
            created_at: self.created_at,
            business_key,
            headers: self.headers.0.clone(),
            payload: self.payload.clone(),
        })
    }

    /// Atomically claim a single NEW row.
    ///
    /// Returns the claimed row, or `None` if the row was not NEW.
    pub async fn claim_if_new(
        executor: impl sqlx::PgExecutor<'_>,
        id: i64,
        claimer: &str,
    ) -> ConductorResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            UPDATE outbox
            SET status = 'CLAIMED', claimed_by = $2, attempts = attempts + 1
            WHERE id = $1 AND status = 'NEW'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(claimer)
        .fetch_optional(executor)
        .await?;
        Ok(row)
    }

    /// Claim up to `max` visible rows in one statement.
    ///
    /// Skip-locked candidate selection keeps concurrent sweepers disjoint.
    /// Rows are returned FIFO by `created_at`. CLAIMED rows older than
    /// `claim_timeout` are treated as abandoned and re-claimed.
    pub async fn sweep(
        executor: impl sqlx::PgExecutor<'_>,
        max: i64,
        claimer: &str,
        claim_timeout: Duration,
    ) -> ConductorResult<Vec<Self>> {
        let timeout_seconds = claim_timeout.as_secs() as f64;
        let mut rows = sqlx::query_as::<_, Self>(
            r#"
            WITH candidate AS (
                SELECT id FROM outbox
                WHERE (status IN ('NEW', 'FAILED') AND (next_at IS NULL OR next_at <= now()))
                   OR (status = 'CLAIMED' AND created_at < now() - make_interval(secs => $3))
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox o
            SET status = 'CLAIMED', claimed_by = $2, attempts = o.attempts + 1
            FROM candidate c
            WHERE o.id = c.id
            RETURNING o.*
            "#,
        )
        .bind(max)
        .bind(claimer)
        .bind(timeout_seconds)
        .fetch_all(executor)
        .await?;
        // UPDATE ... RETURNING does not preserve the CTE ordering
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    /// Terminal success: the envelope reached the transport
    pub async fn mark_published(
        executor: impl sqlx::PgExecutor<'_>,
        id: i64,
    ) -> ConductorResult<()> {
        sqlx::query(
            "UPDATE outbox SET status = 'PUBLISHED', published_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Push the next attempt out by `backoff`, keeping the current status.
    ///
    /// Does not increment `attempts`; the next claim does.
    pub async fn reschedule(
        executor: impl sqlx::PgExecutor<'_>,
        id: i64,
        backoff: Duration,
        error: &str,
    ) -> ConductorResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'NEW', claimed_by = NULL,
                next_at = now() + make_interval(secs => $2), last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(backoff.as_secs_f64())
        .bind(error)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Record a failed publish; the sweeper retries once `next_attempt` is due
    pub async fn mark_failed(
        executor: impl sqlx::PgExecutor<'_>,
        id: i64,
        error: &str,
        next_attempt: DateTime<Utc>,
    ) -> ConductorResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'FAILED', claimed_by = NULL, next_at = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_attempt)
        .bind(error)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Reset abandoned CLAIMED rows back to NEW. Returns the reset count.
    pub async fn recover_stuck(
        executor: impl sqlx::PgExecutor<'_>,
        older_than: Duration,
    ) -> ConductorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'NEW', claimed_by = NULL, next_at = NULL
            WHERE status = 'CLAIMED' AND created_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs() as f64)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_id(
        executor: impl sqlx::PgExecutor<'_>,
        id: i64,
    ) -> ConductorResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM outbox WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(row)
    }

    pub async fn find_by_status(
        executor: impl sqlx::PgExecutor<'_>,
        status: OutboxStatus,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM outbox WHERE status = $1 ORDER BY created_at, id",
        )
        .bind(status.as_str())
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }
}

/// Exponential publish backoff for attempt `n` (0-based):
/// `min(2^n * base, max)`.
pub fn publish_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let shifted = base_ms.saturating_mul(1_u64.checked_shl(attempt).unwrap_or(u64::MAX));
    Duration::from_millis(shifted.min(max_ms))
}

/// Default-policy backoff: `min(2^n * 1000ms, 30s)`
pub fn default_publish_backoff(attempt: u32) -> Duration {
    publish_backoff(attempt, BASE_BACKOFF_MS, MAX_BACKOFF_MS)
}
