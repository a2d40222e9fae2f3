//! # Process Instance and Log
//!
//! The `process` table is the authoritative snapshot for cheap lookup;
//! `process_log` is the append-only event history for audit. Event inserts
//! are atomic with the instance update by running on the same transaction
//! connection. Crash recovery reads the snapshot; there is no
//! replay-to-rebuild path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::ConductorResult;

/// Reserved data-key prefix holding parallel fan-out state
pub const PARALLEL_KEY_PREFIX: &str = "_parallel_";

/// Branch state markers inside a `_parallel_<step>` entry
pub const BRANCH_PENDING: &str = "PENDING";
pub const BRANCH_COMPLETED: &str = "COMPLETED";

/// Process instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    New,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    Paused,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::New => "NEW",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Succeeded => "SUCCEEDED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Compensating => "COMPENSATING",
            ProcessStatus::Compensated => "COMPENSATED",
            ProcessStatus::Paused => "PAUSED",
        }
    }

    /// Terminal states accept no further replies
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Succeeded | ProcessStatus::Failed | ProcessStatus::Compensated
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NEW" => Ok(ProcessStatus::New),
            "RUNNING" => Ok(ProcessStatus::Running),
            "SUCCEEDED" => Ok(ProcessStatus::Succeeded),
            "FAILED" => Ok(ProcessStatus::Failed),
            "COMPENSATING" => Ok(ProcessStatus::Compensating),
            "COMPENSATED" => Ok(ProcessStatus::Compensated),
            "PAUSED" => Ok(ProcessStatus::Paused),
            other => Err(format!("unknown process status: {other}")),
        }
    }
}

impl TryFrom<String> for ProcessStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Events appended to the process log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProcessEvent {
    ProcessStarted {
        process_type: String,
    },
    StepStarted {
        step: String,
        /// Command id, or `PARALLEL:<n>` for a fan-out
        command: String,
    },
    StepCompleted {
        step: String,
        command_id: Option<Uuid>,
    },
    StepFailed {
        step: String,
        command_id: Option<Uuid>,
        error: String,
        retryable: bool,
    },
    StepTimedOut {
        step: String,
        command_id: Option<Uuid>,
        error: String,
    },
    CompensationStarted {
        step: String,
        command_id: Uuid,
    },
    CompensationCompleted {
        step: String,
    },
    CompensationFailed {
        step: String,
        error: String,
    },
    ProcessCompleted,
    ProcessFailed {
        error: String,
    },
    ProcessPaused,
    ProcessResumed,
}

impl ProcessEvent {
    /// Event name, matching the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            ProcessEvent::ProcessStarted { .. } => "ProcessStarted",
            ProcessEvent::StepStarted { .. } => "StepStarted",
            ProcessEvent::StepCompleted { .. } => "StepCompleted",
            ProcessEvent::StepFailed { .. } => "StepFailed",
            ProcessEvent::StepTimedOut { .. } => "StepTimedOut",
            ProcessEvent::CompensationStarted { .. } => "CompensationStarted",
            ProcessEvent::CompensationCompleted { .. } => "CompensationCompleted",
            ProcessEvent::CompensationFailed { .. } => "CompensationFailed",
            ProcessEvent::ProcessCompleted => "ProcessCompleted",
            ProcessEvent::ProcessFailed { .. } => "ProcessFailed",
            ProcessEvent::ProcessPaused => "ProcessPaused",
            ProcessEvent::ProcessResumed => "ProcessResumed",
        }
    }
}

/// One row of the append-only process log
#[derive(Debug, Clone, FromRow)]
pub struct ProcessLogEntry {
    pub id: i64,
    pub process_id: Uuid,
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub event: Json<ProcessEvent>,
}

/// Durable per-instance state snapshot
#[derive(Debug, Clone, FromRow)]
pub struct ProcessInstance {
    pub process_id: Uuid,
    pub process_type: String,
    pub business_key: String,
    #[sqlx(try_from = "String")]
    pub status: ProcessStatus,
    pub current_step: Option<String>,
    pub data: Json<Map<String, Value>>,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessInstance {
    /// Create a new instance in NEW with the caller's initial data
    pub fn new(
        process_type: impl Into<String>,
        business_key: impl Into<String>,
        initial_data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_id: Uuid::now_v7(),
            process_type: process_type.into(),
            business_key: business_key.into(),
            status: ProcessStatus::New,
            current_step: None,
            data: Json(initial_data),
            retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge reply data into instance data, skipping routing echoes
    pub fn merge_data(&mut self, incoming: &Map<String, Value>, skip: &[&str]) {
        for (key, value) in incoming {
            if skip.contains(&key.as_str()) {
                continue;
            }
            self.data.0.insert(key.clone(), value.clone());
        }
    }

    /// Reserved data key for a parallel step's fan-out state
    pub fn parallel_key(step: &str) -> String {
        format!("{PARALLEL_KEY_PREFIX}{step}")
    }

    /// Initialize fan-out state: every branch starts PENDING
    pub fn init_parallel(&mut self, step: &str, branches: &[String]) {
        let mut state = Map::new();
        for branch in branches {
            state.insert(branch.clone(), Value::String(BRANCH_PENDING.to_string()));
        }
        self.data
            .0
            .insert(Self::parallel_key(step), Value::Object(state));
    }

    /// Locate the parallel parent step tracking the given branch.
    ///
    /// Returns `(parent_step, data_key)` for the first `_parallel_*` entry
    /// containing the branch.
    pub fn find_parallel_parent(&self, branch: &str) -> Option<(String, String)> {
        for (key, value) in &self.data.0 {
            if let Some(step) = key.strip_prefix(PARALLEL_KEY_PREFIX) {
                if value
                    .as_object()
                    .is_some_and(|state| state.contains_key(branch))
                {
                    return Some((step.to_string(), key.clone()));
                }
            }
        }
        None
    }

    /// Mark a branch COMPLETED inside the given fan-out entry
    pub fn complete_branch(&mut self, data_key: &str, branch: &str) {
        if let Some(Value::Object(state)) = self.data.0.get_mut(data_key) {
            state.insert(
                branch.to_string(),
                Value::String(BRANCH_COMPLETED.to_string()),
            );
        }
    }

    /// Whether every branch in the fan-out entry has completed
    pub fn all_branches_completed(&self, data_key: &str) -> bool {
        match self.data.0.get(data_key).and_then(Value::as_object) {
            Some(state) => state
                .values()
                .all(|v| v.as_str() == Some(BRANCH_COMPLETED)),
            None => false,
        }
    }

    /// Drop a fan-out entry once the join has been reached
    pub fn clear_parallel(&mut self, data_key: &str) {
        self.data.0.remove(data_key);
    }

    // -------------------------------------------------------------------------
    // Repository operations
    // -------------------------------------------------------------------------

    /// Insert the instance row
    pub async fn insert(&self, executor: impl sqlx::PgExecutor<'_>) -> ConductorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO process
                (process_id, process_type, business_key, status, current_step, data, retries,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(self.process_id)
        .bind(&self.process_type)
        .bind(&self.business_key)
        .bind(self.status.as_str())
        .bind(&self.current_step)
        .bind(&self.data)
        .bind(self.retries)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Persist the mutable fields of the snapshot
    pub async fn update(&mut self, executor: impl sqlx::PgExecutor<'_>) -> ConductorResult<()> {
        self.updated_at = Utc::now();
        sqlx::query(
            r#"
            UPDATE process
            SET status = $2, current_step = $3, data = $4, retries = $5, updated_at = $6
            WHERE process_id = $1
            "#,
        )
        .bind(self.process_id)
        .bind(self.status.as_str())
        .bind(&self.current_step)
        .bind(&self.data)
        .bind(self.retries)
        .bind(self.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(
        executor: impl sqlx::PgExecutor<'_>,
        process_id: Uuid,
    ) -> ConductorResult<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM process WHERE process_id = $1")
            .bind(process_id)
            .fetch_optional(executor)
            .await?;
        Ok(row)
    }

    pub async fn find_by_business_key(
        executor: impl sqlx::PgExecutor<'_>,
        business_key: &str,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM process WHERE business_key = $1 ORDER BY created_at",
        )
        .bind(business_key)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    pub async fn find_by_status(
        executor: impl sqlx::PgExecutor<'_>,
        status: ProcessStatus,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM process WHERE status = $1 ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    pub async fn find_by_type_and_status(
        executor: impl sqlx::PgExecutor<'_>,
        process_type: &str,
        status: ProcessStatus,
    ) -> ConductorResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM process WHERE process_type = $1 AND status = $2 ORDER BY created_at",
        )
        .bind(process_type)
        .bind(status.as_str())
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    /// Append an event to the instance's log, returning the new sequence.
    ///
    /// Runs on the caller's transaction connection so the append commits or
    /// rolls back with the snapshot update it belongs to.
    pub async fn log(
        executor: impl sqlx::PgExecutor<'_>,
        process_id: Uuid,
        event: &ProcessEvent,
    ) -> ConductorResult<i64> {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO process_log (process_id, sequence, event)
            SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2
            FROM process_log
            WHERE process_id = $1
            RETURNING sequence
            "#,
        )
        .bind(process_id)
        .bind(Json(event))
        .fetch_one(executor)
        .await?;
        Ok(sequence)
    }

    /// Full event history for an instance, in append order
    pub async fn log_entries(
        executor: impl sqlx::PgExecutor<'_>,
        process_id: Uuid,
    ) -> ConductorResult<Vec<ProcessLogEntry>> {
        let rows = sqlx::query_as::<_, ProcessLogEntry>(
            "SELECT * FROM process_log WHERE process_id = $1 ORDER BY sequence",
        )
        .bind(process_id)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }
}
