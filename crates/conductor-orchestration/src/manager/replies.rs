//! # Reply Handling
//!
//! Completion, failure, and timeout flows for correlated replies, including
//! parallel fan-in, fail-fast, retry policy, compensation, and DLQ parking.

use serde_json::{Map, Value};
use sqlx::postgres::PgConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conductor_shared::errors::{ConductorError, ConductorResult};
use conductor_shared::messaging::{headers, Envelope};
use conductor_shared::models::{
    CommandRow, CommandStatus, DlqEntry, ProcessEvent, ProcessInstance, ProcessStatus,
};

use super::{PostCommit, ProcessManager};
use crate::definition::ProcessDefinition;

/// Reply envelope types on the wire
pub const REPLY_COMPLETED: &str = "CommandCompleted";
pub const REPLY_FAILED: &str = "CommandFailed";
pub const REPLY_TIMED_OUT: &str = "CommandTimedOut";

/// Outcome carried by a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Completed,
    Failed,
    TimedOut,
}

/// A decoded command reply
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub status: ReplyStatus,
    pub data: Map<String, Value>,
    pub error: Option<String>,
}

impl CommandReply {
    pub fn completed(data: Map<String, Value>) -> Self {
        Self {
            status: ReplyStatus::Completed,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Failed,
            data: Map::new(),
            error: Some(error.into()),
        }
    }

    pub fn timed_out(error: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::TimedOut,
            data: Map::new(),
            error: Some(error.into()),
        }
    }

    /// Attach reply data (builder style, used for branch echoes)
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// The parallel branch echo, when present
    pub fn parallel_branch(&self) -> Option<&str> {
        self.data
            .get(headers::PARALLEL_BRANCH)
            .and_then(Value::as_str)
    }

    /// Decode a reply envelope payload `{status, data, error}`.
    ///
    /// The envelope type is authoritative for the outcome; the payload
    /// status is the fallback for transports that collapse reply types.
    pub fn from_envelope(envelope: &Envelope) -> ConductorResult<Self> {
        let payload: Value = serde_json::from_str(&envelope.payload)?;

        let status = match envelope.message_type.as_str() {
            REPLY_COMPLETED => ReplyStatus::Completed,
            REPLY_FAILED => ReplyStatus::Failed,
            REPLY_TIMED_OUT => ReplyStatus::TimedOut,
            _ => match payload.get("status").and_then(Value::as_str) {
                Some("SUCCEEDED") | Some("COMPLETED") => ReplyStatus::Completed,
                Some("FAILED") => ReplyStatus::Failed,
                Some("TIMED_OUT") => ReplyStatus::TimedOut,
                other => {
                    return Err(ConductorError::validation(format!(
                        "unrecognized reply type '{}' with status {:?}",
                        envelope.message_type, other
                    )))
                }
            },
        };

        let data = payload
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let error = payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            status,
            data,
            error,
        })
    }
}

impl ProcessManager {
    /// Handle a reply on the caller's transaction connection.
    ///
    /// Returns the post-commit action to run once the caller commits.
    pub(crate) async fn handle_reply_on(
        &self,
        conn: &mut PgConnection,
        correlation_id: Uuid,
        command_id: Uuid,
        reply: CommandReply,
    ) -> ConductorResult<PostCommit> {
        // The reply settles the command itself regardless of what the
        // process does with it; a retry re-dispatch relies on the previous
        // command having left PENDING.
        let command_status = match reply.status {
            ReplyStatus::Completed => CommandStatus::Succeeded,
            ReplyStatus::Failed => CommandStatus::Failed,
            ReplyStatus::TimedOut => CommandStatus::TimedOut,
        };
        CommandRow::mark_terminal(&mut *conn, command_id, command_status, reply.error.as_deref())
            .await?;

        let Some(mut instance) = ProcessInstance::find_by_id(&mut *conn, correlation_id).await?
        else {
            warn!(
                correlation_id = %correlation_id,
                command_id = %command_id,
                "Reply for unknown correlation, dropping"
            );
            return Ok(PostCommit::None);
        };

        if instance.status.is_terminal() {
            debug!(
                process_id = %instance.process_id,
                status = %instance.status,
                command_id = %command_id,
                "Reply for terminal process, dropping"
            );
            return Ok(PostCommit::None);
        }

        let definition = self.registry.require(&instance.process_type)?;

        match reply.status {
            ReplyStatus::Completed => {
                self.handle_step_completed(conn, &mut instance, definition.as_ref(), command_id, &reply)
                    .await?;
                Ok(PostCommit::None)
            }
            ReplyStatus::Failed => {
                self.handle_step_failed(conn, &mut instance, definition.as_ref(), command_id, &reply)
                    .await
            }
            ReplyStatus::TimedOut => {
                self.handle_step_timed_out(conn, &mut instance, definition.as_ref(), command_id, &reply)
                    .await?;
                Ok(PostCommit::None)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    async fn handle_step_completed(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        command_id: Uuid,
        reply: &CommandReply,
    ) -> ConductorResult<()> {
        if instance.status == ProcessStatus::Compensating {
            if reply.parallel_branch().is_some() {
                debug!(
                    process_id = %instance.process_id,
                    command_id = %command_id,
                    "Late parallel branch reply during compensation, dropping"
                );
                return Ok(());
            }
            let step = instance.current_step.clone().unwrap_or_default();
            ProcessInstance::log(
                &mut *conn,
                instance.process_id,
                &ProcessEvent::CompensationCompleted { step },
            )
            .await?;
            instance.status = ProcessStatus::Compensated;
            instance.update(&mut *conn).await?;
            info!(process_id = %instance.process_id, "Compensation completed");
            return Ok(());
        }

        if let Some(branch) = reply.parallel_branch().map(str::to_string) {
            return self
                .handle_branch_completed(conn, instance, definition, command_id, &branch, reply)
                .await;
        }

        let Some(step) = instance.current_step.clone() else {
            warn!(
                process_id = %instance.process_id,
                command_id = %command_id,
                "Completion reply for process without a current step, dropping"
            );
            return Ok(());
        };

        instance.merge_data(&reply.data, &[headers::PARALLEL_BRANCH]);
        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::StepCompleted {
                step: step.clone(),
                command_id: Some(command_id),
            },
        )
        .await?;

        let next = definition
            .graph()
            .next_step(&step, &instance.data.0)
            .map(str::to_string);

        match next {
            Some(next_step) => {
                instance.current_step = Some(next_step.clone());
                if instance.status == ProcessStatus::Paused {
                    // Record progress but dispatch nothing until resume
                    instance.update(&mut *conn).await?;
                    debug!(
                        process_id = %instance.process_id,
                        next_step = %next_step,
                        "Step completed while paused, holding dispatch"
                    );
                    Ok(())
                } else {
                    self.execute_step(conn, instance, definition).await
                }
            }
            None => {
                instance.status = ProcessStatus::Succeeded;
                instance.update(&mut *conn).await?;
                ProcessInstance::log(
                    &mut *conn,
                    instance.process_id,
                    &ProcessEvent::ProcessCompleted,
                )
                .await?;
                info!(process_id = %instance.process_id, "Process completed");
                Ok(())
            }
        }
    }

    /// Fan-in: record the branch, advance only when every branch is done.
    async fn handle_branch_completed(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        command_id: Uuid,
        branch: &str,
        reply: &CommandReply,
    ) -> ConductorResult<()> {
        let Some((parent_step, data_key)) = instance.find_parallel_parent(branch) else {
            debug!(
                process_id = %instance.process_id,
                branch = %branch,
                "Branch reply without matching fan-out state, dropping"
            );
            return Ok(());
        };

        instance.merge_data(&reply.data, &[headers::PARALLEL_BRANCH]);
        instance.complete_branch(&data_key, branch);

        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::StepCompleted {
                step: branch.to_string(),
                command_id: Some(command_id),
            },
        )
        .await?;

        if !instance.all_branches_completed(&data_key) {
            instance.update(&mut *conn).await?;
            debug!(
                process_id = %instance.process_id,
                parent = %parent_step,
                branch = %branch,
                "Branch completed, others still pending"
            );
            return Ok(());
        }

        instance.clear_parallel(&data_key);
        info!(
            process_id = %instance.process_id,
            parent = %parent_step,
            "All parallel branches completed, dispatching join"
        );

        if instance.status == ProcessStatus::Paused {
            instance.update(&mut *conn).await?;
            return Ok(());
        }

        // The current step was advanced to the join at fan-out time
        self.execute_step(conn, instance, definition).await
    }

    // -------------------------------------------------------------------------
    // Failure
    // -------------------------------------------------------------------------

    async fn handle_step_failed(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        command_id: Uuid,
        reply: &CommandReply,
    ) -> ConductorResult<PostCommit> {
        let error = reply
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());

        if instance.status == ProcessStatus::Compensating {
            if reply.parallel_branch().is_some() {
                debug!(
                    process_id = %instance.process_id,
                    command_id = %command_id,
                    "Late parallel branch failure during compensation, dropping"
                );
                return Ok(PostCommit::None);
            }
            self.fail_compensation(conn, instance, command_id, &error)
                .await?;
            return Ok(PostCommit::None);
        }

        // Any branch failure fails the whole process; in-flight siblings are
        // not cancelled, their late replies are dropped as terminal.
        if let Some(branch) = reply.parallel_branch().map(str::to_string) {
            ProcessInstance::log(
                &mut *conn,
                instance.process_id,
                &ProcessEvent::StepFailed {
                    step: branch.clone(),
                    command_id: Some(command_id),
                    error: error.clone(),
                    retryable: false,
                },
            )
            .await?;

            let parent_step = instance.find_parallel_parent(&branch).map(|(p, _)| p);
            let failed_step = parent_step.unwrap_or_else(|| branch.clone());
            self.handle_permanent_failure(
                conn,
                instance,
                definition,
                &failed_step,
                command_id,
                &error,
                "permanent",
            )
            .await?;
            return Ok(PostCommit::None);
        }

        let Some(step) = instance.current_step.clone() else {
            warn!(
                process_id = %instance.process_id,
                command_id = %command_id,
                "Failure reply for process without a current step, dropping"
            );
            return Ok(PostCommit::None);
        };

        let retryable = definition.is_retryable(&step, &error);
        let max_retries = definition.max_retries(&step);

        if instance.status == ProcessStatus::Paused {
            ProcessInstance::log(
                &mut *conn,
                instance.process_id,
                &ProcessEvent::StepFailed {
                    step,
                    command_id: Some(command_id),
                    error,
                    retryable,
                },
            )
            .await?;
            debug!(
                process_id = %instance.process_id,
                "Step failed while paused, holding retry until resume"
            );
            return Ok(PostCommit::None);
        }

        if retryable && (instance.retries as u32) < max_retries {
            instance.retries += 1;
            ProcessInstance::log(
                &mut *conn,
                instance.process_id,
                &ProcessEvent::StepFailed {
                    step: step.clone(),
                    command_id: Some(command_id),
                    error: error.clone(),
                    retryable: true,
                },
            )
            .await?;
            instance.update(&mut *conn).await?;

            let delay = definition.retry_delay(&step, instance.retries as u32);
            info!(
                process_id = %instance.process_id,
                step = %step,
                retries = instance.retries,
                max_retries = max_retries,
                delay_ms = delay.as_millis() as u64,
                "Step failed, retry scheduled"
            );
            return Ok(PostCommit::ScheduleRetry {
                process_id: instance.process_id,
                delay,
            });
        }

        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::StepFailed {
                step: step.clone(),
                command_id: Some(command_id),
                error: error.clone(),
                retryable: false,
            },
        )
        .await?;

        self.handle_permanent_failure(
            conn, instance, definition, &step, command_id, &error, "permanent",
        )
        .await?;
        Ok(PostCommit::None)
    }

    // -------------------------------------------------------------------------
    // Timeout
    // -------------------------------------------------------------------------

    /// Timeouts are permanent at this layer; the transport owns reply
    /// deadlines and the recovery loop owns lease expiry.
    async fn handle_step_timed_out(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        command_id: Uuid,
        reply: &CommandReply,
    ) -> ConductorResult<()> {
        let error = format!(
            "Timeout: {}",
            reply.error.as_deref().unwrap_or("no deadline detail")
        );

        if instance.status == ProcessStatus::Compensating {
            if reply.parallel_branch().is_some() {
                debug!(
                    process_id = %instance.process_id,
                    command_id = %command_id,
                    "Late parallel branch timeout during compensation, dropping"
                );
                return Ok(());
            }
            return self
                .fail_compensation(conn, instance, command_id, &error)
                .await;
        }

        let branch = reply.parallel_branch().map(str::to_string);
        let step = match &branch {
            Some(branch) => branch.clone(),
            None => match instance.current_step.clone() {
                Some(step) => step,
                None => {
                    warn!(
                        process_id = %instance.process_id,
                        command_id = %command_id,
                        "Timeout reply for process without a current step, dropping"
                    );
                    return Ok(());
                }
            },
        };

        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::StepTimedOut {
                step: step.clone(),
                command_id: Some(command_id),
                error: error.clone(),
            },
        )
        .await?;

        let failed_step = match branch {
            Some(branch) => instance
                .find_parallel_parent(&branch)
                .map(|(p, _)| p)
                .unwrap_or(branch),
            None => step,
        };

        self.handle_permanent_failure(
            conn,
            instance,
            definition,
            &failed_step,
            command_id,
            &error,
            "timeout",
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Permanent failure and compensation
    // -------------------------------------------------------------------------

    /// Route a permanent step failure: compensate when the graph declares a
    /// compensation covering the failure, fail the process otherwise.
    ///
    /// A compensation undoes the effect of its source step after a
    /// downstream failure, so the search starts at the failed step and then
    /// walks back through completed steps for the most recent one declaring
    /// a compensation.
    async fn handle_permanent_failure(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        failed_step: &str,
        command_id: Uuid,
        error: &str,
        error_class: &str,
    ) -> ConductorResult<()> {
        let compensation = self
            .find_compensation(conn, instance, definition, failed_step)
            .await?;

        match compensation {
            Some((source_step, compensation_step)) => {
                self.dispatch_compensation(
                    conn,
                    instance,
                    definition,
                    &source_step,
                    &compensation_step,
                )
                .await
            }
            None => {
                instance.status = ProcessStatus::Failed;
                instance.update(&mut *conn).await?;
                ProcessInstance::log(
                    &mut *conn,
                    instance.process_id,
                    &ProcessEvent::ProcessFailed {
                        error: error.to_string(),
                    },
                )
                .await?;
                warn!(
                    process_id = %instance.process_id,
                    step = %failed_step,
                    error = %error,
                    "Process failed permanently"
                );
                self.park_command(conn, instance, command_id, error_class, error)
                    .await
            }
        }
    }

    /// Resolve which compensation covers a failure at `failed_step`.
    ///
    /// Returns `(source_step, compensation_step)`: the failed step's own
    /// compensation when declared, otherwise the most recently completed
    /// step that declares one.
    async fn find_compensation(
        &self,
        conn: &mut PgConnection,
        instance: &ProcessInstance,
        definition: &dyn ProcessDefinition,
        failed_step: &str,
    ) -> ConductorResult<Option<(String, String)>> {
        if let Some(compensation) = definition
            .graph()
            .step(failed_step)
            .and_then(|s| s.compensation_step.clone())
        {
            return Ok(Some((failed_step.to_string(), compensation)));
        }

        let entries = ProcessInstance::log_entries(&mut *conn, instance.process_id).await?;
        for entry in entries.iter().rev() {
            if let ProcessEvent::StepCompleted { step, .. } = &entry.event.0 {
                if let Some(compensation) = definition
                    .graph()
                    .step(step)
                    .and_then(|s| s.compensation_step.clone())
                {
                    return Ok(Some((step.clone(), compensation)));
                }
            }
        }
        Ok(None)
    }

    /// A failed compensation fails the process and parks the command.
    async fn fail_compensation(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        command_id: Uuid,
        error: &str,
    ) -> ConductorResult<()> {
        let step = instance.current_step.clone().unwrap_or_default();
        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::CompensationFailed {
                step,
                error: error.to_string(),
            },
        )
        .await?;
        instance.status = ProcessStatus::Failed;
        instance.update(&mut *conn).await?;
        warn!(
            process_id = %instance.process_id,
            error = %error,
            "Compensation failed, process failed"
        );
        self.park_command(conn, instance, command_id, "compensation_failed", error)
            .await
    }

    /// Park the command behind a permanent failure for operator review.
    async fn park_command(
        &self,
        conn: &mut PgConnection,
        instance: &ProcessInstance,
        command_id: Uuid,
        error_class: &str,
        error_message: &str,
    ) -> ConductorResult<()> {
        let Some(command) = CommandRow::find_by_id(&mut *conn, command_id).await? else {
            warn!(
                process_id = %instance.process_id,
                command_id = %command_id,
                "No command row to park for permanent failure"
            );
            return Ok(());
        };

        let dlq_id = DlqEntry::park(
            &mut *conn,
            &command,
            error_class,
            error_message,
            instance.retries,
            self.node_id(),
        )
        .await?;

        info!(
            process_id = %instance.process_id,
            command_id = %command_id,
            dlq_id = dlq_id,
            error_class = %error_class,
            "Command parked to DLQ"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn reply_envelope(message_type: &str, payload: Value) -> Envelope {
        Envelope::reply(
            message_type,
            Uuid::now_v7(),
            Uuid::now_v7(),
            "BK-1",
            payload.to_string(),
        )
    }

    #[test]
    fn test_from_envelope_completed() {
        let envelope = reply_envelope(
            REPLY_COMPLETED,
            json!({"status": "SUCCEEDED", "data": {"x": 1}, "error": null}),
        );
        let reply = CommandReply::from_envelope(&envelope).unwrap();
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.data.get("x"), Some(&json!(1)));
        assert!(reply.error.is_none());
    }

    #[test]
    fn test_from_envelope_failed_with_error() {
        let envelope = reply_envelope(
            REPLY_FAILED,
            json!({"status": "FAILED", "data": {}, "error": "card declined"}),
        );
        let reply = CommandReply::from_envelope(&envelope).unwrap();
        assert_eq!(reply.status, ReplyStatus::Failed);
        assert_eq!(reply.error.as_deref(), Some("card declined"));
    }

    #[test]
    fn test_from_envelope_status_fallback() {
        let envelope = reply_envelope("SomethingElse", json!({"status": "TIMED_OUT"}));
        let reply = CommandReply::from_envelope(&envelope).unwrap();
        assert_eq!(reply.status, ReplyStatus::TimedOut);
    }

    #[test]
    fn test_from_envelope_unrecognized_errors() {
        let envelope = reply_envelope("SomethingElse", json!({"status": "MAYBE"}));
        assert!(CommandReply::from_envelope(&envelope).is_err());
    }

    #[test]
    fn test_parallel_branch_accessor() {
        let mut data = Map::new();
        data.insert("parallelBranch".to_string(), json!("FetchA"));
        let reply = CommandReply::completed(data);
        assert_eq!(reply.parallel_branch(), Some("FetchA"));

        let no_branch = CommandReply::completed(Map::new());
        assert!(no_branch.parallel_branch().is_none());
    }

    #[test]
    fn test_reply_constructors() {
        let mut data = Map::new();
        data.insert("y".to_string(), json!(2));
        let completed = CommandReply::completed(data.clone());
        assert_eq!(completed.status, ReplyStatus::Completed);

        let failed = CommandReply::failed("boom").with_data(data);
        assert_eq!(failed.status, ReplyStatus::Failed);
        assert_eq!(failed.data.get("y"), Some(&json!(2)));

        let timed_out = CommandReply::timed_out("slow");
        assert_eq!(timed_out.status, ReplyStatus::TimedOut);
        assert_eq!(timed_out.error.as_deref(), Some("slow"));
    }

    #[test]
    fn test_envelope_headers_unused_in_decode() {
        // Decoding relies on type + payload, not on ad-hoc headers
        let mut envelope = reply_envelope(REPLY_COMPLETED, json!({"data": {"ok": true}}));
        envelope.headers = HashMap::new();
        let reply = CommandReply::from_envelope(&envelope).unwrap();
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.data.get("ok"), Some(&json!(true)));
    }
}
