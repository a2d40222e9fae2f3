//! # Process Manager
//!
//! Drives process instances through their graphs: step dispatch over the
//! command bus, reply handling, parallel fan-out/fan-in, retry policy, and
//! compensation. Every public mutation runs inside one unit of work; the
//! single invariant is that business state and outbound envelopes commit
//! together.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use sqlx::postgres::PgConnection;
use sqlx::{Acquire, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conductor_shared::database::UnitOfWork;
use conductor_shared::errors::{ConductorError, ConductorResult};
use conductor_shared::messaging::{headers, QueueNaming};
use conductor_shared::models::{ProcessEvent, ProcessInstance, ProcessStatus};

use crate::command_bus::{CommandBus, CommandRequest};
use crate::definition::ProcessDefinition;
use crate::graph::NextStep;
use crate::registry::ProcessRegistry;

mod replies;

pub use replies::{
    CommandReply, ReplyStatus, REPLY_COMPLETED, REPLY_FAILED, REPLY_TIMED_OUT,
};

/// Work to perform after the surrounding transaction commits.
///
/// Retry backoff must not hold a transaction open, so the reply handler
/// returns the scheduling decision instead of sleeping in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostCommit {
    None,
    ScheduleRetry { process_id: Uuid, delay: Duration },
}

/// The orchestration core
pub struct ProcessManager {
    pool: PgPool,
    registry: Arc<ProcessRegistry>,
    bus: CommandBus,
    node_id: String,
    shutdown: CancellationToken,
    /// Handle to ourselves for scheduling delayed re-dispatch tasks
    self_ref: Weak<ProcessManager>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("node_id", &self.node_id)
            .field("registered", &self.registry.len())
            .finish()
    }
}

impl ProcessManager {
    pub fn new(
        pool: PgPool,
        registry: Arc<ProcessRegistry>,
        naming: QueueNaming,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let node_id = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("conductor-{}", Uuid::now_v7()));
        Arc::new_cyclic(|self_ref| Self {
            pool,
            registry,
            bus: CommandBus::new(naming),
            node_id,
            shutdown,
            self_ref: self_ref.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register a process definition. Exactly once per process type.
    pub fn register(&self, definition: Arc<dyn ProcessDefinition>) -> ConductorResult<()> {
        self.registry.register(definition)
    }

    /// Start a new process instance and drive its initial step.
    ///
    /// The creation, the `ProcessStarted` event, and the initial dispatch are
    /// one unit of work. A failing initial dispatch commits the instance as
    /// FAILED and surfaces the error to the caller.
    pub async fn start(
        &self,
        process_type: &str,
        business_key: &str,
        initial_data: Map<String, Value>,
    ) -> ConductorResult<Uuid> {
        let definition = self.registry.require(process_type)?;

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let mut instance = ProcessInstance::new(process_type, business_key, initial_data);
        let process_id = instance.process_id;

        instance.insert(uow.conn()).await?;
        ProcessInstance::log(
            uow.conn(),
            process_id,
            &ProcessEvent::ProcessStarted {
                process_type: process_type.to_string(),
            },
        )
        .await?;

        instance.current_step = Some(definition.graph().initial_step().to_string());

        // Savepoint around the dispatch: a failed insert must not poison the
        // enclosing transaction that records the FAILED outcome.
        let dispatch = {
            let mut savepoint = uow.conn().begin().await?;
            match self
                .execute_step(&mut savepoint, &mut instance, definition.as_ref())
                .await
            {
                Ok(()) => {
                    savepoint.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    Err(e)
                }
            }
        };

        match dispatch {
            Ok(()) => {
                uow.commit().await?;
                info!(
                    process_id = %process_id,
                    process_type = %process_type,
                    business_key = %business_key,
                    "Process started"
                );
                Ok(process_id)
            }
            Err(e) => {
                instance.status = ProcessStatus::Failed;
                instance.update(uow.conn()).await?;
                ProcessInstance::log(
                    uow.conn(),
                    process_id,
                    &ProcessEvent::ProcessFailed {
                        error: e.to_string(),
                    },
                )
                .await?;
                uow.commit().await?;
                error!(
                    process_id = %process_id,
                    process_type = %process_type,
                    error = %e,
                    "Initial dispatch failed, process committed as FAILED"
                );
                Err(e)
            }
        }
    }

    /// Handle a correlated reply in its own unit of work.
    ///
    /// Unknown correlations are tolerated: a warning is logged and the reply
    /// is dropped. Errors re-raise so the reply transport redelivers.
    pub async fn handle_reply(
        &self,
        correlation_id: Uuid,
        command_id: Uuid,
        reply: CommandReply,
    ) -> ConductorResult<()> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let action = self
            .handle_reply_on(uow.conn(), correlation_id, command_id, reply)
            .await?;
        uow.commit().await?;
        self.run_post_commit(action);
        Ok(())
    }

    /// Pause a RUNNING instance. New dispatches stop until `resume`.
    pub async fn pause(&self, process_id: Uuid) -> ConductorResult<()> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let mut instance = ProcessInstance::find_by_id(uow.conn(), process_id)
            .await?
            .ok_or(ConductorError::ProcessNotFound { process_id })?;

        if instance.status != ProcessStatus::Running {
            return Err(ConductorError::validation(format!(
                "cannot pause process in status {}",
                instance.status
            )));
        }

        instance.status = ProcessStatus::Paused;
        instance.update(uow.conn()).await?;
        ProcessInstance::log(uow.conn(), process_id, &ProcessEvent::ProcessPaused).await?;
        uow.commit().await?;
        info!(process_id = %process_id, "Process paused");
        Ok(())
    }

    /// Resume a PAUSED instance and re-dispatch its current step.
    ///
    /// If the step's previous command is still PENDING, the idempotency key
    /// rejects the duplicate and the error surfaces to the caller.
    pub async fn resume(&self, process_id: Uuid) -> ConductorResult<()> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let mut instance = ProcessInstance::find_by_id(uow.conn(), process_id)
            .await?
            .ok_or(ConductorError::ProcessNotFound { process_id })?;

        if instance.status != ProcessStatus::Paused {
            return Err(ConductorError::validation(format!(
                "cannot resume process in status {}",
                instance.status
            )));
        }

        let definition = self.registry.require(&instance.process_type)?;
        instance.status = ProcessStatus::Running;
        ProcessInstance::log(uow.conn(), process_id, &ProcessEvent::ProcessResumed).await?;
        self.execute_step(uow.conn(), &mut instance, definition.as_ref())
            .await?;
        uow.commit().await?;
        info!(process_id = %process_id, "Process resumed");
        Ok(())
    }

    /// Re-dispatch the current step after a retry backoff has elapsed.
    pub(crate) async fn redispatch(&self, process_id: Uuid) -> ConductorResult<()> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let Some(mut instance) = ProcessInstance::find_by_id(uow.conn(), process_id).await? else {
            warn!(process_id = %process_id, "Retry re-dispatch for unknown process");
            return Ok(());
        };

        if instance.status != ProcessStatus::Running {
            debug!(
                process_id = %process_id,
                status = %instance.status,
                "Skipping retry re-dispatch, process no longer running"
            );
            return Ok(());
        }

        let definition = self.registry.require(&instance.process_type)?;
        self.execute_step(uow.conn(), &mut instance, definition.as_ref())
            .await?;
        uow.commit().await?;
        Ok(())
    }

    /// Apply a post-commit action from reply handling.
    pub(crate) fn run_post_commit(&self, action: PostCommit) {
        match action {
            PostCommit::None => {}
            PostCommit::ScheduleRetry { process_id, delay } => {
                self.schedule_redispatch(process_id, delay);
            }
        }
    }

    /// Schedule a cancellable delayed re-dispatch.
    ///
    /// The delay runs outside any transaction; shutdown cancels it.
    fn schedule_redispatch(&self, process_id: Uuid, delay: Duration) {
        let Some(manager) = self.self_ref.upgrade() else {
            debug!(process_id = %process_id, "Manager dropped, retry not scheduled");
            return;
        };
        let shutdown = self.shutdown.clone();
        debug!(
            process_id = %process_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry re-dispatch"
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(process_id = %process_id, "Retry re-dispatch cancelled by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = manager.redispatch(process_id).await {
                        error!(
                            process_id = %process_id,
                            error = %e,
                            "Retry re-dispatch failed"
                        );
                    }
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Step dispatch
    // -------------------------------------------------------------------------

    /// Execute the instance's current step: parallel fan-out when the graph
    /// marks it parallel, a single command submission otherwise.
    pub(crate) async fn execute_step(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
    ) -> ConductorResult<()> {
        let step_name = instance.current_step.clone().ok_or_else(|| {
            ConductorError::validation(format!(
                "process {} has no current step to execute",
                instance.process_id
            ))
        })?;
        let step = definition.graph().step(&step_name).ok_or_else(|| {
            ConductorError::validation(format!(
                "step '{step_name}' not present in graph '{}'",
                definition.process_type()
            ))
        })?;

        match step.next.clone() {
            NextStep::Parallel {
                branches,
                join_step,
            } => {
                self.dispatch_parallel(conn, instance, definition, &step_name, &branches, &join_step)
                    .await
            }
            _ => self.dispatch_sequential(conn, instance, definition, &step_name).await,
        }
    }

    async fn dispatch_sequential(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        step_name: &str,
    ) -> ConductorResult<()> {
        let idempotency_key = format!("{}:{}", instance.process_id, step_name);
        let command_id = self
            .submit_command(
                conn,
                instance,
                definition,
                step_name,
                idempotency_key,
                HashMap::new(),
                None,
            )
            .await?;

        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::StepStarted {
                step: step_name.to_string(),
                command: command_id.to_string(),
            },
        )
        .await?;

        instance.status = ProcessStatus::Running;
        instance.update(&mut *conn).await?;

        debug!(
            process_id = %instance.process_id,
            step = %step_name,
            command_id = %command_id,
            "Dispatched step command"
        );
        Ok(())
    }

    async fn dispatch_parallel(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        step_name: &str,
        branches: &[String],
        join_step: &str,
    ) -> ConductorResult<()> {
        instance.init_parallel(step_name, branches);
        instance.current_step = Some(join_step.to_string());

        for branch in branches {
            let idempotency_key = format!("{}:{}", instance.process_id, branch);
            let mut extra = HashMap::new();
            extra.insert(headers::PARALLEL_BRANCH.to_string(), branch.clone());
            extra.insert(headers::PARENT_STEP.to_string(), step_name.to_string());
            self.submit_command(
                conn,
                instance,
                definition,
                branch,
                idempotency_key,
                extra,
                Some(branch),
            )
            .await?;
        }

        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::StepStarted {
                step: step_name.to_string(),
                command: format!("PARALLEL:{}", branches.len()),
            },
        )
        .await?;

        instance.status = ProcessStatus::Running;
        instance.update(&mut *conn).await?;

        info!(
            process_id = %instance.process_id,
            step = %step_name,
            branches = branches.len(),
            join = %join_step,
            "Dispatched parallel fan-out"
        );
        Ok(())
    }

    /// Dispatch the compensation declared for `failed_step`.
    pub(crate) async fn dispatch_compensation(
        &self,
        conn: &mut PgConnection,
        instance: &mut ProcessInstance,
        definition: &dyn ProcessDefinition,
        failed_step: &str,
        compensation_step: &str,
    ) -> ConductorResult<()> {
        let idempotency_key = format!("{}:COMPENSATE:{}", instance.process_id, failed_step);
        let mut extra = HashMap::new();
        extra.insert(headers::COMPENSATING.to_string(), "true".to_string());

        instance.status = ProcessStatus::Compensating;
        instance.current_step = Some(compensation_step.to_string());

        let command_id = self
            .submit_command(
                conn,
                instance,
                definition,
                compensation_step,
                idempotency_key,
                extra,
                None,
            )
            .await?;

        ProcessInstance::log(
            &mut *conn,
            instance.process_id,
            &ProcessEvent::CompensationStarted {
                step: compensation_step.to_string(),
                command_id,
            },
        )
        .await?;

        instance.update(&mut *conn).await?;

        info!(
            process_id = %instance.process_id,
            failed_step = %failed_step,
            compensation = %compensation_step,
            "Dispatched compensation"
        );
        Ok(())
    }

    async fn submit_command(
        &self,
        conn: &mut PgConnection,
        instance: &ProcessInstance,
        definition: &dyn ProcessDefinition,
        step_name: &str,
        idempotency_key: String,
        extra_headers: HashMap<String, String>,
        parallel_branch: Option<&str>,
    ) -> ConductorResult<Uuid> {
        let payload = command_payload(instance, step_name, parallel_branch);
        self.bus
            .accept(
                conn,
                CommandRequest {
                    name: definition.command_name(step_name),
                    idempotency_key,
                    business_key: instance.business_key.clone(),
                    correlation_id: instance.process_id,
                    payload,
                    extra_headers,
                    reply_to: None,
                },
            )
            .await
    }
}

/// Command payload: the process data (minus internal fan-out state) merged
/// with `{businessKey, step, [parallelBranch]}`.
fn command_payload(
    instance: &ProcessInstance,
    step_name: &str,
    parallel_branch: Option<&str>,
) -> Value {
    let mut payload = Map::new();
    for (key, value) in &instance.data.0 {
        if key.starts_with(conductor_shared::models::PARALLEL_KEY_PREFIX) {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }
    payload.insert(
        "businessKey".to_string(),
        Value::String(instance.business_key.clone()),
    );
    payload.insert("step".to_string(), Value::String(step_name.to_string()));
    if let Some(branch) = parallel_branch {
        payload.insert(
            "parallelBranch".to_string(),
            Value::String(branch.to_string()),
        );
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_payload_strips_internal_keys() {
        let mut instance = ProcessInstance::new("payment", "BK-1", Map::new());
        instance
            .data
            .0
            .insert("amount".to_string(), json!(100));
        instance.init_parallel("Fan", &["B1".to_string()]);

        let payload = command_payload(&instance, "Charge", None);
        let object = payload.as_object().unwrap();
        assert_eq!(object.get("amount"), Some(&json!(100)));
        assert_eq!(object.get("businessKey"), Some(&json!("BK-1")));
        assert_eq!(object.get("step"), Some(&json!("Charge")));
        assert!(!object.keys().any(|k| k.starts_with("_parallel_")));
    }

    #[test]
    fn test_command_payload_includes_branch() {
        let instance = ProcessInstance::new("payment", "BK-1", Map::new());
        let payload = command_payload(&instance, "FetchA", Some("FetchA"));
        assert_eq!(payload["parallelBranch"], json!("FetchA"));
        assert_eq!(payload["step"], json!("FetchA"));
    }
}
