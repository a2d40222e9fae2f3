//! # Recovery Loop
//!
//! Periodic background scan that (1) resets outbox rows stuck in CLAIMED by
//! a dead dispatcher and (2) expires command processing leases, feeding the
//! expirations through the normal reply pipeline as timeouts.

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_shared::config::RecoverySettings;
use conductor_shared::database::UnitOfWork;
use conductor_shared::errors::ConductorResult;
use conductor_shared::models::{CommandRow, OutboxRow};

use crate::manager::{CommandReply, ProcessManager};

/// Background recovery task
pub struct RecoveryLoop {
    pool: PgPool,
    manager: Arc<ProcessManager>,
    settings: RecoverySettings,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RecoveryLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryLoop")
            .field("interval_seconds", &self.settings.interval_seconds)
            .finish_non_exhaustive()
    }
}

impl RecoveryLoop {
    pub fn new(
        pool: PgPool,
        manager: Arc<ProcessManager>,
        settings: RecoverySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            manager,
            settings,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!(
            interval_seconds = self.settings.interval_seconds,
            stuck_claim_seconds = self.settings.stuck_claim_seconds,
            "Recovery loop started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Recovery loop stopping");
                    break;
                }
                _ = tokio::time::sleep(self.settings.interval()) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Recovery scan failed");
                    }
                }
            }
        }
    }

    /// One recovery scan: stuck outbox claims, then expired command leases.
    pub async fn run_once(&self) -> ConductorResult<()> {
        let reset = OutboxRow::recover_stuck(&self.pool, self.settings.stuck_claim_age()).await?;
        if reset > 0 {
            info!(reset = reset, "Reset stuck outbox claims");
        }

        self.expire_command_leases().await
    }

    /// Expire RUNNING commands whose lease has passed and feed each through
    /// the Process Manager as a timeout reply.
    async fn expire_command_leases(&self) -> ConductorResult<()> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let expired = CommandRow::expire_leases(uow.conn(), Utc::now()).await?;
        if expired.is_empty() {
            uow.commit().await?;
            return Ok(());
        }

        info!(expired = expired.len(), "Expired command leases");

        let mut actions = Vec::new();
        for command in &expired {
            let Some(routing) = command.reply.as_ref() else {
                warn!(
                    command_id = %command.id,
                    "Expired command has no reply routing, cannot notify process"
                );
                continue;
            };

            debug!(
                command_id = %command.id,
                correlation_id = %routing.0.correlation_id,
                name = %command.name,
                "Feeding lease expiry through the reply pipeline"
            );

            let action = self
                .manager
                .handle_reply_on(
                    uow.conn(),
                    routing.0.correlation_id,
                    command.id,
                    CommandReply::timed_out("Lease expired"),
                )
                .await?;
            actions.push(action);
        }

        uow.commit().await?;
        for action in actions {
            self.manager.run_post_commit(action);
        }
        Ok(())
    }
}
