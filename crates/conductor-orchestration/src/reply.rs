//! # Reply Consumer
//!
//! Consumes decoded reply envelopes from the reply queue, dedups via the
//! inbox, records the command outcome, and feeds the Process Manager. The
//! inbox mark, the command transition, and the manager's state changes share
//! one unit of work, so a failed handler rolls everything back and the
//! transport redelivery gets a clean retry.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_shared::database::UnitOfWork;
use conductor_shared::errors::{ConductorError, ConductorResult};
use conductor_shared::messaging::{Envelope, MessageTransport};
use conductor_shared::models::InboxKey;

use crate::manager::{CommandReply, ProcessManager};

/// Inbox handler name for the process-manager reply pipeline
pub const REPLY_HANDLER: &str = "process-manager";

/// Background consumer of the reply queue
pub struct ReplyConsumer {
    pool: PgPool,
    manager: Arc<ProcessManager>,
    transport: MessageTransport,
    reply_queue: String,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ReplyConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyConsumer")
            .field("reply_queue", &self.reply_queue)
            .finish_non_exhaustive()
    }
}

impl ReplyConsumer {
    pub fn new(
        pool: PgPool,
        manager: Arc<ProcessManager>,
        transport: MessageTransport,
        reply_queue: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            manager,
            transport,
            reply_queue: reply_queue.into(),
            shutdown,
        }
    }

    /// Subscribe and spawn the consume loop.
    ///
    /// The subscription attaches before the task is spawned, so replies
    /// published immediately after bootstrap are never lost.
    pub fn spawn(self) -> JoinHandle<()> {
        let subscription = self.transport.subscribe(&self.reply_queue);
        tokio::spawn(async move { self.run(subscription).await })
    }

    async fn run(self, mut subscription: conductor_shared::messaging::TransportSubscription) {
        info!(queue = %self.reply_queue, "Reply consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(queue = %self.reply_queue, "Reply consumer stopping");
                    break;
                }
                received = subscription.receiver.recv() => {
                    match received {
                        Some(envelope) => {
                            if let Err(e) = self.process_reply(envelope).await {
                                // Re-raised so a broker-backed transport
                                // redelivers; the inbox mark was rolled back
                                // with the failed unit of work.
                                error!(
                                    queue = %self.reply_queue,
                                    error = %e,
                                    "Reply processing failed"
                                );
                            }
                        }
                        None => {
                            warn!(queue = %self.reply_queue, "Reply subscription closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Process one reply envelope inside a single unit of work.
    pub async fn process_reply(&self, envelope: Envelope) -> ConductorResult<()> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let first_delivery =
            InboxKey::mark_if_absent(uow.conn(), envelope.message_id, REPLY_HANDLER).await?;
        if !first_delivery {
            uow.commit().await?;
            debug!(
                message_id = %envelope.message_id,
                "Duplicate reply dropped by inbox"
            );
            return Ok(());
        }

        let reply = CommandReply::from_envelope(&envelope)?;
        let command_id = envelope.command_id.ok_or_else(|| {
            ConductorError::validation(format!(
                "reply envelope {} has no command id",
                envelope.message_id
            ))
        })?;

        let action = self
            .manager
            .handle_reply_on(uow.conn(), envelope.correlation_id, command_id, reply)
            .await?;

        uow.commit().await?;
        self.manager.run_post_commit(action);

        debug!(
            message_id = %envelope.message_id,
            command_id = %command_id,
            correlation_id = %envelope.correlation_id,
            reply_type = %envelope.message_type,
            "Reply processed"
        );
        Ok(())
    }
}
