//! # Command Bus
//!
//! Submitting a command is an atomic pair on the caller's transaction:
//! insert into `command` (PENDING, idempotency-key-unique) and insert the
//! envelope into `outbox` (NEW). Both become visible together at commit, so
//! the sweeper can never publish a command that was rolled back.

use std::collections::HashMap;

use serde_json::Value;
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use conductor_shared::errors::ConductorResult;
use conductor_shared::messaging::{headers, Envelope, QueueNaming};
use conductor_shared::models::{CommandRow, OutboxRow, ReplyRouting};

/// A command submission
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub idempotency_key: String,
    pub business_key: String,
    /// Process id the reply correlates back to
    pub correlation_id: Uuid,
    pub payload: Value,
    /// Extra envelope headers (parallel branch routing, compensation marker)
    pub extra_headers: HashMap<String, String>,
    /// Override for the reply queue; the configured default applies otherwise
    pub reply_to: Option<String>,
}

/// Transactional command submission facade
#[derive(Debug, Clone)]
pub struct CommandBus {
    naming: QueueNaming,
}

impl CommandBus {
    pub fn new(naming: QueueNaming) -> Self {
        Self { naming }
    }

    pub fn naming(&self) -> &QueueNaming {
        &self.naming
    }

    /// Accept a command inside the caller's unit of work.
    ///
    /// Returns the new command id. An idempotency-key collision with a
    /// PENDING command surfaces as a permanent
    /// [`conductor_shared::errors::ConductorError::IdempotencyConflict`].
    pub async fn accept(
        &self,
        conn: &mut PgConnection,
        request: CommandRequest,
    ) -> ConductorResult<Uuid> {
        let reply_to = request
            .reply_to
            .unwrap_or_else(|| self.naming.reply_queue().to_string());

        let command = CommandRow::new(
            request.name.clone(),
            request.business_key.clone(),
            request.payload.clone(),
            request.idempotency_key.clone(),
            ReplyRouting {
                reply_to: reply_to.clone(),
                correlation_id: request.correlation_id,
            },
        );
        command.insert(&mut *conn).await?;

        let mut envelope_headers = request.extra_headers;
        envelope_headers.insert(headers::COMMAND_NAME.to_string(), request.name.clone());
        envelope_headers.insert(
            headers::IDEMPOTENCY_KEY.to_string(),
            request.idempotency_key,
        );
        envelope_headers.insert(headers::REPLY_TO.to_string(), reply_to);

        let envelope = Envelope::command(
            request.name.clone(),
            command.id,
            request.correlation_id,
            request.business_key.clone(),
            envelope_headers,
            request.payload.to_string(),
        );

        let topic = self.naming.command_topic(&request.name);
        OutboxRow::enqueue(&mut *conn, &topic, Some(&request.business_key), &envelope).await?;

        Ok(command.id)
    }
}
