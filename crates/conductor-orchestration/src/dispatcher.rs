//! # Outbox Dispatcher
//!
//! Background sweeper workers that drain committed outbox rows onto the
//! transport. Delivery is at-least-once: a row is only PUBLISHED after the
//! transport accepted it, and consumers dedup via inbox + idempotency key.
//!
//! Failure policy: a transient publish error leaves the row CLAIMED for the
//! recovery loop to reset; a permanent one parks the row FAILED with an
//! exponential next-attempt backoff so the sweeper retries it later.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use conductor_shared::config::{ConductorConfig, DispatcherSettings};
use conductor_shared::errors::ConductorResult;
use conductor_shared::messaging::MessageTransport;
use conductor_shared::models::{default_publish_backoff, OutboxRow};

/// Configuration for dispatcher workers
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent sweeper workers
    pub workers: usize,
    /// Rows claimed per sweep
    pub batch_size: i64,
    /// Idle delay between sweeps
    pub poll_interval: Duration,
    /// Age after which a CLAIMED row becomes re-claimable
    pub claim_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 25,
            poll_interval: Duration::from_millis(500),
            claim_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&ConductorConfig> for DispatcherConfig {
    fn from(config: &ConductorConfig) -> Self {
        Self::from(&config.dispatcher)
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            workers: settings.workers,
            batch_size: settings.batch_size,
            poll_interval: settings.poll_interval(),
            claim_timeout: settings.claim_timeout(),
        }
    }
}

/// Outbox sweeper worker pool
#[derive(Debug, Clone)]
pub struct OutboxDispatcher {
    pool: PgPool,
    transport: MessageTransport,
    config: DispatcherConfig,
    node_id: Arc<String>,
    shutdown: CancellationToken,
}

impl OutboxDispatcher {
    pub fn new(
        pool: PgPool,
        transport: MessageTransport,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let node_id = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("dispatcher-{}", Uuid::now_v7()));
        Self {
            pool,
            transport,
            config,
            node_id: Arc::new(node_id),
            shutdown,
        }
    }

    /// Spawn the configured number of sweeper workers
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|index| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.run_worker(index).await })
            })
            .collect()
    }

    async fn run_worker(&self, index: usize) {
        let claimer = format!("{}-w{}", self.node_id, index);
        info!(
            claimer = %claimer,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Outbox dispatcher worker started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(claimer = %claimer, "Outbox dispatcher worker stopping");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    loop {
                        match self.process_batch(&claimer).await {
                            Ok(published) => {
                                // A full batch means there is likely more work waiting
                                if (published as i64) < self.config.batch_size {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(claimer = %claimer, error = %e, "Outbox sweep failed");
                                break;
                            }
                        }
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Claim one batch and publish it. Returns the number of rows published.
    #[instrument(skip(self))]
    pub async fn process_batch(&self, claimer: &str) -> ConductorResult<usize> {
        let rows = OutboxRow::sweep(
            &self.pool,
            self.config.batch_size,
            claimer,
            self.config.claim_timeout,
        )
        .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        debug!(claimed = rows.len(), "Claimed outbox batch");

        let mut published = 0;
        for row in rows {
            if self.publish_row(&row).await? {
                published += 1;
            }
        }

        if published > 0 {
            debug!(published = published, "Outbox batch published");
        }
        Ok(published)
    }

    /// Publish a single claimed row. Returns true when it reached the
    /// transport.
    async fn publish_row(&self, row: &OutboxRow) -> ConductorResult<bool> {
        let envelope = match row.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                // A row that cannot be rebuilt will never publish; park it
                // far out so operators can intervene.
                warn!(
                    outbox_id = row.id,
                    error = %e,
                    "Outbox row is malformed, marking FAILED"
                );
                let next_attempt = Utc::now() + chrono::Duration::hours(1);
                OutboxRow::mark_failed(&self.pool, row.id, &e.to_string(), next_attempt).await?;
                return Ok(false);
            }
        };

        match self.transport.publish(&row.topic, &envelope).await {
            Ok(()) => {
                OutboxRow::mark_published(&self.pool, row.id).await?;
                debug!(
                    outbox_id = row.id,
                    topic = %row.topic,
                    message_type = %row.message_type,
                    "Envelope published"
                );
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                // Leave the row CLAIMED; the recovery loop resets it after
                // the claim timeout.
                warn!(
                    outbox_id = row.id,
                    topic = %row.topic,
                    error = %e,
                    "Transient publish failure, leaving row claimed for recovery"
                );
                Ok(false)
            }
            Err(e) => {
                let backoff = backoff_with_jitter(row.attempts.max(1) as u32 - 1);
                let next_attempt = Utc::now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                warn!(
                    outbox_id = row.id,
                    topic = %row.topic,
                    attempts = row.attempts,
                    error = %e,
                    next_attempt = %next_attempt,
                    "Permanent publish failure, marking FAILED with backoff"
                );
                OutboxRow::mark_failed(&self.pool, row.id, &e.to_string(), next_attempt).await?;
                Ok(false)
            }
        }
    }
}

/// Exponential backoff with up to 10% jitter so parked rows do not thunder
/// back in lockstep.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = default_publish_backoff(attempt);
    let jitter_ceiling = (base.as_millis() as u64 / 10).max(1);
    base + Duration::from_millis(fastrand::u64(0..jitter_ceiling))
}
