//! # Runtime Bootstrap
//!
//! Wires the orchestration system: pool + migrations, the process manager,
//! dispatcher workers, the reply consumer, and the recovery loop, all under
//! one cancellation token for drain-then-stop shutdown.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use conductor_shared::config::ConductorConfig;
use conductor_shared::database;
use conductor_shared::errors::ConductorResult;
use conductor_shared::messaging::MessageTransport;

use crate::dispatcher::{DispatcherConfig, OutboxDispatcher};
use crate::manager::ProcessManager;
use crate::recovery::RecoveryLoop;
use crate::registry::ProcessRegistry;
use crate::reply::ReplyConsumer;

/// A running orchestration system
pub struct ConductorRuntime {
    config: ConductorConfig,
    pool: PgPool,
    transport: MessageTransport,
    manager: Arc<ProcessManager>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ConductorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConductorRuntime")
            .field("workers", &self.handles.len())
            .field("transport", &self.transport.provider_name())
            .finish_non_exhaustive()
    }
}

impl ConductorRuntime {
    /// Connect, migrate, and start all background workers.
    pub async fn bootstrap(
        config: ConductorConfig,
        transport: MessageTransport,
    ) -> ConductorResult<Self> {
        let pool = database::connect(&config.database).await?;
        database::migrate(&pool).await?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ProcessRegistry::new());
        let manager = ProcessManager::new(
            pool.clone(),
            registry,
            config.queues.clone(),
            shutdown.clone(),
        );

        let mut handles = Vec::new();

        let dispatcher = OutboxDispatcher::new(
            pool.clone(),
            transport.clone(),
            DispatcherConfig::from(&config),
            shutdown.clone(),
        );
        handles.extend(dispatcher.spawn());

        let consumer = ReplyConsumer::new(
            pool.clone(),
            Arc::clone(&manager),
            transport.clone(),
            config.queues.reply_queue().to_string(),
            shutdown.clone(),
        );
        handles.push(consumer.spawn());

        let recovery = RecoveryLoop::new(
            pool.clone(),
            Arc::clone(&manager),
            config.recovery.clone(),
            shutdown.clone(),
        );
        handles.push(recovery.spawn());

        info!(
            transport = transport.provider_name(),
            dispatcher_workers = config.dispatcher.workers,
            reply_queue = %config.queues.reply_queue(),
            "Conductor runtime started"
        );

        Ok(Self {
            config,
            pool,
            transport,
            manager,
            shutdown,
            handles,
        })
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn transport(&self) -> &MessageTransport {
        &self.transport
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    /// Stop claiming new work, drain in-flight tasks, and shut down.
    pub async fn stop(self) -> ConductorResult<()> {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        self.pool.close().await;
        info!("Conductor runtime stopped");
        Ok(())
    }
}
