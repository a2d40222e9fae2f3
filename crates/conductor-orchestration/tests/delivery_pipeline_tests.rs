//! Reliable-delivery pipeline tests: transactional enqueue atomicity, the
//! outbox dispatcher against the transport, inbox-deduped reply intake, and
//! lease-expiry recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_orchestration::command_bus::{CommandBus, CommandRequest};
use conductor_orchestration::definition::ProcessDefinition;
use conductor_orchestration::dispatcher::{DispatcherConfig, OutboxDispatcher};
use conductor_orchestration::graph::{ProcessGraph, ProcessGraphBuilder};
use conductor_orchestration::manager::{ProcessManager, REPLY_COMPLETED};
use conductor_orchestration::recovery::RecoveryLoop;
use conductor_orchestration::registry::ProcessRegistry;
use conductor_orchestration::reply::{ReplyConsumer, REPLY_HANDLER};
use conductor_shared::config::RecoverySettings;
use conductor_shared::database::UnitOfWork;
use conductor_shared::errors::ConductorError;
use conductor_shared::messaging::{Envelope, MessageTransport, QueueNaming};
use conductor_shared::models::{
    CommandRow, CommandStatus, DlqEntry, InboxKey, OutboxRow, OutboxStatus, ProcessInstance,
    ProcessStatus,
};

struct LinearDefinition {
    graph: ProcessGraph,
}

impl LinearDefinition {
    fn new(process_type: &str, steps: &[&str]) -> Arc<dyn ProcessDefinition> {
        let mut builder = ProcessGraphBuilder::new(process_type).start_with(steps[0]);
        for step in &steps[1..] {
            builder = builder.then(*step);
        }
        Arc::new(Self {
            graph: builder.end().expect("valid linear graph"),
        })
    }
}

impl ProcessDefinition for LinearDefinition {
    fn process_type(&self) -> &str {
        self.graph.process_type()
    }

    fn graph(&self) -> &ProcessGraph {
        &self.graph
    }
}

fn test_manager(pool: &PgPool) -> Arc<ProcessManager> {
    ProcessManager::new(
        pool.clone(),
        Arc::new(ProcessRegistry::new()),
        QueueNaming::default(),
        CancellationToken::new(),
    )
}

fn request(name: &str, idempotency_key: &str) -> CommandRequest {
    CommandRequest {
        name: name.to_string(),
        idempotency_key: idempotency_key.to_string(),
        business_key: "BK-PIPE".to_string(),
        correlation_id: Uuid::now_v7(),
        payload: json!({"n": 1}),
        extra_headers: HashMap::new(),
        reply_to: None,
    }
}

// ---------------------------------------------------------------------------
// Command bus
// ---------------------------------------------------------------------------

// Property 4: a rolled-back unit of work leaves no trace in any table
#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_rolled_back_unit_of_work_leaves_nothing(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let bus = CommandBus::new(QueueNaming::default());

    {
        let mut uow = UnitOfWork::begin(&pool).await?;
        let instance = ProcessInstance::new("payment", "BK-ATOMIC", Map::new());
        instance.insert(uow.conn()).await?;
        ProcessInstance::log(
            uow.conn(),
            instance.process_id,
            &conductor_shared::models::ProcessEvent::ProcessCompleted,
        )
        .await?;
        bus.accept(uow.conn(), request("Reserve", "atomic:1")).await?;
        // Injected failure after the last insert: drop without commit
        drop(uow);
    }

    let processes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM process")
        .fetch_one(&pool)
        .await?;
    let logs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM process_log")
        .fetch_one(&pool)
        .await?;
    let commands: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM command")
        .fetch_one(&pool)
        .await?;
    let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(&pool)
        .await?;
    assert_eq!((processes, logs, commands, outbox), (0, 0, 0, 0));
    Ok(())
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_accept_co_commits_command_and_outbox(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let bus = CommandBus::new(QueueNaming::default());

    let mut uow = UnitOfWork::begin(&pool).await?;
    let command_id = bus
        .accept(uow.conn(), request("ReserveFunds", "pipe:1"))
        .await?;

    // Uncommitted: invisible to the sweeper's pool connection
    let rows = OutboxRow::sweep(&pool, 10, "early-bird", Duration::from_secs(300)).await?;
    assert!(rows.is_empty(), "uncommitted outbox rows are invisible");

    uow.commit().await?;

    let command = CommandRow::find_by_id(&pool, command_id).await?.unwrap();
    assert_eq!(command.status, CommandStatus::Pending);
    assert_eq!(command.name, "ReserveFunds");

    let rows = OutboxRow::find_by_status(&pool, OutboxStatus::New).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].topic, "APP.CMD.RESERVEFUNDS.Q");
    let envelope = rows[0].to_envelope()?;
    assert_eq!(envelope.command_id, Some(command_id));
    assert_eq!(
        envelope.header("idempotencyKey"),
        Some("pipe:1"),
        "idempotency key travels on the envelope"
    );
    assert_eq!(envelope.header("replyTo"), Some("APP.CMD.REPLY.Q"));
    Ok(())
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_accept_duplicate_idempotency_key(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let bus = CommandBus::new(QueueNaming::default());

    let mut uow = UnitOfWork::begin(&pool).await?;
    bus.accept(uow.conn(), request("Reserve", "pipe:dup")).await?;
    uow.commit().await?;

    let mut uow = UnitOfWork::begin(&pool).await?;
    let err = bus
        .accept(uow.conn(), request("Reserve", "pipe:dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::IdempotencyConflict { .. }));
    Ok(())
}

// ---------------------------------------------------------------------------
// Outbox dispatcher
// ---------------------------------------------------------------------------

fn dispatcher(pool: &PgPool, transport: &MessageTransport) -> OutboxDispatcher {
    OutboxDispatcher::new(
        pool.clone(),
        transport.clone(),
        DispatcherConfig {
            workers: 1,
            batch_size: 10,
            poll_interval: Duration::from_millis(20),
            claim_timeout: Duration::from_secs(300),
        },
        CancellationToken::new(),
    )
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_dispatcher_publishes_and_marks_rows(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let bus = CommandBus::new(QueueNaming::default());
    let mut uow = UnitOfWork::begin(&pool).await?;
    bus.accept(uow.conn(), request("Alpha", "d:1")).await?;
    bus.accept(uow.conn(), request("Beta", "d:2")).await?;
    uow.commit().await?;

    let transport = MessageTransport::in_memory_recording();
    let published = dispatcher(&pool, &transport).process_batch("w0").await?;
    assert_eq!(published, 2);

    let log = transport.as_in_memory().unwrap().published();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].0, "APP.CMD.ALPHA.Q");
    assert_eq!(log[1].0, "APP.CMD.BETA.Q");

    let remaining = OutboxRow::find_by_status(&pool, OutboxStatus::New).await?;
    assert!(remaining.is_empty());
    let done = OutboxRow::find_by_status(&pool, OutboxStatus::Published).await?;
    assert_eq!(done.len(), 2);
    Ok(())
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_dispatcher_leaves_row_claimed_on_transient_failure(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let bus = CommandBus::new(QueueNaming::default());
    let mut uow = UnitOfWork::begin(&pool).await?;
    bus.accept(uow.conn(), request("Gamma", "d:3")).await?;
    uow.commit().await?;

    let transport = MessageTransport::in_memory_recording();
    transport
        .as_in_memory()
        .unwrap()
        .inject_failure("APP.CMD.GAMMA.Q");

    let published = dispatcher(&pool, &transport).process_batch("w0").await?;
    assert_eq!(published, 0);

    // Left CLAIMED for the recovery loop, not parked
    let claimed = OutboxRow::find_by_status(&pool, OutboxStatus::Claimed).await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some("w0"));

    // After the broker recovers and the claim is reset, publish succeeds
    transport
        .as_in_memory()
        .unwrap()
        .clear_failure("APP.CMD.GAMMA.Q");
    sqlx::query("UPDATE outbox SET created_at = now() - interval '10 minutes'")
        .execute(&pool)
        .await?;
    OutboxRow::recover_stuck(&pool, Duration::from_secs(300)).await?;

    let published = dispatcher(&pool, &transport).process_batch("w0").await?;
    assert_eq!(published, 1);
    Ok(())
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_dispatcher_parks_malformed_row(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    // Row without envelope identity headers cannot be rebuilt
    sqlx::query(
        r#"
        INSERT INTO outbox (category, topic, key, type, payload, headers, status)
        VALUES ('command', 'APP.CMD.BROKEN.Q', NULL, 'Broken', '{}', '{}'::jsonb, 'NEW')
        "#,
    )
    .execute(&pool)
    .await?;

    let transport = MessageTransport::in_memory_recording();
    let published = dispatcher(&pool, &transport).process_batch("w0").await?;
    assert_eq!(published, 0);

    let failed = OutboxRow::find_by_status(&pool, OutboxStatus::Failed).await?;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].next_at.is_some());
    assert!(failed[0].last_error.is_some());
    Ok(())
}

// ---------------------------------------------------------------------------
// Reply intake (E6: duplicate reply)
// ---------------------------------------------------------------------------

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_duplicate_reply_dropped_by_inbox(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = test_manager(&pool);
    manager.register(LinearDefinition::new("payment", &["A", "B"]))?;
    let process_id = manager.start("payment", "BK-E6", Map::new()).await?;

    let command = CommandRow::find_by_idempotency_key(&pool, &format!("{process_id}:A"))
        .await?
        .pop()
        .unwrap();

    let transport = MessageTransport::in_memory();
    let consumer = ReplyConsumer::new(
        pool.clone(),
        Arc::clone(&manager),
        transport,
        "APP.CMD.REPLY.Q",
        CancellationToken::new(),
    );

    let envelope = Envelope::reply(
        REPLY_COMPLETED,
        command.id,
        process_id,
        "BK-E6",
        json!({"status": "SUCCEEDED", "data": {"x": 1}}).to_string(),
    );

    consumer.process_reply(envelope.clone()).await?;
    // Identical messageId delivered again: dropped by the inbox
    consumer.process_reply(envelope.clone()).await?;

    let instance = ProcessInstance::find_by_id(&pool, process_id)
        .await?
        .unwrap();
    assert_eq!(instance.current_step.as_deref(), Some("B"));

    // The instance transitioned exactly once
    let step_b_commands =
        CommandRow::find_by_idempotency_key(&pool, &format!("{process_id}:B")).await?;
    assert_eq!(step_b_commands.len(), 1);

    let entries = ProcessInstance::log_entries(&pool, process_id).await?;
    let completed = entries
        .iter()
        .filter(|e| e.event.0.name() == "StepCompleted")
        .count();
    assert_eq!(completed, 1);

    // Command outcome recorded, inbox marker present
    let command = CommandRow::find_by_id(&pool, command.id).await?.unwrap();
    assert_eq!(command.status, CommandStatus::Succeeded);
    assert!(InboxKey::find(&pool, envelope.message_id, REPLY_HANDLER)
        .await?
        .is_some());
    Ok(())
}

// ---------------------------------------------------------------------------
// Recovery loop: expired command leases flow through the reply pipeline
// ---------------------------------------------------------------------------

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_recovery_times_out_expired_leases(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = test_manager(&pool);
    manager.register(LinearDefinition::new("payment", &["A"]))?;
    let process_id = manager.start("payment", "BK-REC", Map::new()).await?;

    let command = CommandRow::find_by_idempotency_key(&pool, &format!("{process_id}:A"))
        .await?
        .pop()
        .unwrap();

    // Worker claimed the command but died; its lease is in the past
    CommandRow::mark_running(
        &pool,
        command.id,
        chrono::Utc::now() - chrono::Duration::seconds(10),
    )
    .await?;

    let recovery = RecoveryLoop::new(
        pool.clone(),
        Arc::clone(&manager),
        RecoverySettings::default(),
        CancellationToken::new(),
    );
    recovery.run_once().await?;

    let command = CommandRow::find_by_id(&pool, command.id).await?.unwrap();
    assert_eq!(command.status, CommandStatus::TimedOut);

    let instance = ProcessInstance::find_by_id(&pool, process_id)
        .await?
        .unwrap();
    assert_eq!(instance.status, ProcessStatus::Failed);

    let entries = ProcessInstance::log_entries(&pool, process_id).await?;
    let names: Vec<&str> = entries.iter().map(|e| e.event.0.name()).collect();
    assert!(names.contains(&"StepTimedOut"));
    assert!(names.contains(&"ProcessFailed"));

    let parked = DlqEntry::find_by_command_id(&pool, command.id).await?;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].error_class, "timeout");
    Ok(())
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_recovery_is_a_noop_when_nothing_is_stuck(
    pool: PgPool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = test_manager(&pool);
    let recovery = RecoveryLoop::new(
        pool.clone(),
        manager,
        RecoverySettings::default(),
        CancellationToken::new(),
    );
    recovery.run_once().await?;
    Ok(())
}
