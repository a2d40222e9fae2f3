//! Full-loop end-to-end flows: the process manager enqueues through the
//! transactional outbox, dispatcher workers publish onto the in-memory
//! transport, a scripted worker consumes commands and posts replies, and the
//! reply consumer drives the process to its terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_orchestration::definition::ProcessDefinition;
use conductor_orchestration::dispatcher::{DispatcherConfig, OutboxDispatcher};
use conductor_orchestration::graph::{ProcessGraph, ProcessGraphBuilder};
use conductor_orchestration::manager::{ProcessManager, REPLY_COMPLETED, REPLY_FAILED};
use conductor_orchestration::registry::ProcessRegistry;
use conductor_orchestration::reply::ReplyConsumer;
use conductor_shared::messaging::{headers, Envelope, MessageTransport, QueueNaming};
use conductor_shared::models::{
    CommandStatus, OutboxRow, OutboxStatus, ProcessInstance, ProcessStatus,
};

/// Scripted worker behavior per command name
#[derive(Clone)]
enum WorkerScript {
    Complete(Value),
    Fail(&'static str),
}

struct PaymentDefinition {
    graph: ProcessGraph,
}

impl ProcessDefinition for PaymentDefinition {
    fn process_type(&self) -> &str {
        self.graph.process_type()
    }

    fn graph(&self) -> &ProcessGraph {
        &self.graph
    }
}

/// Wire up manager + dispatcher workers + reply consumer over one transport.
fn start_runtime(
    pool: &PgPool,
    transport: &MessageTransport,
) -> (Arc<ProcessManager>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let naming = QueueNaming::default();

    let manager = ProcessManager::new(
        pool.clone(),
        Arc::new(ProcessRegistry::new()),
        naming.clone(),
        shutdown.clone(),
    );

    let dispatcher = OutboxDispatcher::new(
        pool.clone(),
        transport.clone(),
        DispatcherConfig {
            workers: 2,
            batch_size: 10,
            poll_interval: Duration::from_millis(20),
            claim_timeout: Duration::from_secs(300),
        },
        shutdown.clone(),
    );
    dispatcher.spawn();

    let consumer = ReplyConsumer::new(
        pool.clone(),
        Arc::clone(&manager),
        transport.clone(),
        naming.reply_queue().to_string(),
        shutdown.clone(),
    );
    consumer.spawn();

    (manager, shutdown)
}

/// Spawn a scripted worker: one subscription per command name, replying
/// according to the script and echoing any parallel branch marker.
fn spawn_worker(transport: &MessageTransport, scripts: HashMap<&'static str, WorkerScript>) {
    let naming = QueueNaming::default();
    for (command_name, script) in scripts {
        let topic = naming.command_topic(command_name);
        let mut subscription = transport.subscribe(&topic);
        let transport = transport.clone();
        tokio::spawn(async move {
            while let Some(envelope) = subscription.receiver.recv().await {
                let Some(command_id) = envelope.command_id else {
                    continue;
                };

                let mut data = Map::new();
                if let Some(branch) = envelope.header(headers::PARALLEL_BRANCH) {
                    data.insert("parallelBranch".to_string(), json!(branch));
                }

                let (reply_type, payload) = match &script {
                    WorkerScript::Complete(result) => {
                        if let Some(result) = result.as_object() {
                            for (key, value) in result {
                                data.insert(key.clone(), value.clone());
                            }
                        }
                        (
                            REPLY_COMPLETED,
                            json!({"status": "SUCCEEDED", "data": data, "error": null}),
                        )
                    }
                    WorkerScript::Fail(error) => (
                        REPLY_FAILED,
                        json!({"status": "FAILED", "data": data, "error": error}),
                    ),
                };

                let reply = Envelope::reply(
                    reply_type,
                    command_id,
                    envelope.correlation_id,
                    envelope.business_key.clone(),
                    payload.to_string(),
                );
                let reply_queue = envelope.reply_to_or("APP.CMD.REPLY.Q").to_string();
                let _ = transport.publish(&reply_queue, &reply).await;
            }
        });
    }
}

async fn wait_for_status(pool: &PgPool, process_id: Uuid, status: ProcessStatus) -> ProcessInstance {
    for _ in 0..500 {
        let instance = ProcessInstance::find_by_id(pool, process_id)
            .await
            .unwrap()
            .expect("instance exists");
        if instance.status == status {
            return instance;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for process {process_id} to reach {status}");
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_full_loop_happy_path(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let transport = MessageTransport::in_memory();
    let (manager, shutdown) = start_runtime(&pool, &transport);

    manager.register(Arc::new(PaymentDefinition {
        graph: ProcessGraphBuilder::new("payment")
            .start_with("ReserveFunds")
            .then("ChargeCard")
            .end()?,
    }))?;

    spawn_worker(
        &transport,
        HashMap::from([
            ("ReserveFunds", WorkerScript::Complete(json!({"reservation": "R-1"}))),
            ("ChargeCard", WorkerScript::Complete(json!({"charge": "C-1"}))),
        ]),
    );

    let process_id = manager
        .start("payment", "ORDER-100", Map::new())
        .await?;

    let instance = wait_for_status(&pool, process_id, ProcessStatus::Succeeded).await;
    assert_eq!(instance.data.0.get("reservation"), Some(&json!("R-1")));
    assert_eq!(instance.data.0.get("charge"), Some(&json!("C-1")));

    // Every outbox row reached the transport
    let unpublished = OutboxRow::find_by_status(&pool, OutboxStatus::New).await?;
    assert!(unpublished.is_empty());
    let claimed = OutboxRow::find_by_status(&pool, OutboxStatus::Claimed).await?;
    assert!(claimed.is_empty());

    // Both commands reached their terminal status
    let succeeded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM command WHERE status = $1")
            .bind(CommandStatus::Succeeded.as_str())
            .fetch_one(&pool)
            .await?;
    assert_eq!(succeeded, 2);

    let entries = ProcessInstance::log_entries(&pool, process_id).await?;
    let names: Vec<&str> = entries.iter().map(|e| e.event.0.name()).collect();
    assert_eq!(
        names,
        vec![
            "ProcessStarted",
            "StepStarted",
            "StepCompleted",
            "StepStarted",
            "StepCompleted",
            "ProcessCompleted",
        ]
    );

    shutdown.cancel();
    Ok(())
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_full_loop_compensation(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let transport = MessageTransport::in_memory();
    let (manager, shutdown) = start_runtime(&pool, &transport);

    manager.register(Arc::new(PaymentDefinition {
        graph: ProcessGraphBuilder::new("payment")
            .start_with("ReserveFunds")
            .with_compensation("ReleaseFunds")
            .then("ChargeCard")
            .end()?,
    }))?;

    spawn_worker(
        &transport,
        HashMap::from([
            ("ReserveFunds", WorkerScript::Complete(json!({"reservation": "R-2"}))),
            ("ChargeCard", WorkerScript::Fail("card declined")),
            ("ReleaseFunds", WorkerScript::Complete(json!({"released": true}))),
        ]),
    );

    let process_id = manager
        .start("payment", "ORDER-200", Map::new())
        .await?;

    let instance = wait_for_status(&pool, process_id, ProcessStatus::Compensated).await;
    assert_eq!(instance.data.0.get("reservation"), Some(&json!("R-2")));

    let entries = ProcessInstance::log_entries(&pool, process_id).await?;
    let names: Vec<&str> = entries.iter().map(|e| e.event.0.name()).collect();
    assert!(names.contains(&"StepFailed"));
    assert!(names.contains(&"CompensationStarted"));
    assert!(names.contains(&"CompensationCompleted"));

    shutdown.cancel();
    Ok(())
}

#[sqlx::test(migrator = "conductor_shared::database::MIGRATOR")]
async fn test_full_loop_parallel_fan_out(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let transport = MessageTransport::in_memory();
    let (manager, shutdown) = start_runtime(&pool, &transport);

    manager.register(Arc::new(PaymentDefinition {
        graph: ProcessGraphBuilder::new("enrichment")
            .start_with("Load")
            .then("FanOut")
            .then_parallel()
            .branch("FetchRisk")
            .branch("FetchLimits")
            .join_at("Merge")
            .end()?,
    }))?;

    spawn_worker(
        &transport,
        HashMap::from([
            ("Load", WorkerScript::Complete(json!({"loaded": true}))),
            ("FetchRisk", WorkerScript::Complete(json!({"risk": "low"}))),
            ("FetchLimits", WorkerScript::Complete(json!({"limit": 5000}))),
            ("Merge", WorkerScript::Complete(json!({"merged": true}))),
        ]),
    );

    let process_id = manager
        .start("enrichment", "CUST-300", Map::new())
        .await?;

    let instance = wait_for_status(&pool, process_id, ProcessStatus::Succeeded).await;
    assert_eq!(instance.data.0.get("risk"), Some(&json!("low")));
    assert_eq!(instance.data.0.get("limit"), Some(&json!(5000)));
    assert_eq!(instance.data.0.get("merged"), Some(&json!(true)));
    assert!(!instance.data.0.keys().any(|k| k.starts_with("_parallel_")));

    shutdown.cancel();
    Ok(())
}
