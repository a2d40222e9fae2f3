//! # Conductor Orchestration
//!
//! The process-manager core: graph model and builder, definition registry,
//! step dispatch over the command bus, reply handling with parallel
//! fan-out/fan-in and compensation, outbox dispatcher workers, reply intake,
//! and the recovery loop.

pub mod bootstrap;
pub mod command_bus;
pub mod definition;
pub mod dispatcher;
pub mod graph;
pub mod manager;
pub mod recovery;
pub mod registry;
pub mod reply;

pub use bootstrap::ConductorRuntime;
pub use command_bus::{CommandBus, CommandRequest};
pub use definition::ProcessDefinition;
pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use graph::{GraphError, NextStep, ProcessGraph, ProcessGraphBuilder, ProcessStep};
pub use manager::{CommandReply, ProcessManager, ReplyStatus};
pub use recovery::RecoveryLoop;
pub use registry::ProcessRegistry;
pub use reply::{ReplyConsumer, REPLY_HANDLER};
