//! # Conductor Shared
//!
//! Shared substrate for the conductor process-manager platform: the message
//! envelope and transport seam, durable models (process, command, outbox,
//! inbox, DLQ), the error taxonomy and classifier, configuration, and the
//! transactional unit of work.

pub mod config;
pub mod database;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod models;

pub use config::ConductorConfig;
pub use database::UnitOfWork;
pub use errors::{ConductorError, ConductorResult, FailureKind};
