//! # Durable Models
//!
//! Row types with their SQL on the model, in the repository-on-the-struct
//! style: `ProcessInstance::find_by_id(pool, id)`. Operations that must be
//! atomic with others take the owning transaction's connection.

pub mod command;
pub mod dlq;
pub mod inbox;
pub mod outbox;
pub mod process;

pub use command::{CommandRow, CommandStatus, ReplyRouting};
pub use dlq::DlqEntry;
pub use inbox::InboxKey;
pub use outbox::{
    default_publish_backoff, publish_backoff, OutboxRow, OutboxStatus, BASE_BACKOFF_MS,
    MAX_BACKOFF_MS,
};
pub use process::{
    ProcessEvent, ProcessInstance, ProcessLogEntry, ProcessStatus, BRANCH_COMPLETED,
    BRANCH_PENDING, PARALLEL_KEY_PREFIX,
};
