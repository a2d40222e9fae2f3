//! # Queue and Topic Naming
//!
//! Resolves command topics and the reply queue from the configured naming
//! scheme. Command topics follow `<command_prefix><UPPER(name)><queue_suffix>`;
//! replies default to a single shared reply queue unless an envelope carries
//! an explicit `replyTo` header.

use serde::{Deserialize, Serialize};

/// Default command topic prefix
pub const DEFAULT_COMMAND_PREFIX: &str = "APP.CMD.";

/// Default queue suffix
pub const DEFAULT_QUEUE_SUFFIX: &str = ".Q";

/// Default reply queue
pub const DEFAULT_REPLY_QUEUE: &str = "APP.CMD.REPLY.Q";

/// Configuration-visible naming scheme for command topics and reply queues
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueNaming {
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_queue_suffix")]
    pub queue_suffix: String,
    #[serde(default = "default_reply_queue")]
    pub reply_queue: String,
}

fn default_command_prefix() -> String {
    DEFAULT_COMMAND_PREFIX.to_string()
}

fn default_queue_suffix() -> String {
    DEFAULT_QUEUE_SUFFIX.to_string()
}

fn default_reply_queue() -> String {
    DEFAULT_REPLY_QUEUE.to_string()
}

impl Default for QueueNaming {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            queue_suffix: default_queue_suffix(),
            reply_queue: default_reply_queue(),
        }
    }
}

impl QueueNaming {
    /// Topic a command with the given name is published to
    pub fn command_topic(&self, command_name: &str) -> String {
        format!(
            "{}{}{}",
            self.command_prefix,
            command_name.to_uppercase(),
            self.queue_suffix
        )
    }

    /// Queue replies are routed to when the envelope has no `replyTo` header
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }
}

/// Derive a step name from a command type's short name.
///
/// Short names ending in `Command` drop the suffix (`ReserveFundsCommand` →
/// `ReserveFunds`); anything else is used verbatim.
pub fn step_name_for_command(short_name: &str) -> &str {
    short_name.strip_suffix("Command").unwrap_or(short_name)
}
