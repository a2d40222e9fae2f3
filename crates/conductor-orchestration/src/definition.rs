//! # Process Definition
//!
//! A process definition binds a graph to its retry policy. Definitions are
//! registered once at startup and consulted on every reply.

use std::time::Duration;

use conductor_shared::models::outbox::default_publish_backoff;

use crate::graph::ProcessGraph;

/// Behavior of one process type.
///
/// The graph decides where a process goes; the definition decides how hard
/// each step fights before giving up.
pub trait ProcessDefinition: Send + Sync {
    /// Unique process type this definition drives
    fn process_type(&self) -> &str;

    /// The validated step graph
    fn graph(&self) -> &ProcessGraph;

    /// Whether a step failure with the given error should be retried
    fn is_retryable(&self, _step: &str, _error: &str) -> bool {
        false
    }

    /// Maximum retries for a step before permanent handling
    fn max_retries(&self, _step: &str) -> u32 {
        0
    }

    /// Delay before re-dispatching a step, given the retry count so far
    fn retry_delay(&self, _step: &str, retries: u32) -> Duration {
        default_publish_backoff(retries.saturating_sub(1))
    }

    /// Command name dispatched for a step; defaults to the step name itself
    fn command_name(&self, step: &str) -> String {
        step.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProcessGraphBuilder;

    struct Fixed {
        graph: ProcessGraph,
    }

    impl ProcessDefinition for Fixed {
        fn process_type(&self) -> &str {
            "fixed"
        }

        fn graph(&self) -> &ProcessGraph {
            &self.graph
        }
    }

    #[test]
    fn test_defaults() {
        let definition = Fixed {
            graph: ProcessGraphBuilder::new("fixed")
                .start_with("Only")
                .end()
                .unwrap(),
        };
        assert!(!definition.is_retryable("Only", "boom"));
        assert_eq!(definition.max_retries("Only"), 0);
        assert_eq!(definition.command_name("Only"), "Only");
        // First retry waits the base backoff
        assert_eq!(definition.retry_delay("Only", 1), Duration::from_millis(1_000));
        assert_eq!(definition.retry_delay("Only", 3), Duration::from_millis(4_000));
    }
}
