//! # Process Graph Builder
//!
//! Fluent composition of process graphs:
//!
//! ```
//! use conductor_orchestration::graph::ProcessGraphBuilder;
//! use serde_json::Value;
//!
//! let graph = ProcessGraphBuilder::new("payment")
//!     .start_with("ReserveFunds")
//!     .with_compensation("ReleaseFunds")
//!     .then_if(|data| data.get("premium").and_then(Value::as_bool).unwrap_or(false))
//!     .when_true("ApplyDiscount")
//!     .then("ChargeCard")
//!     .then_parallel()
//!     .branch("NotifyLedger")
//!     .branch("NotifyCrm")
//!     .join_at("Finalize")
//!     .end()
//!     .expect("valid graph");
//!
//! assert_eq!(graph.initial_step(), "ReserveFunds");
//! ```
//!
//! Steps referenced before declaration, cycles, and broken parallel shapes
//! all surface as [`GraphError`] from `end()`, before any instance exists.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::{GraphError, NextStep, ProcessGraph, ProcessStep, StepPredicate};

/// Fluent builder for [`ProcessGraph`]
pub struct ProcessGraphBuilder {
    process_type: String,
    initial_step: Option<String>,
    steps: HashMap<String, ProcessStep>,
    cursor: Option<String>,
    deferred_error: Option<GraphError>,
}

impl std::fmt::Debug for ProcessGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGraphBuilder")
            .field("process_type", &self.process_type)
            .field("initial_step", &self.initial_step)
            .field("steps", &self.steps.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl ProcessGraphBuilder {
    pub fn new(process_type: impl Into<String>) -> Self {
        Self {
            process_type: process_type.into(),
            initial_step: None,
            steps: HashMap::new(),
            cursor: None,
            deferred_error: None,
        }
    }

    fn declare(&mut self, name: &str) {
        self.steps
            .entry(name.to_string())
            .or_insert_with(|| ProcessStep {
                name: name.to_string(),
                compensation_step: None,
                next: NextStep::Terminal,
            });
    }

    fn set_next(&mut self, step: &str, next: NextStep) {
        if let Some(node) = self.steps.get_mut(step) {
            node.next = next;
        }
    }

    /// Declare the initial step
    pub fn start_with(mut self, step: impl Into<String>) -> Self {
        let step = step.into();
        if self.initial_step.is_some() {
            self.deferred_error
                .get_or_insert(GraphError::DuplicateStep { step: step.clone() });
            return self;
        }
        self.declare(&step);
        self.initial_step = Some(step.clone());
        self.cursor = Some(step);
        self
    }

    /// Chain a step after the cursor
    pub fn then(mut self, step: impl Into<String>) -> Self {
        let step = step.into();
        self.declare(&step);
        if let Some(cursor) = self.cursor.clone() {
            self.set_next(&cursor, NextStep::Direct(step.clone()));
        }
        self.cursor = Some(step);
        self
    }

    /// Attach a compensation to the cursor step
    pub fn with_compensation(mut self, step: impl Into<String>) -> Self {
        let step = step.into();
        self.declare(&step);
        if let Some(cursor) = self.cursor.clone() {
            if let Some(node) = self.steps.get_mut(&cursor) {
                node.compensation_step = Some(step);
            }
        }
        self
    }

    /// Begin a conditional edge from the cursor
    pub fn then_if<F>(self, predicate: F) -> ConditionalBuilder
    where
        F: Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        ConditionalBuilder {
            builder: self,
            predicate: Arc::new(predicate),
            when_true: None,
            when_false: None,
        }
    }

    /// Begin a parallel fan-out from the cursor
    pub fn then_parallel(self) -> ParallelBuilder {
        ParallelBuilder {
            builder: self,
            branches: Vec::new(),
        }
    }

    /// Finish the graph: the cursor step becomes terminal, and the whole
    /// structure is validated.
    pub fn end(self) -> Result<ProcessGraph, GraphError> {
        if let Some(error) = self.deferred_error {
            return Err(error);
        }
        let initial_step = self.initial_step.ok_or(GraphError::Empty)?;
        let graph = ProcessGraph::from_parts(self.process_type, initial_step, self.steps);
        graph.validate()?;
        Ok(graph)
    }
}

/// Conditional edge under construction.
///
/// `when_true(step).then(continuation)` is the optional-branch form: the
/// false path short-circuits to the continuation. Adding `when_false(step)`
/// makes a full if/else converging at `then`'s argument.
pub struct ConditionalBuilder {
    builder: ProcessGraphBuilder,
    predicate: StepPredicate,
    when_true: Option<String>,
    when_false: Option<String>,
}

impl std::fmt::Debug for ConditionalBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalBuilder")
            .field("when_true", &self.when_true)
            .field("when_false", &self.when_false)
            .finish_non_exhaustive()
    }
}

impl ConditionalBuilder {
    pub fn when_true(mut self, step: impl Into<String>) -> Self {
        let step = step.into();
        self.builder.declare(&step);
        self.when_true = Some(step);
        self
    }

    pub fn when_false(mut self, step: impl Into<String>) -> Self {
        let step = step.into();
        self.builder.declare(&step);
        self.when_false = Some(step);
        self
    }

    /// Close the conditional: both arms converge at `continuation`, which
    /// becomes the new cursor.
    pub fn then(mut self, continuation: impl Into<String>) -> ProcessGraphBuilder {
        let continuation = continuation.into();
        self.builder.declare(&continuation);

        let when_true = self
            .when_true
            .clone()
            .unwrap_or_else(|| continuation.clone());
        let when_false = self
            .when_false
            .clone()
            .unwrap_or_else(|| continuation.clone());

        if let Some(cursor) = self.builder.cursor.clone() {
            self.builder.set_next(
                &cursor,
                NextStep::Conditional {
                    predicate: self.predicate,
                    when_true: when_true.clone(),
                    when_false: when_false.clone(),
                },
            );
        }

        // Declared arms flow on to the continuation
        if when_true != continuation {
            self.builder
                .set_next(&when_true, NextStep::Direct(continuation.clone()));
        }
        if when_false != continuation {
            self.builder
                .set_next(&when_false, NextStep::Direct(continuation.clone()));
        }

        self.builder.cursor = Some(continuation);
        self.builder
    }
}

/// Parallel fan-out under construction
#[derive(Debug)]
pub struct ParallelBuilder {
    builder: ProcessGraphBuilder,
    branches: Vec<String>,
}

impl ParallelBuilder {
    /// Add a branch step
    pub fn branch(mut self, step: impl Into<String>) -> Self {
        let step = step.into();
        self.builder.declare(&step);
        self.branches.push(step);
        self
    }

    /// Close the fan-out: every branch leads to `join`, which becomes the
    /// new cursor.
    pub fn join_at(mut self, join: impl Into<String>) -> ProcessGraphBuilder {
        let join = join.into();
        self.builder.declare(&join);

        if let Some(cursor) = self.builder.cursor.clone() {
            if self.branches.is_empty() {
                // Degenerate fan-out collapses to a direct edge
                self.builder.set_next(&cursor, NextStep::Direct(join.clone()));
            } else {
                self.builder.set_next(
                    &cursor,
                    NextStep::Parallel {
                        branches: self.branches.clone(),
                        join_step: join.clone(),
                    },
                );
            }
        }

        for branch in &self.branches {
            self.builder
                .set_next(branch, NextStep::Direct(join.clone()));
        }

        self.builder.cursor = Some(join);
        self.builder
    }
}
