//! # Process Graph
//!
//! Static DAG of named steps. Each step carries an optional compensation and
//! one outgoing `NextStep` relation: direct, conditional, parallel fan-out,
//! or terminal. Graphs are built once through the fluent builder, validated,
//! and read-only afterwards.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod builder;

pub use builder::{ConditionalBuilder, ParallelBuilder, ProcessGraphBuilder};

/// Predicate over the instance data for conditional edges
pub type StepPredicate = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

/// Graph construction and validation failures.
///
/// All of these surface at registration time, before any instance exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("step '{step}' references undeclared step '{target}'")]
    UndeclaredStep { step: String, target: String },

    #[error("initial step '{step}' is not declared")]
    UndeclaredInitialStep { step: String },

    #[error("cycle detected through step '{step}'")]
    Cycle { step: String },

    #[error("step '{step}' is declared more than once")]
    DuplicateStep { step: String },

    #[error("compensation step '{step}' cannot be the source of a parallel fan-out")]
    CompensationFansOut { step: String },

    #[error("parallel branch '{branch}' must lead directly to join '{join}'")]
    BranchBypassesJoin { branch: String, join: String },

    #[error("graph has no steps")]
    Empty,
}

/// Outgoing relation of a step
#[derive(Clone)]
pub enum NextStep {
    /// Unconditional transition
    Direct(String),
    /// Predicate over the instance data picks the target
    Conditional {
        predicate: StepPredicate,
        when_true: String,
        when_false: String,
    },
    /// Fan out into branches that converge at the join step
    Parallel {
        branches: Vec<String>,
        join_step: String,
    },
    /// End of the graph
    Terminal,
}

impl std::fmt::Debug for NextStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextStep::Direct(target) => f.debug_tuple("Direct").field(target).finish(),
            NextStep::Conditional {
                when_true,
                when_false,
                ..
            } => f
                .debug_struct("Conditional")
                .field("when_true", when_true)
                .field("when_false", when_false)
                .finish_non_exhaustive(),
            NextStep::Parallel {
                branches,
                join_step,
            } => f
                .debug_struct("Parallel")
                .field("branches", branches)
                .field("join_step", join_step)
                .finish(),
            NextStep::Terminal => f.write_str("Terminal"),
        }
    }
}

/// One node of the graph
#[derive(Debug, Clone)]
pub struct ProcessStep {
    pub name: String,
    pub compensation_step: Option<String>,
    pub next: NextStep,
}

/// Immutable, validated process graph
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    process_type: String,
    initial_step: String,
    steps: HashMap<String, ProcessStep>,
}

impl ProcessGraph {
    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn initial_step(&self) -> &str {
        &self.initial_step
    }

    pub fn step(&self, name: &str) -> Option<&ProcessStep> {
        self.steps.get(name)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Resolve the step that follows `step` given the instance data.
    ///
    /// `None` means the step is terminal. Parallel steps have no single
    /// successor here; the manager takes the fan-out path instead.
    pub fn next_step(&self, step: &str, data: &Map<String, Value>) -> Option<&str> {
        match self.steps.get(step).map(|s| &s.next) {
            Some(NextStep::Direct(target)) => Some(target.as_str()),
            Some(NextStep::Conditional {
                predicate,
                when_true,
                when_false,
            }) => {
                if predicate(data) {
                    Some(when_true.as_str())
                } else {
                    Some(when_false.as_str())
                }
            }
            Some(NextStep::Parallel { join_step, .. }) => Some(join_step.as_str()),
            Some(NextStep::Terminal) | None => None,
        }
    }

    /// Validate structural invariants. Called by the builder; kept separate
    /// so hand-assembled graphs in tests go through the same checks.
    pub(crate) fn validate(&self) -> Result<(), GraphError> {
        if self.steps.is_empty() {
            return Err(GraphError::Empty);
        }
        if !self.steps.contains_key(&self.initial_step) {
            return Err(GraphError::UndeclaredInitialStep {
                step: self.initial_step.clone(),
            });
        }

        let compensation_steps: Vec<&String> = self
            .steps
            .values()
            .filter_map(|s| s.compensation_step.as_ref())
            .collect();

        for step in self.steps.values() {
            let check = |target: &str| -> Result<(), GraphError> {
                if self.steps.contains_key(target) {
                    Ok(())
                } else {
                    Err(GraphError::UndeclaredStep {
                        step: step.name.clone(),
                        target: target.to_string(),
                    })
                }
            };

            match &step.next {
                NextStep::Direct(target) => check(target)?,
                NextStep::Conditional {
                    when_true,
                    when_false,
                    ..
                } => {
                    check(when_true)?;
                    check(when_false)?;
                }
                NextStep::Parallel {
                    branches,
                    join_step,
                } => {
                    check(join_step)?;
                    if compensation_steps.contains(&&step.name) {
                        return Err(GraphError::CompensationFansOut {
                            step: step.name.clone(),
                        });
                    }
                    for branch in branches {
                        check(branch)?;
                        match self.steps.get(branch).map(|b| &b.next) {
                            Some(NextStep::Direct(target)) if target == join_step => {}
                            _ => {
                                return Err(GraphError::BranchBypassesJoin {
                                    branch: branch.clone(),
                                    join: join_step.clone(),
                                });
                            }
                        }
                    }
                }
                NextStep::Terminal => {}
            }

            if let Some(comp) = &step.compensation_step {
                check(comp)?;
            }
        }

        self.check_acyclic()
    }

    /// Depth-first cycle detection over the forward edges
    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = self
            .steps
            .keys()
            .map(|k| (k.as_str(), Mark::Unvisited))
            .collect();

        fn forward_edges(next: &NextStep) -> Vec<&str> {
            match next {
                NextStep::Direct(t) => vec![t.as_str()],
                NextStep::Conditional {
                    when_true,
                    when_false,
                    ..
                } => vec![when_true.as_str(), when_false.as_str()],
                NextStep::Parallel {
                    branches,
                    join_step,
                } => {
                    let mut edges: Vec<&str> = branches.iter().map(String::as_str).collect();
                    edges.push(join_step.as_str());
                    edges
                }
                NextStep::Terminal => Vec::new(),
            }
        }

        fn visit<'a>(
            graph: &'a ProcessGraph,
            step: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), GraphError> {
            match marks.get(step) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(GraphError::Cycle {
                        step: step.to_string(),
                    })
                }
                _ => {}
            }
            marks.insert(step, Mark::InProgress);
            if let Some(node) = graph.steps.get(step) {
                for target in forward_edges(&node.next) {
                    visit(graph, target, marks)?;
                }
            }
            marks.insert(step, Mark::Done);
            Ok(())
        }

        let names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        for name in names {
            visit(self, name, &mut marks)?;
        }
        Ok(())
    }

    pub(crate) fn from_parts(
        process_type: String,
        initial_step: String,
        steps: HashMap<String, ProcessStep>,
    ) -> Self {
        Self {
            process_type,
            initial_step,
            steps,
        }
    }
}
