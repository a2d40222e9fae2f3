//! # Process Registry
//!
//! Process-wide registry of definitions. Written only at startup, read on
//! every start/reply; the map permits fully concurrent reads.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use conductor_shared::errors::{ConductorError, ConductorResult};

use crate::definition::ProcessDefinition;

/// Registry of process definitions keyed by process type
#[derive(Default)]
pub struct ProcessRegistry {
    definitions: DashMap<String, Arc<dyn ProcessDefinition>>,
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("definitions", &self.definitions.len())
            .finish()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition exactly once; re-registration is an error and
    /// the first registration is preserved.
    pub fn register(&self, definition: Arc<dyn ProcessDefinition>) -> ConductorResult<()> {
        let process_type = definition.process_type().to_string();
        match self.definitions.entry(process_type.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConductorError::DuplicateRegistration { process_type })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let steps = definition.graph().step_count();
                entry.insert(definition);
                info!(
                    process_type = %process_type,
                    steps = steps,
                    "Registered process definition"
                );
                Ok(())
            }
        }
    }

    /// Look up a definition by process type
    pub fn get(&self, process_type: &str) -> Option<Arc<dyn ProcessDefinition>> {
        self.definitions.get(process_type).map(|d| Arc::clone(&d))
    }

    /// Look up a definition or fail with `UnknownProcessType`
    pub fn require(&self, process_type: &str) -> ConductorResult<Arc<dyn ProcessDefinition>> {
        self.get(process_type)
            .ok_or_else(|| ConductorError::UnknownProcessType {
                process_type: process_type.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
