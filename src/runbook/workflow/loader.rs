//! Workflow loader - YAML file loading and parsing
//!
//! Operator-authored workflow files are YAML documents with the same
//! shape as the persisted JSON definitions; ids and step defaults are
//! filled in after parsing.

use std::fs;
use std::path::Path;

use super::types::{normalize_steps, WorkflowDef};
use crate::runbook::error::RunbookError;
use crate::runbook::workflow::graph::types::new_id;

/// Loads workflow definitions from YAML files
pub struct WorkflowLoader;

impl WorkflowLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a workflow definition from a YAML file
    pub fn load_workflow<P: AsRef<Path>>(&self, path: P) -> Result<WorkflowDef, RunbookError> {
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// Parse a workflow definition from a YAML string
    pub fn parse_yaml(content: &str) -> Result<WorkflowDef, RunbookError> {
        let mut def: WorkflowDef = serde_yaml::from_str(content)?;
        if def.id.is_empty() {
            def.id = new_id("wf");
        }
        normalize_steps(&mut def.steps);
        Ok(def)
    }
}

impl Default for WorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}
