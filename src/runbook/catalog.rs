// SPDX-License-Identifier: MIT

//! Action catalog — read-only lookup of available actions
//!
//! Consulted by the editor API (to populate selection) and the validator
//! (to confirm references exist). The run coordinator never reads it:
//! parameters are already bound in the canonical steps.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::runbook::error::RunbookError;
use crate::runbook::workflow::types::ParamDef;

/// Declarative description of one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParamDef>,
}

/// Read-only action lookup
pub trait ActionCatalog: Send + Sync {
    fn get(&self, name: &str) -> Option<ActionSpec>;
    fn names(&self) -> Vec<String>;
}

/// Catalog backed by a directory of YAML action specs
pub struct FsCatalog {
    actions: RwLock<HashMap<String, ActionSpec>>,
}

impl FsCatalog {
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Load every `*.yaml`/`*.yml` spec in a directory. Files that fail
    /// to parse are skipped with a warning.
    pub fn load_dir<P: AsRef<Path>>(path: P) -> Result<Self, RunbookError> {
        let catalog = Self::new();
        let entries = fs::read_dir(path.as_ref())?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(content) => match serde_yaml::from_str::<ActionSpec>(&content) {
                    Ok(spec) => catalog.register(spec),
                    Err(e) => log::warn!("Skipping action spec {:?}: {}", path, e),
                },
                Err(e) => log::warn!("Failed to read action spec {:?}: {}", path, e),
            }
        }
        Ok(catalog)
    }

    pub fn register(&self, spec: ActionSpec) {
        let mut actions = self.actions.write().unwrap_or_else(|e| e.into_inner());
        actions.insert(spec.name.clone(), spec);
    }

    pub fn len(&self) -> usize {
        self.actions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FsCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionCatalog for FsCatalog {
    fn get(&self, name: &str) -> Option<ActionSpec> {
        self.actions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ActionSpec {
        ActionSpec {
            name: name.to_string(),
            label: name.to_string(),
            description: String::new(),
            parameters: Vec::new(),
        }
    }

    #[test]
    fn test_register_and_get() {
        let catalog = FsCatalog::new();
        catalog.register(spec("bigip-pool-status"));
        assert!(catalog.get("bigip-pool-status").is_some());
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn test_names_sorted() {
        let catalog = FsCatalog::new();
        catalog.register(spec("b"));
        catalog.register(spec("a"));
        assert_eq!(catalog.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_spec_yaml_parsing() {
        let yaml = r#"
name: bigip-node-toggle
label: Toggle Pool Member
description: Enable or disable a pool member
parameters:
  - name: node_name
    required: true
  - name: action
    required: true
"#;
        let spec: ActionSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.name, "bigip-node-toggle");
        assert_eq!(spec.parameters.len(), 2);
        assert!(spec.parameters[0].required);
    }
}
