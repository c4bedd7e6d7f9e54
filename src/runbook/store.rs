// SPDX-License-Identifier: MIT

//! Workflow and run persistence
//!
//! `FsStore` keeps JSON documents on disk (one file per workflow, one
//! per run, plus a JSON-lines event log per run). `MemoryStore` backs
//! tests. The coordinator persists the run on every state transition so
//! a waiting run survives a process restart.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::runbook::error::RunbookError;
use crate::runbook::run::types::{Run, RunEvent, RunSummary};
use crate::runbook::workflow::types::{WorkflowDef, WorkflowSummary};

/// Persistence boundary for workflow definitions and runs
pub trait Store: Send + Sync {
    fn save_workflow(&self, def: &WorkflowDef) -> Result<(), RunbookError>;
    fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDef>, RunbookError>;
    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, RunbookError>;
    fn delete_workflow(&self, id: &str) -> Result<bool, RunbookError>;

    fn save_run(&self, run: &Run) -> Result<(), RunbookError>;
    fn load_run(&self, id: &str) -> Result<Option<Run>, RunbookError>;
    /// Newest first, optionally filtered by workflow
    fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, RunbookError>;
    fn append_run_progress(&self, run_id: &str, event: &RunEvent) -> Result<(), RunbookError>;
}

/// JSON-file store under a data directory
pub struct FsStore {
    workflows_dir: PathBuf,
    runs_dir: PathBuf,
}

impl FsStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, RunbookError> {
        let workflows_dir = data_dir.as_ref().join("workflows");
        let runs_dir = data_dir.as_ref().join("runs");
        fs::create_dir_all(&workflows_dir)?;
        fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            workflows_dir,
            runs_dir,
        })
    }

    fn workflow_path(&self, id: &str) -> PathBuf {
        self.workflows_dir.join(format!("{}.json", id))
    }

    fn run_path(&self, id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.json", id))
    }

    fn events_path(&self, id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.events.jsonl", id))
    }
}

impl Store for FsStore {
    fn save_workflow(&self, def: &WorkflowDef) -> Result<(), RunbookError> {
        let json = serde_json::to_string_pretty(def)?;
        fs::write(self.workflow_path(&def.id), json)?;
        Ok(())
    }

    fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDef>, RunbookError> {
        let path = self.workflow_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, RunbookError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.workflows_dir)?.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(RunbookError::from)
                .and_then(|c| serde_json::from_str::<WorkflowDef>(&c).map_err(RunbookError::from))
            {
                Ok(def) => summaries.push(WorkflowSummary::of(&def)),
                Err(e) => log::warn!("Failed to parse workflow {:?}: {}", path, e),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    fn delete_workflow(&self, id: &str) -> Result<bool, RunbookError> {
        let path = self.workflow_path(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    fn save_run(&self, run: &Run) -> Result<(), RunbookError> {
        let json = serde_json::to_string_pretty(run)?;
        fs::write(self.run_path(&run.id), json)?;
        Ok(())
    }

    fn load_run(&self, id: &str) -> Result<Option<Run>, RunbookError> {
        let path = self.run_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, RunbookError> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)?.flatten() {
            let path = entry.path();
            // event logs end in .jsonl and are skipped here
            let is_run_doc = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json"));
            if !is_run_doc {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(RunbookError::from)
                .and_then(|c| serde_json::from_str::<Run>(&c).map_err(RunbookError::from))
            {
                Ok(run) => {
                    if workflow_id.is_none_or(|id| id == run.workflow_id) {
                        runs.push(RunSummary::of(&run));
                    }
                }
                Err(e) => log::warn!("Failed to parse run {:?}: {}", path, e),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn append_run_progress(&self, run_id: &str, event: &RunEvent) -> Result<(), RunbookError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(run_id))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral CLI runs
#[derive(Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<String, WorkflowDef>>,
    runs: Mutex<HashMap<String, Run>>,
    events: Mutex<HashMap<String, Vec<RunEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded progress events for a run (test observability)
    pub fn events_for(&self, run_id: &str) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Store for MemoryStore {
    fn save_workflow(&self, def: &WorkflowDef) -> Result<(), RunbookError> {
        self.workflows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(def.id.clone(), def.clone());
        Ok(())
    }

    fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDef>, RunbookError> {
        Ok(self
            .workflows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, RunbookError> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(WorkflowSummary::of)
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    fn delete_workflow(&self, id: &str) -> Result<bool, RunbookError> {
        Ok(self
            .workflows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some())
    }

    fn save_run(&self, run: &Run) -> Result<(), RunbookError> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn load_run(&self, id: &str) -> Result<Option<Run>, RunbookError> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    fn list_runs(
        &self,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, RunbookError> {
        let mut runs: Vec<RunSummary> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| workflow_id.is_none_or(|id| id == r.workflow_id))
            .map(RunSummary::of)
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn append_run_progress(&self, run_id: &str, event: &RunEvent) -> Result<(), RunbookError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(run_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }
}
