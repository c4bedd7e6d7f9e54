// SPDX-License-Identifier: MIT

//! Run records and run events
//!
//! A `Run` is one execution instance of a workflow's canonical steps.
//! It is created at invocation time, mutated only by the coordinator,
//! persisted on every transition, and immutable once terminal. Graph
//! edits after a run starts never affect it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runbook::workflow::graph::types::LayoutDoc;
use crate::runbook::workflow::template::RunContext;
use crate::runbook::workflow::types::{ChainStep, ParamDef};

/// Run lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    WaitingApproval,
    Complete,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of one executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Complete,
    Failed,
}

/// Recorded result of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub label: String,
    pub status: StepStatus,
    /// First 500 chars of the raw output
    #[serde(default)]
    pub output_preview: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal template resolution warnings recorded for this step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Snapshot of the workflow's execution plan taken when the run is
/// created. Later edits to the source workflow never touch it, and a
/// rehydrated run can resume without consulting the definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunPlan {
    #[serde(default)]
    pub steps: Vec<ChainStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutDoc>,
    #[serde(default)]
    pub parameters: Vec<ParamDef>,
}

/// One execution instance of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: String,
    pub status: RunStatus,
    /// 1-based index of the most recently entered step
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    /// Caller-supplied values, kept verbatim for display
    #[serde(default)]
    pub chain_params: Map<String, Value>,
    /// Accumulated resolution context (chain + step outputs + injected)
    #[serde(default)]
    pub context: RunContext,
    /// Immutable plan snapshot the coordinator walks
    #[serde(default)]
    pub plan: RunPlan,
    /// Node id of the gated step awaiting approval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_step: Option<String>,
    /// Failure/rejection reason for terminal states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Summary shape for run listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl RunSummary {
    pub fn of(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            workflow_name: run.workflow_name.clone(),
            status: run.status,
            current_step: run.current_step,
            total_steps: run.total_steps,
            started_at: run.started_at.clone(),
            completed_at: run.completed_at.clone(),
        }
    }
}

/// Operator decision delivered to a waiting run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeAction {
    Approve,
    Reject,
}

/// Ordered progress events emitted while a run executes. Events for
/// step K are always delivered before any event of step K+1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        workflow_id: String,
    },
    StepStarted {
        step_id: String,
        label: String,
        index: usize,
    },
    StepProgress {
        step_id: String,
        data: String,
    },
    StepFinished {
        step_id: String,
        status: StepStatus,
    },
    ApprovalRequired {
        step_id: String,
        label: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
    },
    Error {
        message: String,
    },
}
