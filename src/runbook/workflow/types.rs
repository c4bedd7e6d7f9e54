// SPDX-License-Identifier: MIT

//! Schema types for workflow definitions
//!
//! A workflow is persisted as a linear chain of canonical steps plus an
//! optional layout document that preserves the authoring graph verbatim.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::condition::Condition;
use super::graph::types::LayoutDoc;

/// Top-level workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Assigned at creation when absent from an authored document
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub steps: Vec<ChainStep>,
    /// Declared chain parameters, validated at invocation time
    #[serde(default)]
    pub parameters: Vec<ParamDef>,
    /// Opaque round-trip payload for the authoring graph
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// How a workflow is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Manual,
    Webhook,
    Alert,
}

/// One canonical step — the linear, execution-ready projection of a
/// graph node. The step list is what gets persisted and what the run
/// coordinator uses for ordering and counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    /// Assigned by normalization when absent
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub label: String,
    /// Catalog reference; empty for branch/macro steps
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Parameter overrides (literal or template); for macro steps these
    /// are the bindings passed as the child's chain parameters
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Secondary overlay applied after `parameters`
    #[serde(default)]
    pub parameter_map: HashMap<String, String>,
    #[serde(flatten)]
    pub target: TargetSpec,
    /// Branch conditions, evaluated left-to-right
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Nested workflow id for macro steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macro_ref: Option<String>,
}

/// Kind of a canonical step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    #[default]
    Action,
    Branch,
    Macro,
}

/// Whether a step needs operator approval before dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    #[default]
    Auto,
    Approve,
}

/// What to do when a step finishes in error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Stop,
    Skip,
}

/// How a step determines which external endpoint it acts upon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub target_source: TargetSource,
    /// Chain parameter name holding the target (source = parameter)
    #[serde(default = "default_target_param")]
    pub target_param: String,
    /// Fixed target value (source = fixed)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_fixed: String,
    /// Step id whose recorded target is reused (source = previous_step)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_from_step: String,
}

fn default_target_param() -> String {
    "device".to_string()
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            target_source: TargetSource::default(),
            target_param: default_target_param(),
            target_fixed: String::new(),
            target_from_step: String::new(),
        }
    }
}

/// Target resolution modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    #[default]
    Parameter,
    Fixed,
    PreviousStep,
}

/// A declared parameter — used both for a workflow's chain parameters
/// and for action specs in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Declared parameter types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Boolean,
    Device,
    Secret,
}

impl ChainStep {
    /// A fresh action step with defaults filled in
    pub fn action(id: impl Into<String>, action: impl Into<String>) -> Self {
        let action = action.into();
        Self {
            id: id.into(),
            kind: StepKind::Action,
            label: action.clone(),
            action,
            gate: Gate::Auto,
            on_failure: FailurePolicy::Stop,
            parameters: HashMap::new(),
            parameter_map: HashMap::new(),
            target: TargetSpec::default(),
            conditions: Vec::new(),
            macro_ref: None,
        }
    }

    /// Display label, falling back to the action reference or id
    pub fn display_label(&self) -> &str {
        if !self.label.is_empty() {
            &self.label
        } else if !self.action.is_empty() {
            &self.action
        } else {
            &self.id
        }
    }
}

/// Assign step ids and default labels in place. Steps authored by hand
/// (YAML files, raw API payloads) may omit both.
pub fn normalize_steps(steps: &mut [ChainStep]) {
    for (i, step) in steps.iter_mut().enumerate() {
        if step.id.is_empty() {
            step.id = format!("step-{}", i + 1);
        }
        if step.label.is_empty() {
            step.label = match step.kind {
                StepKind::Action => step.action.clone(),
                StepKind::Branch => "Branch".to_string(),
                StepKind::Macro => step.macro_ref.clone().unwrap_or_default(),
            };
        }
    }
}

/// Workflow summary returned by list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub trigger: Trigger,
    pub step_count: usize,
    pub parameter_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl WorkflowSummary {
    pub fn of(def: &WorkflowDef) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            tags: def.tags.clone(),
            trigger: def.trigger,
            step_count: def.steps.len(),
            parameter_count: def.parameters.len(),
            created_at: def.created_at.clone(),
            updated_at: def.updated_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_defaults_from_json() {
        let step: ChainStep = serde_json::from_str(r#"{"id": "s1", "action": "bigip-pool-status"}"#)
            .unwrap();
        assert_eq!(step.kind, StepKind::Action);
        assert_eq!(step.gate, Gate::Auto);
        assert_eq!(step.on_failure, FailurePolicy::Stop);
        assert_eq!(step.target.target_source, TargetSource::Parameter);
        assert_eq!(step.target.target_param, "device");
    }

    #[test]
    fn test_normalize_assigns_ids_and_labels() {
        let mut steps = vec![
            ChainStep {
                id: String::new(),
                label: String::new(),
                ..ChainStep::action("", "check-pool")
            },
            ChainStep {
                id: String::new(),
                label: String::new(),
                kind: StepKind::Branch,
                ..ChainStep::action("", "")
            },
        ];
        normalize_steps(&mut steps);
        assert_eq!(steps[0].id, "step-1");
        assert_eq!(steps[0].label, "check-pool");
        assert_eq!(steps[1].id, "step-2");
        assert_eq!(steps[1].label, "Branch");
    }

    #[test]
    fn test_step_round_trips_through_json() {
        let mut step = ChainStep::action("s1", "bigip-vs-config");
        step.gate = Gate::Approve;
        step.on_failure = FailurePolicy::Skip;
        step.parameters
            .insert("virtual_server".to_string(), "{{chain.vs}}".to_string());
        step.target.target_source = TargetSource::Fixed;
        step.target.target_fixed = "bigip01".to_string();

        let json = serde_json::to_string(&step).unwrap();
        let back: ChainStep = serde_json::from_str(&json).unwrap();
        assert_eq!(step, back);
    }

    #[test]
    fn test_workflow_def_minimal_json() {
        let def: WorkflowDef = serde_json::from_str(
            r#"{"id": "wf-1", "name": "Troubleshoot", "steps": [{"id": "s1", "action": "x"}]}"#,
        )
        .unwrap();
        assert_eq!(def.trigger, Trigger::Manual);
        assert!(def.layout.is_none());
        assert_eq!(def.steps.len(), 1);
    }

    #[test]
    fn test_param_def_type_parsing() {
        let p: ParamDef =
            serde_json::from_str(r#"{"name": "device", "type": "device", "required": true}"#)
                .unwrap();
        assert_eq!(p.param_type, ParamType::Device);
        assert!(p.required);
    }

    #[test]
    fn test_display_label_fallbacks() {
        let mut step = ChainStep::action("s9", "check");
        step.label = String::new();
        assert_eq!(step.display_label(), "check");
        step.action = String::new();
        assert_eq!(step.display_label(), "s9");
    }
}
