// SPDX-License-Identifier: MIT

//! Structural validation of authoring graphs
//!
//! Returns every problem at once (a list, never an error) so the editor
//! can display them together. Runs before save — the editor may hold a
//! transiently invalid graph in between.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use url::Url;

use super::serializer::linearize;
use super::types::{Graph, Node, NodeKind, Outcome, Port};
use crate::runbook::catalog::ActionCatalog;
use crate::runbook::workflow::template::step_refs;
use crate::runbook::workflow::types::{ChainStep, Gate};

/// One structural problem found in a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ValidationIssue {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            node_id: None,
        }
    }

    fn at(code: &str, node_id: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            node_id: Some(node_id.to_string()),
        }
    }
}

/// Validate a named graph. Checks are independent; all failures are
/// collected. When a catalog is supplied, action references are also
/// checked for existence.
pub fn validate(
    name: &str,
    graph: &Graph,
    catalog: Option<&dyn ActionCatalog>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if name.trim().is_empty() {
        issues.push(ValidationIssue::new("empty-name", "Workflow name is required"));
    }

    check_start(graph, &mut issues);
    check_actions(graph, catalog, &mut issues);
    check_ports(graph, &mut issues);
    check_branches(graph, &mut issues);
    check_terminals(graph, &mut issues);
    check_connectivity(graph, &mut issues);
    check_step_references(graph, &mut issues);

    issues
}

fn check_start(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let starts: Vec<&Node> = graph
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .collect();
    match starts.len() {
        0 => issues.push(ValidationIssue::new(
            "missing-start",
            "Graph has no start node",
        )),
        1 => {
            let start = starts[0];
            let success_edges = graph
                .edges_from(&start.id)
                .filter(|e| e.port == Port::Success)
                .count();
            if success_edges != 1 {
                issues.push(ValidationIssue::at(
                    "start-wiring",
                    &start.id,
                    format!(
                        "Start node must have exactly one success edge, found {}",
                        success_edges
                    ),
                ));
            }
        }
        n => issues.push(ValidationIssue::new(
            "multiple-start",
            format!("Graph has {} start nodes, expected exactly one", n),
        )),
    }
}

fn check_actions(
    graph: &Graph,
    catalog: Option<&dyn ActionCatalog>,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut action_count = 0;
    for node in &graph.nodes {
        if let NodeKind::Action(attrs) = &node.kind {
            action_count += 1;
            if attrs.action.trim().is_empty() {
                issues.push(ValidationIssue::at(
                    "missing-action-ref",
                    &node.id,
                    "Action node has no action reference",
                ));
            } else if let Some(catalog) = catalog {
                if catalog.get(&attrs.action).is_none() {
                    issues.push(ValidationIssue::at(
                        "unknown-action",
                        &node.id,
                        format!("Action '{}' is not in the catalog", attrs.action),
                    ));
                }
            }
        }
    }
    if action_count == 0 {
        issues.push(ValidationIssue::new(
            "no-action",
            "Workflow needs at least one action node",
        ));
    }
}

fn legal_ports(kind: &NodeKind) -> &'static [Port] {
    match kind {
        NodeKind::Start => &[Port::Success],
        NodeKind::Action(_) | NodeKind::Macro(_) => &[Port::Success, Port::Failure],
        NodeKind::Branch(_) => &[Port::True, Port::False],
        NodeKind::Terminal(_) => &[],
    }
}

fn check_ports(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let mut seen: HashSet<(&str, Port)> = HashSet::new();
    for edge in &graph.edges {
        let Some(from) = graph.node(&edge.from) else {
            issues.push(ValidationIssue::new(
                "dangling-edge",
                format!("Edge {} leaves unknown node {}", edge.id, edge.from),
            ));
            continue;
        };
        if graph.node(&edge.to).is_none() {
            issues.push(ValidationIssue::new(
                "dangling-edge",
                format!("Edge {} targets unknown node {}", edge.id, edge.to),
            ));
            continue;
        }
        if !legal_ports(&from.kind).contains(&edge.port) {
            issues.push(ValidationIssue::at(
                "invalid-port",
                &from.id,
                format!("Edge {} uses a port this node kind does not expose", edge.id),
            ));
        }
        if !seen.insert((edge.from.as_str(), edge.port)) {
            issues.push(ValidationIssue::at(
                "duplicate-port",
                &from.id,
                format!(
                    "Multiple edges leave node {} on the same port; exactly one is permitted",
                    edge.from
                ),
            ));
        }
    }
}

fn check_branches(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    for node in &graph.nodes {
        if let NodeKind::Branch(attrs) = &node.kind {
            if attrs.conditions.is_empty() {
                issues.push(ValidationIssue::at(
                    "branch-no-conditions",
                    &node.id,
                    "Branch node must declare at least one condition",
                ));
            }
        }
    }
}

fn check_terminals(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    for node in &graph.nodes {
        if let NodeKind::Terminal(attrs) = &node.kind {
            if graph.out_degree(&node.id) > 0 {
                issues.push(ValidationIssue::at(
                    "terminal-out-edge",
                    &node.id,
                    "Terminal nodes cannot have outgoing edges",
                ));
            }
            if attrs.outcome == Outcome::Webhook {
                if attrs.url.trim().is_empty() {
                    issues.push(ValidationIssue::at(
                        "webhook-missing-url",
                        &node.id,
                        "Webhook terminal needs a target URL",
                    ));
                } else if Url::parse(&attrs.url).is_err() {
                    issues.push(ValidationIssue::at(
                        "webhook-bad-url",
                        &node.id,
                        format!("Webhook URL '{}' does not parse", attrs.url),
                    ));
                }
            }
        }
    }
}

fn check_connectivity(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let Some(start) = graph.start() else {
        // no start: already reported, reachability is meaningless
        return;
    };

    let mut reachable: HashSet<&str> = HashSet::new();
    let mut stack = vec![start.id.as_str()];
    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        for edge in graph.edges_from(id) {
            stack.push(edge.to.as_str());
        }
    }

    for node in &graph.nodes {
        if matches!(node.kind, NodeKind::Start) {
            continue;
        }
        if graph.incident_count(&node.id) == 0 {
            issues.push(ValidationIssue::at(
                "orphan",
                &node.id,
                "Node has no incident edges",
            ));
        } else if !reachable.contains(node.id.as_str()) {
            issues.push(ValidationIssue::at(
                "unreachable",
                &node.id,
                "Node is not reachable from start",
            ));
        }
    }
}

/// Execution-time safety net: every `{{steps.X...}}` reference must name
/// a step that appears earlier in the canonical order.
fn check_step_references(graph: &Graph, issues: &mut Vec<ValidationIssue>) {
    let (steps, _) = linearize(graph);
    let mut earlier: HashSet<&str> = HashSet::new();
    for step in &steps {
        for template in step_templates(step) {
            for referenced in step_refs(template) {
                if !earlier.contains(referenced.as_str()) {
                    issues.push(ValidationIssue::at(
                        "forward-reference",
                        &step.id,
                        format!(
                            "Step '{}' references output of step '{}' which does not run earlier",
                            step.id, referenced
                        ),
                    ));
                }
            }
        }
        earlier.insert(step.id.as_str());
    }
}

fn step_templates(step: &ChainStep) -> impl Iterator<Item = &str> {
    step.parameters
        .values()
        .chain(step.parameter_map.values())
        .map(String::as_str)
        .chain(
            step.conditions
                .iter()
                .flat_map(|c| [c.source.as_str(), c.value.as_str()]),
        )
}

/// Save-time check on macro references: the referenced workflow must
/// exist and must not itself contain approval gates (a paused child run
/// cannot be resumed through its parent). `lookup` resolves a workflow
/// id to its steps.
pub fn validate_macro_refs<F>(steps: &[ChainStep], lookup: F) -> Vec<ValidationIssue>
where
    F: Fn(&str) -> Option<Vec<ChainStep>>,
{
    let mut issues = Vec::new();
    for step in steps {
        let Some(workflow_id) = step.macro_ref.as_deref() else {
            continue;
        };
        match lookup(workflow_id) {
            None => issues.push(ValidationIssue::at(
                "unknown-macro",
                &step.id,
                format!("Referenced workflow '{}' does not exist", workflow_id),
            )),
            Some(child_steps) => {
                if child_steps.iter().any(|s| s.gate == Gate::Approve) {
                    issues.push(ValidationIssue::at(
                        "macro-gate",
                        &step.id,
                        format!(
                            "Workflow '{}' contains approval gates and cannot be invoked as a macro",
                            workflow_id
                        ),
                    ));
                }
            }
        }
    }
    issues
}
