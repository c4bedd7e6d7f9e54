// SPDX-License-Identifier: MIT

//! Graph model for the workflow authoring surface
//!
//! Nodes carry a tagged attribute union so the serializer and run
//! coordinator get compile-time exhaustiveness over the node kinds.
//! Positions are advisory layout data and never load-bearing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::runbook::workflow::condition::Condition;
use crate::runbook::workflow::types::{FailurePolicy, Gate, TargetSpec};

/// Advisory 2D coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One vertex of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub position: Position,
}

/// Kind-specific attribute bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Action(ActionAttrs),
    Branch(BranchAttrs),
    Terminal(TerminalAttrs),
    Macro(MacroAttrs),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAttrs {
    /// Catalog reference
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub parameter_map: HashMap<String, String>,
    #[serde(flatten)]
    pub target: TargetSpec,
}

impl Default for ActionAttrs {
    fn default() -> Self {
        Self {
            action: String::new(),
            label: String::new(),
            gate: Gate::Auto,
            on_failure: FailurePolicy::Stop,
            parameters: HashMap::new(),
            parameter_map: HashMap::new(),
            target: TargetSpec::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BranchAttrs {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalAttrs {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub outcome: Outcome,
    /// Webhook target URL (outcome = webhook)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Operator-facing text for alert/deny outcomes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl TerminalAttrs {
    pub fn of(outcome: Outcome) -> Self {
        Self {
            label: String::new(),
            outcome,
            url: String::new(),
            message: String::new(),
        }
    }
}

impl Default for TerminalAttrs {
    fn default() -> Self {
        Self::of(Outcome::Allow)
    }
}

/// Terminal outcome classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Allow,
    Deny,
    Alert,
    Webhook,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MacroAttrs {
    #[serde(default)]
    pub label: String,
    /// Nested workflow id
    pub workflow: String,
    /// Parameter bindings resolved in the parent context and handed to
    /// the child as its chain parameters
    #[serde(default)]
    pub bindings: HashMap<String, String>,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

/// One directed connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub port: Port,
}

/// Out-ports. `success`/`failure` apply to start, action and macro
/// nodes; `true`/`false` to branch nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Port {
    Success,
    Failure,
    True,
    False,
}

/// The in-memory graph: nodes plus directed edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Opaque round-trip payload persisted next to the canonical steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LayoutDoc {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl LayoutDoc {
    /// A layout is usable for reconstruction when it carries nodes and
    /// one of them is a start node
    pub fn is_well_formed(&self) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().any(|n| matches!(n.kind, NodeKind::Start))
    }
}

/// Short unique id with a readable prefix, e.g. `act-9f3c21ab`
pub fn new_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &uuid[..8])
}

impl Node {
    /// A fresh node with a generated id
    pub fn new(kind: NodeKind, position: Position) -> Self {
        let prefix = match kind {
            NodeKind::Start => "start",
            NodeKind::Action(_) => "act",
            NodeKind::Branch(_) => "branch",
            NodeKind::Terminal(_) => "end",
            NodeKind::Macro(_) => "macro",
        };
        Self {
            id: new_id(prefix),
            kind,
            position,
        }
    }

    pub fn with_id(id: impl Into<String>, kind: NodeKind, position: Position) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// The unique start node, if present
    pub fn start(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// The single edge leaving `from` on `port`, if any. When the graph
    /// is transiently invalid and carries duplicates, the first by
    /// insertion order is returned; the validator reports the duplicate.
    pub fn edge_from(&self, from: &str, port: Port) -> Option<&Edge> {
        self.edges.iter().find(|e| e.from == from && e.port == port)
    }

    pub fn edges_from<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from == from)
    }

    pub fn edges_to<'a>(&'a self, to: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.to == to)
    }

    pub fn out_degree(&self, id: &str) -> usize {
        self.edges_from(id).count()
    }

    /// Number of edges touching a node in either direction
    pub fn incident_count(&self, id: &str) -> usize {
        self.edges
            .iter()
            .filter(|e| e.from == id || e.to == id)
            .count()
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != id);
        if self.nodes.len() == before {
            return false;
        }
        self.edges.retain(|e| e.from != id && e.to != id);
        true
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    pub fn remove_edge(&mut self, id: &str) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| e.id != id);
        self.edges.len() != before
    }
}
