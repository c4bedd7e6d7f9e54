// SPDX-License-Identifier: MIT

//! Graph ⇄ canonical-step serialization
//!
//! `linearize` projects the authoring graph onto the linear execution
//! plan plus an opaque layout document; `reconstruct` is its inverse.
//! Together they satisfy the round-trip law
//! `linearize(reconstruct(steps, None)).steps == steps`.

use std::collections::HashSet;

use super::types::{
    ActionAttrs, BranchAttrs, Edge, Graph, LayoutDoc, MacroAttrs, Node, NodeKind, Outcome,
    Port, Position, TerminalAttrs,
};
use crate::runbook::workflow::types::{ChainStep, FailurePolicy, StepKind, TargetSpec};

const X_START: f64 = 40.0;
const X_SPACING: f64 = 220.0;
const Y_MAIN: f64 = 120.0;
const Y_FAILURE: f64 = 280.0;

/// Walk the graph from the start node along the success/true chain and
/// project every action/branch/macro visited into a canonical step.
/// Failure edges are noted but never walked — the run coordinator takes
/// `on_failure` from the step itself, not from topology. Traversal stops
/// at the first terminal or when a node repeats (a cycle, which the
/// linear plan cannot represent).
pub fn linearize(graph: &Graph) -> (Vec<ChainStep>, LayoutDoc) {
    let layout = LayoutDoc {
        nodes: graph.nodes.clone(),
        edges: graph.edges.clone(),
    };
    let mut steps = Vec::new();

    let Some(start) = graph.start() else {
        return (steps, layout);
    };
    let mut current = match graph.edge_from(&start.id, Port::Success) {
        Some(edge) => edge.to.clone(),
        None => return (steps, layout),
    };

    let mut visited: HashSet<String> = HashSet::new();
    loop {
        if !visited.insert(current.clone()) {
            log::debug!("cycle at node {}, ending linear chain", current);
            break;
        }
        let Some(node) = graph.node(&current) else {
            break;
        };
        let next_port = match &node.kind {
            NodeKind::Terminal(_) => break,
            NodeKind::Start => Port::Success,
            NodeKind::Action(attrs) => {
                if graph.edge_from(&node.id, Port::Failure).is_some() {
                    log::debug!("step {} has a failed-path terminal", node.id);
                }
                steps.push(project_action(node, attrs));
                Port::Success
            }
            NodeKind::Branch(attrs) => {
                steps.push(project_branch(node, attrs));
                Port::True
            }
            NodeKind::Macro(attrs) => {
                steps.push(project_macro(node, attrs));
                Port::Success
            }
        };
        match graph.edge_from(&current, next_port) {
            Some(edge) => current = edge.to.clone(),
            None => break,
        }
    }

    (steps, layout)
}

/// Rebuild a graph from a step list. A well-formed layout wins verbatim
/// (it preserves authored positions and any failure wiring the flat
/// steps cannot express). Without one — workflows authored before a
/// graph existed, or hand-written step lists — a graph is synthesized:
/// start, one node per step left-to-right, an `allow` terminal at the
/// end, and a `deny` terminal on the failure port of every stop-policy
/// step. Lossy in position, never in semantics.
pub fn reconstruct(steps: &[ChainStep], layout: Option<&LayoutDoc>) -> Graph {
    if let Some(layout) = layout {
        if layout.is_well_formed() {
            return Graph {
                nodes: layout.nodes.clone(),
                edges: layout.edges.clone(),
            };
        }
    }
    synthesize(steps)
}

fn synthesize(steps: &[ChainStep]) -> Graph {
    let mut graph = Graph::new();
    let mut edge_seq = 0usize;

    graph.add_node(Node::with_id(
        "start",
        NodeKind::Start,
        Position::new(X_START, Y_MAIN),
    ));

    let mut prev: (String, Port) = ("start".to_string(), Port::Success);
    for (i, step) in steps.iter().enumerate() {
        let x = X_START + X_SPACING * (i as f64 + 1.0);
        let kind = node_kind_of(step);
        let next_port = match kind {
            NodeKind::Branch(_) => Port::True,
            _ => Port::Success,
        };
        graph.add_node(Node::with_id(&step.id, kind, Position::new(x, Y_MAIN)));
        push_edge(&mut graph, &mut edge_seq, &prev.0, prev.1, &step.id);

        if step.kind != StepKind::Branch && step.on_failure == FailurePolicy::Stop {
            let deny_id = format!("deny-{}", step.id);
            graph.add_node(Node::with_id(
                &deny_id,
                NodeKind::Terminal(TerminalAttrs::of(Outcome::Deny)),
                Position::new(x, Y_FAILURE),
            ));
            push_edge(&mut graph, &mut edge_seq, &step.id, Port::Failure, &deny_id);
        }

        prev = (step.id.clone(), next_port);
    }

    let end_x = X_START + X_SPACING * (steps.len() as f64 + 1.0);
    graph.add_node(Node::with_id(
        "end",
        NodeKind::Terminal(TerminalAttrs::of(Outcome::Allow)),
        Position::new(end_x, Y_MAIN),
    ));
    push_edge(&mut graph, &mut edge_seq, &prev.0, prev.1, "end");

    graph
}

fn push_edge(graph: &mut Graph, seq: &mut usize, from: &str, port: Port, to: &str) {
    *seq += 1;
    graph.add_edge(Edge {
        id: format!("e-{}", seq),
        from: from.to_string(),
        to: to.to_string(),
        port,
    });
}

fn project_action(node: &Node, attrs: &ActionAttrs) -> ChainStep {
    ChainStep {
        id: node.id.clone(),
        kind: StepKind::Action,
        label: attrs.label.clone(),
        action: attrs.action.clone(),
        gate: attrs.gate,
        on_failure: attrs.on_failure,
        parameters: attrs.parameters.clone(),
        parameter_map: attrs.parameter_map.clone(),
        target: attrs.target.clone(),
        conditions: Vec::new(),
        macro_ref: None,
    }
}

fn project_branch(node: &Node, attrs: &BranchAttrs) -> ChainStep {
    ChainStep {
        id: node.id.clone(),
        kind: StepKind::Branch,
        label: attrs.label.clone(),
        conditions: attrs.conditions.clone(),
        ..ChainStep::action(node.id.clone(), "")
    }
}

fn project_macro(node: &Node, attrs: &MacroAttrs) -> ChainStep {
    ChainStep {
        id: node.id.clone(),
        kind: StepKind::Macro,
        label: attrs.label.clone(),
        action: String::new(),
        gate: attrs.gate,
        on_failure: attrs.on_failure,
        parameters: attrs.bindings.clone(),
        parameter_map: Default::default(),
        target: TargetSpec::default(),
        conditions: Vec::new(),
        macro_ref: Some(attrs.workflow.clone()),
    }
}

fn node_kind_of(step: &ChainStep) -> NodeKind {
    match step.kind {
        StepKind::Action => NodeKind::Action(ActionAttrs {
            action: step.action.clone(),
            label: step.label.clone(),
            gate: step.gate,
            on_failure: step.on_failure,
            parameters: step.parameters.clone(),
            parameter_map: step.parameter_map.clone(),
            target: step.target.clone(),
        }),
        StepKind::Branch => NodeKind::Branch(BranchAttrs {
            label: step.label.clone(),
            conditions: step.conditions.clone(),
        }),
        StepKind::Macro => NodeKind::Macro(MacroAttrs {
            label: step.label.clone(),
            workflow: step.macro_ref.clone().unwrap_or_default(),
            bindings: step.parameters.clone(),
            gate: step.gate,
            on_failure: step.on_failure,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runbook::workflow::condition::{CompareOp, Condition};
    use crate::runbook::workflow::types::{Gate, TargetSource};

    fn edge(id: &str, from: &str, port: Port, to: &str) -> Edge {
        Edge {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            port,
        }
    }

    fn sample_graph() -> Graph {
        let mut g = Graph::new();
        g.add_node(Node::with_id("start", NodeKind::Start, Position::default()));
        g.add_node(Node::with_id(
            "s1",
            NodeKind::Action(ActionAttrs {
                action: "bigip-pool-status".to_string(),
                label: "Check Pool".to_string(),
                ..ActionAttrs::default()
            }),
            Position::default(),
        ));
        g.add_node(Node::with_id(
            "b1",
            NodeKind::Branch(BranchAttrs {
                label: "Healthy?".to_string(),
                conditions: vec![Condition::new(
                    "{{steps.s1.output.members_up}}",
                    CompareOp::Gt,
                    "0",
                )],
            }),
            Position::default(),
        ));
        g.add_node(Node::with_id(
            "s2",
            NodeKind::Action(ActionAttrs {
                action: "bigip-node-toggle".to_string(),
                gate: Gate::Approve,
                ..ActionAttrs::default()
            }),
            Position::default(),
        ));
        g.add_node(Node::with_id(
            "ok",
            NodeKind::Terminal(TerminalAttrs::of(Outcome::Allow)),
            Position::default(),
        ));
        g.add_node(Node::with_id(
            "bad",
            NodeKind::Terminal(TerminalAttrs::of(Outcome::Deny)),
            Position::default(),
        ));
        g.add_edge(edge("e1", "start", Port::Success, "s1"));
        g.add_edge(edge("e2", "s1", Port::Success, "b1"));
        g.add_edge(edge("e3", "b1", Port::True, "s2"));
        g.add_edge(edge("e4", "b1", Port::False, "bad"));
        g.add_edge(edge("e5", "s2", Port::Success, "ok"));
        g.add_edge(edge("e6", "s2", Port::Failure, "bad"));
        g
    }

    #[test]
    fn test_linearize_follows_success_and_true_chain() {
        let (steps, layout) = linearize(&sample_graph());
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "b1", "s2"]);
        assert_eq!(steps[1].kind, StepKind::Branch);
        assert_eq!(steps[1].conditions.len(), 1);
        assert_eq!(steps[2].gate, Gate::Approve);
        // layout carries the full graph verbatim
        assert_eq!(layout.nodes.len(), 6);
        assert_eq!(layout.edges.len(), 6);
    }

    #[test]
    fn test_linearize_does_not_walk_failure_edges() {
        let (steps, _) = linearize(&sample_graph());
        // the deny terminal reached via failure/false ports contributes
        // no step
        assert!(steps.iter().all(|s| s.id != "bad"));
    }

    #[test]
    fn test_linearize_stops_on_cycle() {
        let mut g = Graph::new();
        g.add_node(Node::with_id("start", NodeKind::Start, Position::default()));
        g.add_node(Node::with_id(
            "a",
            NodeKind::Action(ActionAttrs {
                action: "x".to_string(),
                ..ActionAttrs::default()
            }),
            Position::default(),
        ));
        g.add_node(Node::with_id(
            "b",
            NodeKind::Action(ActionAttrs {
                action: "y".to_string(),
                ..ActionAttrs::default()
            }),
            Position::default(),
        ));
        g.add_edge(edge("e1", "start", Port::Success, "a"));
        g.add_edge(edge("e2", "a", Port::Success, "b"));
        g.add_edge(edge("e3", "b", Port::Success, "a"));

        let (steps, _) = linearize(&g);
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_linearize_without_start_is_empty() {
        let (steps, _) = linearize(&Graph::new());
        assert!(steps.is_empty());
    }

    #[test]
    fn test_reconstruct_prefers_layout_verbatim() {
        let g = sample_graph();
        let (steps, layout) = linearize(&g);
        let back = reconstruct(&steps, Some(&layout));
        assert_eq!(back, g);
    }

    #[test]
    fn test_reconstruct_ignores_malformed_layout() {
        let steps = vec![ChainStep::action("s1", "check")];
        let empty = LayoutDoc::default();
        let g = reconstruct(&steps, Some(&empty));
        assert!(g.start().is_some());
        assert!(g.node("s1").is_some());
    }

    #[test]
    fn test_synthesized_graph_shape() {
        let mut stop = ChainStep::action("s1", "provision");
        stop.on_failure = FailurePolicy::Stop;
        let mut skip = ChainStep::action("s2", "verify");
        skip.on_failure = FailurePolicy::Skip;

        let g = reconstruct(&[stop, skip], None);

        assert!(g.start().is_some());
        // start, s1, deny-s1, s2, end
        assert_eq!(g.nodes.len(), 5);
        assert!(matches!(
            g.node("deny-s1").unwrap().kind,
            NodeKind::Terminal(TerminalAttrs {
                outcome: Outcome::Deny,
                ..
            })
        ));
        assert_eq!(g.edge_from("s1", Port::Failure).unwrap().to, "deny-s1");
        assert!(g.edge_from("s2", Port::Failure).is_none());
        assert!(matches!(
            g.node("end").unwrap().kind,
            NodeKind::Terminal(TerminalAttrs {
                outcome: Outcome::Allow,
                ..
            })
        ));
        // positions march left to right
        assert!(g.node("s2").unwrap().position.x > g.node("s1").unwrap().position.x);
    }

    #[test]
    fn test_round_trip_law() {
        let mut s1 = ChainStep::action("s1", "bigip-ve-provision");
        s1.parameters
            .insert("cluster_id".to_string(), "{{chain.cluster_id}}".to_string());
        s1.target.target_source = TargetSource::Fixed;
        s1.target.target_fixed = "proxmox01".to_string();

        let b1 = ChainStep {
            id: "b1".to_string(),
            kind: StepKind::Branch,
            label: "Provisioned?".to_string(),
            conditions: vec![Condition::new(
                "{{steps.s1.status}}",
                CompareOp::Eq,
                "complete",
            )],
            ..ChainStep::action("b1", "")
        };

        let mut s2 = ChainStep::action("s2", "bigip-ve-license");
        s2.gate = Gate::Approve;
        s2.on_failure = FailurePolicy::Skip;
        s2.parameter_map
            .insert("mgmt_ip".to_string(), "{{steps.s1.output.mgmt_ip}}".to_string());

        let m1 = ChainStep {
            id: "m1".to_string(),
            kind: StepKind::Macro,
            label: "Join Fleet".to_string(),
            macro_ref: Some("wf-fleet-join".to_string()),
            parameters: [("mgmt_ip".to_string(), "{{steps.s1.output.mgmt_ip}}".to_string())]
                .into_iter()
                .collect(),
            ..ChainStep::action("m1", "")
        };

        let steps = vec![s1, b1, s2, m1];
        let graph = reconstruct(&steps, None);
        let (round_tripped, _) = linearize(&graph);
        assert_eq!(round_tripped, steps);
    }

    #[test]
    fn test_branch_true_chain_continues_over_branch_step() {
        // branch followed via true port: successor steps still appear
        let steps = vec![
            ChainStep {
                id: "b1".to_string(),
                kind: StepKind::Branch,
                conditions: vec![Condition::new("1", CompareOp::Eq, "1")],
                ..ChainStep::action("b1", "")
            },
            ChainStep::action("s1", "after-branch"),
        ];
        let graph = reconstruct(&steps, None);
        let (round_tripped, _) = linearize(&graph);
        assert_eq!(round_tripped, steps);
    }
}
