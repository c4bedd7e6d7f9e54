//! Bounded undo/redo over whole-graph snapshots
//!
//! Every editor mutation commits a full snapshot of the previous graph.
//! Total snapshots (rather than per-operation diffs) keep the undo
//! contract trivially correct; authored graphs are tens of nodes, so the
//! memory cost is negligible.

use std::collections::VecDeque;

use super::types::{Edge, Graph, Node, NodeKind, Port, Position, new_id};
use crate::runbook::error::GraphError;

/// Maximum number of undoable snapshots retained
pub const HISTORY_DEPTH: usize = 50;

/// Past/present/future snapshot stacks
#[derive(Debug, Clone)]
pub struct GraphHistory {
    past: VecDeque<Graph>,
    present: Graph,
    future: Vec<Graph>,
}

impl GraphHistory {
    pub fn new(initial: Graph) -> Self {
        Self {
            past: VecDeque::new(),
            present: initial,
            future: Vec::new(),
        }
    }

    pub fn present(&self) -> &Graph {
        &self.present
    }

    /// Install `next` as the present graph, pushing the old present onto
    /// the past stack (evicting the oldest beyond capacity) and clearing
    /// any redo history.
    pub fn commit(&mut self, next: Graph) {
        let previous = std::mem::replace(&mut self.present, next);
        self.past.push_back(previous);
        if self.past.len() > HISTORY_DEPTH {
            self.past.pop_front();
        }
        self.future.clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.past.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    pub fn undo(&mut self) -> Result<(), GraphError> {
        let previous = self
            .past
            .pop_back()
            .ok_or(GraphError::HistoryExhausted("nothing to undo"))?;
        let current = std::mem::replace(&mut self.present, previous);
        self.future.push(current);
        Ok(())
    }

    pub fn redo(&mut self) -> Result<(), GraphError> {
        let next = self
            .future
            .pop()
            .ok_or(GraphError::HistoryExhausted("nothing to redo"))?;
        let current = std::mem::replace(&mut self.present, next);
        self.past.push_back(current);
        Ok(())
    }
}

/// Editing facade: every mutation clones the present graph, applies the
/// change, and commits the result through the history. The editor may
/// hold a transiently invalid graph; validation happens at save time.
#[derive(Debug)]
pub struct GraphEditor {
    history: GraphHistory,
}

impl GraphEditor {
    pub fn new(initial: Graph) -> Self {
        Self {
            history: GraphHistory::new(initial),
        }
    }

    /// An editor seeded with a lone start node
    pub fn blank() -> Self {
        let mut graph = Graph::new();
        graph.add_node(Node::new(NodeKind::Start, Position::new(40.0, 120.0)));
        Self::new(graph)
    }

    pub fn graph(&self) -> &Graph {
        self.history.present()
    }

    pub fn add_node(&mut self, kind: NodeKind, position: Position) -> String {
        let node = Node::new(kind, position);
        let id = node.id.clone();
        let mut next = self.graph().clone();
        next.add_node(node);
        self.history.commit(next);
        id
    }

    pub fn remove_node(&mut self, id: &str) -> Result<(), GraphError> {
        let mut next = self.graph().clone();
        if !next.remove_node(id) {
            return Err(GraphError::UnknownNode(id.to_string()));
        }
        self.history.commit(next);
        Ok(())
    }

    pub fn move_node(&mut self, id: &str, position: Position) -> Result<(), GraphError> {
        let mut next = self.graph().clone();
        match next.node_mut(id) {
            Some(node) => node.position = position,
            None => return Err(GraphError::UnknownNode(id.to_string())),
        }
        self.history.commit(next);
        Ok(())
    }

    /// Replace a node's attribute bag
    pub fn update_node(&mut self, id: &str, kind: NodeKind) -> Result<(), GraphError> {
        let mut next = self.graph().clone();
        match next.node_mut(id) {
            Some(node) => node.kind = kind,
            None => return Err(GraphError::UnknownNode(id.to_string())),
        }
        self.history.commit(next);
        Ok(())
    }

    /// Wire `from`'s `port` to `to`. Duplicate ports are allowed here and
    /// flagged by the validator.
    pub fn connect(&mut self, from: &str, port: Port, to: &str) -> Result<String, GraphError> {
        if self.graph().node(from).is_none() {
            return Err(GraphError::UnknownNode(from.to_string()));
        }
        if self.graph().node(to).is_none() {
            return Err(GraphError::UnknownNode(to.to_string()));
        }
        let edge = Edge {
            id: new_id("e"),
            from: from.to_string(),
            to: to.to_string(),
            port,
        };
        let id = edge.id.clone();
        let mut next = self.graph().clone();
        next.add_edge(edge);
        self.history.commit(next);
        Ok(id)
    }

    pub fn disconnect(&mut self, edge_id: &str) -> Result<(), GraphError> {
        let mut next = self.graph().clone();
        if !next.remove_edge(edge_id) {
            return Err(GraphError::UnknownEdge(edge_id.to_string()));
        }
        self.history.commit(next);
        Ok(())
    }

    pub fn undo(&mut self) -> Result<(), GraphError> {
        self.history.undo()
    }

    pub fn redo(&mut self) -> Result<(), GraphError> {
        self.history.redo()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }
}
