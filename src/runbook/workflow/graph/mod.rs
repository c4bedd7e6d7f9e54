// SPDX-License-Identifier: MIT

//! Authoring graph: model, history, validation and serialization

pub mod history;
pub mod serializer;
pub mod types;
pub mod validator;

pub use history::{GraphEditor, GraphHistory, HISTORY_DEPTH};
pub use serializer::{linearize, reconstruct};
pub use types::{Edge, Graph, LayoutDoc, Node, NodeKind, Outcome, Port, Position};
pub use validator::{validate, validate_macro_refs, ValidationIssue};
