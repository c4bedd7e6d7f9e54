// SPDX-License-Identifier: MIT

//! Condition types for branch nodes
//!
//! A branch declares an ordered list of conditions. Each condition compares
//! a template expression against a literal-or-template value and names the
//! connective joining it to the next condition in the list.

use serde::{Deserialize, Serialize};

/// One branch condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Template expression producing the left-hand value,
    /// e.g. `{{steps.step-1.output.state}}`
    pub source: String,
    pub op: CompareOp,
    /// Literal or template right-hand value
    #[serde(default)]
    pub value: String,
    /// Connective joining this condition to the NEXT one; ignored on the
    /// last condition of the list
    #[serde(default)]
    pub connective: Connective,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

/// Boolean connectives, combined strictly left-to-right (no precedence
/// grouping)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Connective {
    #[default]
    And,
    Or,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompareOp::Eq => write!(f, "=="),
            CompareOp::NotEq => write!(f, "!="),
            CompareOp::Gt => write!(f, ">"),
            CompareOp::Gte => write!(f, ">="),
            CompareOp::Lt => write!(f, "<"),
            CompareOp::Lte => write!(f, "<="),
            CompareOp::Contains => write!(f, "contains"),
        }
    }
}

impl Condition {
    pub fn new(source: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            op,
            value: value.into(),
            connective: Connective::And,
        }
    }

    pub fn or_next(mut self) -> Self {
        self.connective = Connective::Or;
        self
    }
}
