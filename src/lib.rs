// SPDX-License-Identifier: MIT

//! runbook-rs — graph-authored, resumable device automation
//!
//! Operators assemble a directed graph of device actions, conditional
//! branches, sub-workflow invocations and terminal outcomes; the graph
//! is validated, linearized into a canonical step plan, and executed as
//! a deterministic run that resolves templated parameters against
//! accumulated state and pauses around approval gates.

pub mod runbook;
