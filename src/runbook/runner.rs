// SPDX-License-Identifier: MIT

//! External action runner boundary
//!
//! The transport actually executing a step (shell session, device API,
//! hypervisor) lives outside this crate. The coordinator only sees the
//! `ActionRunner` trait: one bounded `execute` call per step plus an
//! ordered progress channel. `HttpRunner` bridges to a runner service
//! over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::runbook::error::RunbookError;
use crate::runbook::run::types::RunEvent;

/// One dispatch to the external runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub action: String,
    pub target: String,
    pub parameters: HashMap<String, String>,
    pub timeout_ms: u64,
}

/// Runner-reported status of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Complete,
    Failed,
}

/// Result of one dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    #[serde(default)]
    pub output: String,
    /// Structured output when the runner parsed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Forwards runner progress into the run's ordered event stream.
/// Dropping progress (no observer attached) is fine; losing an event is
/// never an error.
#[derive(Clone)]
pub struct ProgressHandle {
    step_id: String,
    tx: Option<mpsc::Sender<RunEvent>>,
}

impl ProgressHandle {
    pub fn new(step_id: impl Into<String>, tx: Option<mpsc::Sender<RunEvent>>) -> Self {
        Self {
            step_id: step_id.into(),
            tx,
        }
    }

    /// A handle that discards everything
    pub fn sink(step_id: impl Into<String>) -> Self {
        Self::new(step_id, None)
    }

    pub async fn emit(&self, data: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx
                .send(RunEvent::StepProgress {
                    step_id: self.step_id.clone(),
                    data: data.into(),
                })
                .await;
        }
    }
}

/// Executes resolved steps against their external target
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressHandle,
    ) -> Result<ActionResult, RunbookError>;
}

/// Runner bridge that POSTs each request to a runner service endpoint
pub struct HttpRunner {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRunner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ActionRunner for HttpRunner {
    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressHandle,
    ) -> Result<ActionResult, RunbookError> {
        progress
            .emit(format!("dispatching {} to {}", request.action, request.target))
            .await;

        let url = format!("{}/execute", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RunbookError::runner(format!(
                "runner endpoint returned {}",
                response.status()
            )));
        }

        let result: ActionResult = response.json().await?;
        Ok(result)
    }
}
