// SPDX-License-Identifier: MIT

//! Run coordinator — the per-run state machine
//!
//! One coordinating task owns one `Run`: it walks the workflow graph
//! (reconstructed from the persisted steps + layout, so an evaluated
//! branch genuinely selects its true/false successor), resolves each
//! step's templates against the accumulated context, dispatches to the
//! external action runner, and pauses/resumes around approval gates.
//! The run record is persisted on every transition; a waiting run
//! survives a process restart and can be resumed from the store.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::runbook::error::RunbookError;
use crate::runbook::runner::{ActionRunner, ActionStatus, ExecutionRequest, ProgressHandle};
use crate::runbook::store::Store;
use crate::runbook::workflow::condition::evaluate_all;
use crate::runbook::workflow::graph::serializer::reconstruct;
use crate::runbook::workflow::graph::types::{
    ActionAttrs, Graph, MacroAttrs, NodeKind, Outcome, Port, TerminalAttrs, new_id,
};
use crate::runbook::workflow::template::{chain_refs, resolve, stringify, RunContext};
use crate::runbook::workflow::types::{
    FailurePolicy, Gate, ParamDef, ParamType, TargetSource, TargetSpec, WorkflowDef,
};

use super::types::{
    ResumeAction, Run, RunEvent, RunPlan, RunStatus, RunSummary, StepResult, StepStatus,
};

/// Coordinator tunables
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Per-step execution timeout handed to the runner
    pub step_timeout_ms: u64,
    /// Macro nesting cap; breaks workflow definition cycles
    pub max_macro_depth: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 300_000,
            max_macro_depth: 8,
        }
    }
}

/// Drives runs to a terminal state
pub struct RunCoordinator {
    store: Arc<dyn Store>,
    runner: Arc<dyn ActionRunner>,
    config: CoordinatorConfig,
}

/// Where the walk goes after a step finishes
enum Route {
    Continue(String),
    Complete,
    Fail(Option<String>),
    Terminal(TerminalAttrs, Option<String>),
}

/// Everything one dispatch produced, ready to fold into the run
struct Dispatch {
    status: StepStatus,
    preview: String,
    duration_ms: u64,
    target: String,
    error: Option<String>,
    warnings: Vec<String>,
    context_entry: Value,
}

impl Dispatch {
    fn failed_early(error: impl Into<String>, target: String, warnings: Vec<String>) -> Self {
        let error = error.into();
        Self {
            status: StepStatus::Failed,
            preview: String::new(),
            duration_ms: 0,
            target,
            error: Some(error.clone()),
            warnings,
            context_entry: json!({"output": "", "status": "failed", "error": error}),
        }
    }
}

/// Aggregated outcome of an inline macro invocation
struct SubOutcome {
    status: StepStatus,
    summary: Value,
    duration_ms: u64,
    error: Option<String>,
    warnings: Vec<String>,
}

impl SubOutcome {
    fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: StepStatus::Failed,
            summary: json!({"status": "failed", "error": error}),
            duration_ms: 0,
            error: Some(error),
            warnings: Vec::new(),
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn preview(text: &str) -> String {
    text.chars().take(500).collect()
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn Store>, runner: Arc<dyn ActionRunner>) -> Self {
        Self::with_config(store, runner, CoordinatorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn Store>,
        runner: Arc<dyn ActionRunner>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Create a run for a stored workflow and drive it until it reaches
    /// a terminal state or pauses for approval. Supplied chain
    /// parameters are validated against the workflow's declarations
    /// before any run record exists.
    pub async fn start(
        &self,
        workflow_id: &str,
        chain_params: Map<String, Value>,
        injected: Map<String, Value>,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> Result<Run, RunbookError> {
        let def = self
            .store
            .load_workflow(workflow_id)?
            .ok_or_else(|| RunbookError::WorkflowNotFound(workflow_id.to_string()))?;
        let chain = validate_params(&def, &chain_params)?;

        let mut run = Run {
            id: new_id("run"),
            workflow_id: def.id.clone(),
            workflow_name: def.name.clone(),
            status: RunStatus::Created,
            current_step: 0,
            total_steps: def.steps.len(),
            step_results: Vec::new(),
            chain_params,
            context: RunContext::new(chain, injected),
            // snapshot: later edits to the workflow never reach this run
            plan: RunPlan {
                steps: def.steps.clone(),
                layout: def.layout.clone(),
                parameters: def.parameters.clone(),
            },
            waiting_step: None,
            reason: None,
            started_at: now(),
            completed_at: None,
        };
        self.store.save_run(&run)?;
        self.emit(
            &run.id,
            &events,
            RunEvent::RunStarted {
                run_id: run.id.clone(),
                workflow_id: def.id.clone(),
            },
        )
        .await;

        run.status = RunStatus::Running;
        self.store.save_run(&run)?;
        log::info!("run {} started for workflow {}", run.id, def.id);

        self.drive(&mut run, None, None, &events).await?;
        Ok(run)
    }

    /// Deliver an operator decision to a waiting run. Valid only in
    /// `waiting_approval`; anything else is a conflict. Reject fails
    /// the run without invoking the runner; approve re-enters the walk
    /// at the gated step and dispatches it.
    pub async fn resume(
        &self,
        run_id: &str,
        action: ResumeAction,
        reason: Option<String>,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> Result<Run, RunbookError> {
        let mut run = self
            .store
            .load_run(run_id)?
            .ok_or_else(|| RunbookError::RunNotFound(run_id.to_string()))?;
        if run.status != RunStatus::WaitingApproval {
            return Err(RunbookError::conflict(format!(
                "Run {} is not waiting for approval (status: {:?})",
                run_id, run.status
            )));
        }

        match action {
            ResumeAction::Reject => {
                let reason = reason.unwrap_or_else(|| "rejected by operator".to_string());
                log::info!("run {} rejected: {}", run_id, reason);
                self.finish(&mut run, RunStatus::Failed, Some(reason), &events)
                    .await?;
                Ok(run)
            }
            ResumeAction::Approve => {
                let waiting = run
                    .waiting_step
                    .take()
                    .ok_or_else(|| RunbookError::conflict("run has no waiting step recorded"))?;
                run.status = RunStatus::Running;
                self.store.save_run(&run)?;
                log::info!("run {} approved at step {}", run_id, waiting);
                self.drive(&mut run, Some(waiting.clone()), Some(waiting), &events)
                    .await?;
                Ok(run)
            }
        }
    }

    /// Operator-initiated cancellation of a waiting run
    pub async fn cancel(
        &self,
        run_id: &str,
        reason: Option<String>,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> Result<Run, RunbookError> {
        let mut run = self
            .store
            .load_run(run_id)?
            .ok_or_else(|| RunbookError::RunNotFound(run_id.to_string()))?;
        if run.status != RunStatus::WaitingApproval {
            return Err(RunbookError::conflict(format!(
                "Run {} is not waiting for approval (status: {:?})",
                run_id, run.status
            )));
        }
        let reason = reason.unwrap_or_else(|| "cancelled by operator".to_string());
        self.finish(&mut run, RunStatus::Cancelled, Some(reason), &events)
            .await?;
        Ok(run)
    }

    /// Walk the run's plan snapshot from `entry` (or the start node's
    /// successor). `approved` names the one gated node whose gate is
    /// already satisfied by the operator.
    async fn drive(
        &self,
        run: &mut Run,
        entry: Option<String>,
        mut approved: Option<String>,
        events: &Option<mpsc::Sender<RunEvent>>,
    ) -> Result<(), RunbookError> {
        let plan = run.plan.clone();
        let graph = reconstruct(&plan.steps, plan.layout.as_ref());
        let order: HashMap<&str, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i + 1))
            .collect();
        let required: HashSet<String> = plan
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.clone())
            .collect();

        let mut current = match entry {
            Some(id) => id,
            None => {
                let Some(start) = graph.start() else {
                    return self
                        .finish(
                            run,
                            RunStatus::Failed,
                            Some("workflow has no start node".to_string()),
                            events,
                        )
                        .await;
                };
                match graph.edge_from(&start.id, Port::Success) {
                    Some(edge) => edge.to.clone(),
                    None => return self.finish(run, RunStatus::Complete, None, events).await,
                }
            }
        };

        let max_visits = graph.nodes.len() * 2 + 8;
        let mut visits = 0;

        loop {
            visits += 1;
            if visits > max_visits {
                return self
                    .finish(
                        run,
                        RunStatus::Failed,
                        Some("execution exceeded the walk limit".to_string()),
                        events,
                    )
                    .await;
            }
            let Some(node) = graph.node(&current).cloned() else {
                // dangling successor; nothing left to execute
                return self.finish(run, RunStatus::Complete, None, events).await;
            };

            match node.kind {
                NodeKind::Start => match graph.edge_from(&node.id, Port::Success) {
                    Some(edge) => current = edge.to.clone(),
                    None => return self.finish(run, RunStatus::Complete, None, events).await,
                },
                NodeKind::Terminal(attrs) => {
                    return self.finish_terminal(run, &attrs, None, events).await;
                }
                NodeKind::Action(attrs) => {
                    run.current_step = order
                        .get(node.id.as_str())
                        .copied()
                        .unwrap_or(run.current_step + 1);
                    let label = display_label(&attrs.label, &attrs.action, &node.id);
                    if attrs.gate == Gate::Approve && approved.as_deref() != Some(node.id.as_str())
                    {
                        return self.pause(run, &node.id, &label, events).await;
                    }
                    approved = None;
                    let failed = self
                        .execute_action(run, &node.id, &attrs, &required, events)
                        .await?;
                    match self.route_after(&graph, &node.id, failed, attrs.on_failure, run) {
                        Route::Continue(next) => current = next,
                        Route::Complete => {
                            return self.finish(run, RunStatus::Complete, None, events).await
                        }
                        Route::Fail(error) => {
                            return self.finish(run, RunStatus::Failed, error, events).await
                        }
                        Route::Terminal(terminal, error) => {
                            return self.finish_terminal(run, &terminal, error, events).await
                        }
                    }
                }
                NodeKind::Branch(attrs) => {
                    run.current_step = order
                        .get(node.id.as_str())
                        .copied()
                        .unwrap_or(run.current_step + 1);
                    let label = if attrs.label.is_empty() {
                        "Branch".to_string()
                    } else {
                        attrs.label.clone()
                    };
                    self.emit(
                        &run.id,
                        events,
                        RunEvent::StepStarted {
                            step_id: node.id.clone(),
                            label,
                            index: run.current_step,
                        },
                    )
                    .await;

                    let mut warnings = Vec::new();
                    let (result, trace) =
                        evaluate_all(&attrs.conditions, &run.context, &mut warnings);
                    let output = json!({"result": result, "conditions": trace});
                    run.step_results.push(StepResult {
                        step_id: node.id.clone(),
                        action: String::new(),
                        label: if attrs.label.is_empty() {
                            "Branch".to_string()
                        } else {
                            attrs.label.clone()
                        },
                        status: StepStatus::Complete,
                        output_preview: preview(&output.to_string()),
                        duration_ms: 0,
                        target: String::new(),
                        error: None,
                        warnings,
                    });
                    run.context
                        .record_step(&node.id, json!({"output": output, "status": "complete"}));
                    self.store.save_run(run)?;
                    self.emit(
                        &run.id,
                        events,
                        RunEvent::StepFinished {
                            step_id: node.id.clone(),
                            status: StepStatus::Complete,
                        },
                    )
                    .await;

                    let port = if result { Port::True } else { Port::False };
                    match graph.edge_from(&node.id, port) {
                        Some(edge) => current = edge.to.clone(),
                        None => {
                            return self.finish(run, RunStatus::Complete, None, events).await
                        }
                    }
                }
                NodeKind::Macro(attrs) => {
                    run.current_step = order
                        .get(node.id.as_str())
                        .copied()
                        .unwrap_or(run.current_step + 1);
                    let label = display_label(&attrs.label, &attrs.workflow, &node.id);
                    if attrs.gate == Gate::Approve && approved.as_deref() != Some(node.id.as_str())
                    {
                        return self.pause(run, &node.id, &label, events).await;
                    }
                    approved = None;
                    let failed = self.execute_macro(run, &node.id, &attrs, events).await?;
                    match self.route_after(&graph, &node.id, failed, attrs.on_failure, run) {
                        Route::Continue(next) => current = next,
                        Route::Complete => {
                            return self.finish(run, RunStatus::Complete, None, events).await
                        }
                        Route::Fail(error) => {
                            return self.finish(run, RunStatus::Failed, error, events).await
                        }
                        Route::Terminal(terminal, error) => {
                            return self.finish_terminal(run, &terminal, error, events).await
                        }
                    }
                }
            }
        }
    }

    /// Continuation after an action/macro step. `on_failure` is
    /// authoritative for whether the run continues; a failure edge only
    /// selects the terminal that classifies a stop-policy failure.
    fn route_after(
        &self,
        graph: &Graph,
        node_id: &str,
        failed: bool,
        on_failure: FailurePolicy,
        run: &Run,
    ) -> Route {
        if failed && on_failure == FailurePolicy::Stop {
            let error = run
                .step_results
                .last()
                .and_then(|r| r.error.clone())
                .or_else(|| Some("step failed".to_string()));
            if let Some(edge) = graph.edge_from(node_id, Port::Failure) {
                if let Some(node) = graph.node(&edge.to) {
                    if let NodeKind::Terminal(attrs) = &node.kind {
                        return Route::Terminal(attrs.clone(), error);
                    }
                }
            }
            return Route::Fail(error);
        }
        match graph.edge_from(node_id, Port::Success) {
            Some(edge) => Route::Continue(edge.to.clone()),
            None => Route::Complete,
        }
    }

    async fn execute_action(
        &self,
        run: &mut Run,
        node_id: &str,
        attrs: &ActionAttrs,
        required: &HashSet<String>,
        events: &Option<mpsc::Sender<RunEvent>>,
    ) -> Result<bool, RunbookError> {
        let label = display_label(&attrs.label, &attrs.action, node_id);
        self.emit(
            &run.id,
            events,
            RunEvent::StepStarted {
                step_id: node_id.to_string(),
                label: label.clone(),
                index: run.current_step,
            },
        )
        .await;
        log::info!(
            "run {} step {}/{}: {} ",
            run.id,
            run.current_step,
            run.total_steps,
            attrs.action
        );

        let dispatch = self
            .dispatch_action(node_id, attrs, &run.context, required, events)
            .await?;
        let failed = dispatch.status == StepStatus::Failed;

        self.emit(
            &run.id,
            events,
            RunEvent::StepFinished {
                step_id: node_id.to_string(),
                status: dispatch.status,
            },
        )
        .await;

        run.step_results.push(StepResult {
            step_id: node_id.to_string(),
            action: attrs.action.clone(),
            label,
            status: dispatch.status,
            output_preview: dispatch.preview,
            duration_ms: dispatch.duration_ms,
            target: dispatch.target,
            error: dispatch.error,
            warnings: dispatch.warnings,
        });
        run.context.record_step(node_id, dispatch.context_entry);
        self.store.save_run(run)?;
        Ok(failed)
    }

    /// Resolve target and parameters, then hand the step to the runner
    /// under a bounded timeout. Runner transport errors propagate (the
    /// run keeps its last persisted state); a runner-reported failure
    /// and an unresolvable target are step failures governed by
    /// `on_failure`.
    async fn dispatch_action(
        &self,
        step_id: &str,
        attrs: &ActionAttrs,
        ctx: &RunContext,
        required: &HashSet<String>,
        events: &Option<mpsc::Sender<RunEvent>>,
    ) -> Result<Dispatch, RunbookError> {
        let mut warnings = Vec::new();

        let target = resolve_target(&attrs.target, ctx);
        if target.is_empty() {
            return Ok(Dispatch::failed_early(
                "Could not resolve execution target",
                target,
                warnings,
            ));
        }

        if let Some(name) = first_missing_required(attrs, ctx, required) {
            return Ok(Dispatch::failed_early(
                format!("Required parameter '{}' was never supplied", name),
                target,
                warnings,
            ));
        }

        // all chain values are defaults; explicit overrides win
        let mut parameters: HashMap<String, String> = ctx
            .chain
            .iter()
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect();
        for (key, value) in &attrs.parameters {
            parameters.insert(key.clone(), resolve(value, ctx, &mut warnings));
        }
        for (key, value) in &attrs.parameter_map {
            parameters.insert(key.clone(), resolve(value, ctx, &mut warnings));
        }

        let request = ExecutionRequest {
            action: attrs.action.clone(),
            target: target.clone(),
            parameters,
            timeout_ms: self.config.step_timeout_ms,
        };
        let handle = ProgressHandle::new(step_id, events.clone());
        let grace = Duration::from_millis(self.config.step_timeout_ms + 1_000);

        let result = match tokio::time::timeout(grace, self.runner.execute(request, handle)).await
        {
            Err(_) => {
                return Ok(Dispatch::failed_early(
                    format!(
                        "step timed out after {}ms",
                        self.config.step_timeout_ms
                    ),
                    target,
                    warnings,
                ));
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(result)) => result,
        };

        let status = match result.status {
            ActionStatus::Complete => StepStatus::Complete,
            ActionStatus::Failed => StepStatus::Failed,
        };
        // keep output structured when possible so later steps can
        // traverse it by field
        let output_value = result
            .structured_output
            .clone()
            .or_else(|| {
                serde_json::from_str::<Value>(&result.output)
                    .ok()
                    .filter(Value::is_object)
            })
            .unwrap_or_else(|| Value::String(result.output.clone()));
        let error = match status {
            StepStatus::Failed => Some("action reported failure".to_string()),
            StepStatus::Complete => None,
        };
        let context_entry = json!({
            "output": output_value,
            "status": status,
            "target": target,
            "duration_ms": result.duration_ms,
        });

        Ok(Dispatch {
            status,
            preview: preview(&result.output),
            duration_ms: result.duration_ms,
            target,
            error,
            warnings,
            context_entry,
        })
    }

    async fn execute_macro(
        &self,
        run: &mut Run,
        node_id: &str,
        attrs: &MacroAttrs,
        events: &Option<mpsc::Sender<RunEvent>>,
    ) -> Result<bool, RunbookError> {
        let label = display_label(&attrs.label, &attrs.workflow, node_id);
        self.emit(
            &run.id,
            events,
            RunEvent::StepStarted {
                step_id: node_id.to_string(),
                label: label.clone(),
                index: run.current_step,
            },
        )
        .await;

        let sub = self
            .run_subchain(&attrs.workflow, &attrs.bindings, &run.context, 1, events)
            .await?;
        let failed = sub.status == StepStatus::Failed;

        self.emit(
            &run.id,
            events,
            RunEvent::StepFinished {
                step_id: node_id.to_string(),
                status: sub.status,
            },
        )
        .await;

        run.step_results.push(StepResult {
            step_id: node_id.to_string(),
            action: String::new(),
            label,
            status: sub.status,
            output_preview: preview(&sub.summary.to_string()),
            duration_ms: sub.duration_ms,
            target: String::new(),
            error: sub.error,
            warnings: sub.warnings,
        });
        run.context.record_step(
            node_id,
            json!({"output": sub.summary, "status": sub.status}),
        );
        self.store.save_run(run)?;
        Ok(failed)
    }

    /// Execute a macro-referenced workflow inline. The child gets its
    /// own context (resolved bindings as chain parameters, the parent's
    /// injected layer) and its graph is walked to completion; approval
    /// gates are illegal here and fail the step.
    fn run_subchain<'a>(
        &'a self,
        workflow_id: &'a str,
        bindings: &'a HashMap<String, String>,
        parent: &'a RunContext,
        depth: usize,
        events: &'a Option<mpsc::Sender<RunEvent>>,
    ) -> Pin<Box<dyn Future<Output = Result<SubOutcome, RunbookError>> + Send + 'a>> {
        Box::pin(async move {
            if depth > self.config.max_macro_depth {
                return Err(RunbookError::MacroDepth(depth));
            }
            let Some(def) = self.store.load_workflow(workflow_id)? else {
                return Ok(SubOutcome::failed(format!(
                    "Referenced workflow '{}' not found",
                    workflow_id
                )));
            };

            let mut warnings = Vec::new();
            let mut chain = Map::new();
            for p in &def.parameters {
                if let Some(default) = &p.default {
                    chain.insert(p.name.clone(), default.clone());
                }
            }
            for (key, value) in bindings {
                chain.insert(
                    key.clone(),
                    Value::String(resolve(value, parent, &mut warnings)),
                );
            }
            for p in &def.parameters {
                let missing = chain
                    .get(&p.name)
                    .map(|v| stringify(v).is_empty())
                    .unwrap_or(true);
                if p.required && missing {
                    return Ok(SubOutcome::failed(format!(
                        "Missing required parameter '{}'",
                        p.name
                    )));
                }
            }

            let ctx_required: HashSet<String> = def
                .parameters
                .iter()
                .filter(|p| p.required)
                .map(|p| p.name.clone())
                .collect();
            let mut ctx = RunContext::new(chain, parent.injected.clone());
            let graph = reconstruct(&def.steps, def.layout.as_ref());

            let mut summaries: Vec<Value> = Vec::new();
            let mut total_ms = 0u64;

            let Some(start) = graph.start() else {
                return Ok(SubOutcome::failed("workflow has no start node"));
            };
            let mut current = match graph.edge_from(&start.id, Port::Success) {
                Some(edge) => edge.to.clone(),
                None => {
                    return Ok(sub_complete(summaries, total_ms, warnings));
                }
            };

            let max_visits = graph.nodes.len() * 2 + 8;
            let mut visits = 0;
            loop {
                visits += 1;
                if visits > max_visits {
                    return Ok(SubOutcome::failed("execution exceeded the walk limit"));
                }
                let Some(node) = graph.node(&current).cloned() else {
                    break;
                };
                let (failed, on_failure, next_port) = match &node.kind {
                    NodeKind::Start => match graph.edge_from(&node.id, Port::Success) {
                        Some(edge) => {
                            current = edge.to.clone();
                            continue;
                        }
                        None => break,
                    },
                    NodeKind::Terminal(attrs) => match attrs.outcome {
                        Outcome::Deny | Outcome::Rollback => {
                            let reason = if attrs.message.is_empty() {
                                format!("terminated by {:?} outcome", attrs.outcome).to_lowercase()
                            } else {
                                attrs.message.clone()
                            };
                            return Ok(SubOutcome {
                                status: StepStatus::Failed,
                                summary: json!({"status": "failed", "steps": summaries, "error": reason.clone()}),
                                duration_ms: total_ms,
                                error: Some(reason),
                                warnings,
                            });
                        }
                        Outcome::Alert => {
                            log::warn!(
                                "workflow {} alert: {}",
                                def.id,
                                if attrs.message.is_empty() {
                                    "workflow alert"
                                } else {
                                    &attrs.message
                                }
                            );
                            break;
                        }
                        Outcome::Webhook => {
                            if !attrs.url.is_empty() {
                                self.post_webhook(
                                    &attrs.url,
                                    &json!({"workflow_id": def.id, "status": "complete"}),
                                )
                                .await;
                            }
                            break;
                        }
                        Outcome::Allow => break,
                    },
                    NodeKind::Action(attrs) => {
                        if attrs.gate == Gate::Approve {
                            return Ok(SubOutcome::failed(
                                "approval gate inside macro-invoked workflow",
                            ));
                        }
                        let d = self
                            .dispatch_action(&node.id, attrs, &ctx, &ctx_required, events)
                            .await?;
                        total_ms += d.duration_ms;
                        summaries.push(json!({
                            "step_id": node.id,
                            "action": attrs.action,
                            "status": d.status,
                            "target": d.target,
                        }));
                        warnings.extend(d.warnings.clone());
                        ctx.record_step(&node.id, d.context_entry);
                        (d.status == StepStatus::Failed, attrs.on_failure, Port::Success)
                    }
                    NodeKind::Branch(attrs) => {
                        let (result, trace) = evaluate_all(&attrs.conditions, &ctx, &mut warnings);
                        summaries.push(json!({
                            "step_id": node.id,
                            "status": "complete",
                            "result": result,
                        }));
                        ctx.record_step(
                            &node.id,
                            json!({"output": {"result": result, "conditions": trace}, "status": "complete"}),
                        );
                        let port = if result { Port::True } else { Port::False };
                        (false, FailurePolicy::Stop, port)
                    }
                    NodeKind::Macro(attrs) => {
                        let sub = self
                            .run_subchain(&attrs.workflow, &attrs.bindings, &ctx, depth + 1, events)
                            .await?;
                        total_ms += sub.duration_ms;
                        summaries.push(json!({
                            "step_id": node.id,
                            "status": sub.status,
                        }));
                        warnings.extend(sub.warnings);
                        ctx.record_step(
                            &node.id,
                            json!({"output": sub.summary, "status": sub.status}),
                        );
                        (sub.status == StepStatus::Failed, attrs.on_failure, Port::Success)
                    }
                };

                if failed && on_failure == FailurePolicy::Stop {
                    return Ok(SubOutcome {
                        status: StepStatus::Failed,
                        summary: json!({"status": "failed", "steps": summaries}),
                        duration_ms: total_ms,
                        error: Some(format!("step '{}' failed", node.id)),
                        warnings,
                    });
                }
                match graph.edge_from(&node.id, next_port) {
                    Some(edge) => current = edge.to.clone(),
                    None => break,
                }
            }

            Ok(sub_complete(summaries, total_ms, warnings))
        })
    }

    async fn pause(
        &self,
        run: &mut Run,
        node_id: &str,
        label: &str,
        events: &Option<mpsc::Sender<RunEvent>>,
    ) -> Result<(), RunbookError> {
        run.status = RunStatus::WaitingApproval;
        run.waiting_step = Some(node_id.to_string());
        self.store.save_run(run)?;
        log::info!(
            "run {} paused at step {} ({}) awaiting approval",
            run.id,
            run.current_step,
            label
        );
        self.emit(
            &run.id,
            events,
            RunEvent::ApprovalRequired {
                step_id: node_id.to_string(),
                label: label.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Classify the end of the walk through a terminal node. A pending
    /// stop-policy failure always ends the run `failed`; the terminal
    /// still fires its side effects and contributes the reason.
    async fn finish_terminal(
        &self,
        run: &mut Run,
        attrs: &TerminalAttrs,
        failure: Option<String>,
        events: &Option<mpsc::Sender<RunEvent>>,
    ) -> Result<(), RunbookError> {
        if attrs.outcome == Outcome::Alert {
            let message = if attrs.message.is_empty() {
                "workflow alert"
            } else {
                &attrs.message
            };
            log::warn!("run {} alert: {}", run.id, message);
        }

        let (status, reason) = match (&failure, attrs.outcome) {
            (Some(error), _) => (RunStatus::Failed, Some(error.clone())),
            (None, Outcome::Allow | Outcome::Alert | Outcome::Webhook) => {
                (RunStatus::Complete, None)
            }
            (None, Outcome::Deny) => {
                let reason = if attrs.message.is_empty() {
                    "denied by policy".to_string()
                } else {
                    attrs.message.clone()
                };
                (RunStatus::Failed, Some(reason))
            }
            (None, Outcome::Rollback) => {
                let reason = if attrs.message.is_empty() {
                    "rollback requested".to_string()
                } else {
                    attrs.message.clone()
                };
                (RunStatus::Failed, Some(reason))
            }
        };

        self.finish(run, status, reason, events).await?;

        if attrs.outcome == Outcome::Webhook && !attrs.url.is_empty() {
            let payload = serde_json::to_value(RunSummary::of(run))?;
            self.post_webhook(&attrs.url, &payload).await;
        }
        Ok(())
    }

    async fn finish(
        &self,
        run: &mut Run,
        status: RunStatus,
        reason: Option<String>,
        events: &Option<mpsc::Sender<RunEvent>>,
    ) -> Result<(), RunbookError> {
        run.status = status;
        run.reason = reason;
        run.waiting_step = None;
        run.completed_at = Some(now());
        self.store.save_run(run)?;
        log::info!("run {} finished: {:?}", run.id, status);
        self.emit(
            &run.id,
            events,
            RunEvent::RunFinished {
                run_id: run.id.clone(),
                status,
            },
        )
        .await;
        Ok(())
    }

    /// Append to the persistent event log and forward to the observer.
    /// Event loss on either path is logged, never fatal.
    async fn emit(
        &self,
        run_id: &str,
        events: &Option<mpsc::Sender<RunEvent>>,
        event: RunEvent,
    ) {
        if let Err(e) = self.store.append_run_progress(run_id, &event) {
            log::warn!("failed to append progress for run {}: {}", run_id, e);
        }
        if let Some(tx) = events {
            let _ = tx.send(event).await;
        }
    }

    async fn post_webhook(&self, url: &str, payload: &Value) {
        let client = reqwest::Client::new();
        match client.post(url).json(payload).send().await {
            Ok(response) if response.status().is_success() => {
                log::info!("webhook delivered to {}", url)
            }
            Ok(response) => log::warn!("webhook to {} returned {}", url, response.status()),
            Err(e) => log::warn!("webhook to {} failed: {}", url, e),
        }
    }
}

fn sub_complete(summaries: Vec<Value>, duration_ms: u64, warnings: Vec<String>) -> SubOutcome {
    SubOutcome {
        status: StepStatus::Complete,
        summary: json!({"status": "complete", "steps": summaries}),
        duration_ms,
        error: None,
        warnings,
    }
}

fn display_label(label: &str, fallback: &str, node_id: &str) -> String {
    if !label.is_empty() {
        label.to_string()
    } else if !fallback.is_empty() {
        fallback.to_string()
    } else {
        node_id.to_string()
    }
}

fn resolve_target(spec: &TargetSpec, ctx: &RunContext) -> String {
    match spec.target_source {
        TargetSource::Fixed => spec.target_fixed.clone(),
        TargetSource::Parameter => ctx
            .chain
            .get(&spec.target_param)
            .map(stringify)
            .unwrap_or_default(),
        TargetSource::PreviousStep => ctx
            .steps
            .get(&spec.target_from_step)
            .and_then(|entry| entry.get("target"))
            .map(stringify)
            .unwrap_or_default(),
    }
}

/// First declared-required chain parameter a step's templates reference
/// that the context cannot satisfy
fn first_missing_required(
    attrs: &ActionAttrs,
    ctx: &RunContext,
    required: &HashSet<String>,
) -> Option<String> {
    for template in attrs.parameters.values().chain(attrs.parameter_map.values()) {
        for name in chain_refs(template) {
            let satisfied = ctx
                .chain
                .get(&name)
                .map(|v| !stringify(v).is_empty())
                .unwrap_or(false);
            if required.contains(&name) && !satisfied {
                return Some(name);
            }
        }
    }
    None
}

/// Validate supplied chain parameters against the workflow's
/// declarations and merge declared defaults. Rejects before any run
/// record is created.
fn validate_params(
    def: &WorkflowDef,
    supplied: &Map<String, Value>,
) -> Result<Map<String, Value>, RunbookError> {
    let mut chain = Map::new();
    for p in &def.parameters {
        if let Some(default) = &p.default {
            chain.insert(p.name.clone(), default.clone());
        }
    }
    for (key, value) in supplied {
        chain.insert(key.clone(), value.clone());
    }

    for p in &def.parameters {
        match chain.get(&p.name) {
            None | Some(Value::Null) => {
                if p.required {
                    return Err(RunbookError::MissingParameter(p.name.clone()));
                }
            }
            Some(value) => {
                if p.required && stringify(value).is_empty() {
                    return Err(RunbookError::MissingParameter(p.name.clone()));
                }
                check_param_type(p, value)?;
            }
        }
    }
    Ok(chain)
}

fn check_param_type(p: &ParamDef, value: &Value) -> Result<(), RunbookError> {
    let ok = match p.param_type {
        ParamType::Number => {
            value.is_number()
                || value
                    .as_str()
                    .is_some_and(|s| s.parse::<f64>().is_ok())
        }
        ParamType::Boolean => {
            value.is_boolean() || value.as_str().is_some_and(|s| matches!(s, "true" | "false"))
        }
        ParamType::String | ParamType::Device | ParamType::Secret => {
            value.is_string() || value.is_number() || value.is_boolean()
        }
    };
    if ok {
        Ok(())
    } else {
        let expected = match p.param_type {
            ParamType::Number => "a number",
            ParamType::Boolean => "a boolean",
            _ => "a scalar value",
        };
        Err(RunbookError::InvalidParameter {
            name: p.name.clone(),
            message: format!("expected {}", expected),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runbook::runner::ActionResult;
    use crate::runbook::store::MemoryStore;
    use crate::runbook::workflow::condition::{CompareOp, Condition};
    use crate::runbook::workflow::graph::linearize;
    use crate::runbook::workflow::graph::types::{Edge, Node, Position};
    use crate::runbook::workflow::types::{ChainStep, StepKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Runner stub: scripted results per action name, records every
    /// request it receives
    struct MockRunner {
        responses: Mutex<HashMap<String, ActionResult>>,
        calls: Mutex<Vec<ExecutionRequest>>,
    }

    impl MockRunner {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, action: &str, result: ActionResult) {
            self.responses
                .lock()
                .unwrap()
                .insert(action.to_string(), result);
        }

        fn calls(&self) -> Vec<ExecutionRequest> {
            self.calls.lock().unwrap().clone()
        }

        fn ok(output: &str) -> ActionResult {
            ActionResult {
                status: ActionStatus::Complete,
                output: output.to_string(),
                structured_output: None,
                duration_ms: 5,
            }
        }

        fn fail(output: &str) -> ActionResult {
            ActionResult {
                status: ActionStatus::Failed,
                output: output.to_string(),
                structured_output: None,
                duration_ms: 5,
            }
        }
    }

    #[async_trait]
    impl ActionRunner for MockRunner {
        async fn execute(
            &self,
            request: ExecutionRequest,
            progress: ProgressHandle,
        ) -> Result<ActionResult, RunbookError> {
            progress.emit("working").await;
            let result = self
                .responses
                .lock()
                .unwrap()
                .get(&request.action)
                .cloned()
                .unwrap_or_else(|| Self::ok("ok"));
            self.calls.lock().unwrap().push(request);
            Ok(result)
        }
    }

    fn device_param() -> ParamDef {
        ParamDef {
            name: "device".to_string(),
            label: "Target Device".to_string(),
            param_type: ParamType::Device,
            required: true,
            default: None,
        }
    }

    fn workflow(id: &str, steps: Vec<ChainStep>) -> WorkflowDef {
        WorkflowDef {
            id: id.to_string(),
            name: format!("Workflow {}", id),
            description: String::new(),
            tags: Vec::new(),
            trigger: Default::default(),
            steps,
            parameters: vec![device_param()],
            layout: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn params(device: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("device".to_string(), Value::String(device.to_string()));
        map
    }

    fn harness() -> (Arc<MemoryStore>, Arc<MockRunner>, RunCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(MockRunner::new());
        let coordinator = RunCoordinator::new(store.clone(), runner.clone());
        (store, runner, coordinator)
    }

    #[tokio::test]
    async fn test_single_step_run_completes() {
        let (store, runner, coordinator) = harness();
        runner.respond("check-pool", MockRunner::ok("3 members up"));
        store
            .save_workflow(&workflow("wf1", vec![ChainStep::action("s1", "check-pool")]))
            .unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.step_results.len(), 1);
        assert_eq!(run.step_results[0].status, StepStatus::Complete);
        assert_eq!(run.step_results[0].output_preview, "3 members up");
        assert_eq!(run.step_results[0].target, "bigip01");
        assert_eq!(runner.calls().len(), 1);
        // persisted copy matches
        let stored = store.load_run(&run.id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_missing_required_parameter_rejected() {
        let (store, _runner, coordinator) = harness();
        store
            .save_workflow(&workflow("wf1", vec![ChainStep::action("s1", "check-pool")]))
            .unwrap();

        let err = coordinator
            .start("wf1", Map::new(), Map::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::MissingParameter(name) if name == "device"));
    }

    #[tokio::test]
    async fn test_unknown_workflow_rejected() {
        let (_store, _runner, coordinator) = harness();
        let err = coordinator
            .start("missing", Map::new(), Map::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_gated_first_step_pauses_without_dispatch() {
        let (store, runner, coordinator) = harness();
        let mut step = ChainStep::action("s1", "bigip-node-toggle");
        step.gate = Gate::Approve;
        store.save_workflow(&workflow("wf1", vec![step])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::WaitingApproval);
        assert_eq!(run.waiting_step.as_deref(), Some("s1"));
        assert!(run.step_results.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reject_fails_run_without_dispatch() {
        let (store, runner, coordinator) = harness();
        let mut step = ChainStep::action("s1", "bigip-node-toggle");
        step.gate = Gate::Approve;
        store.save_workflow(&workflow("wf1", vec![step])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        let run = coordinator
            .resume(&run.id, ResumeAction::Reject, Some("too risky".to_string()), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.reason.as_deref(), Some("too risky"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_approve_dispatches_gated_step_exactly_once() {
        let (store, runner, coordinator) = harness();
        let mut gated = ChainStep::action("s1", "bigip-node-toggle");
        gated.gate = Gate::Approve;
        let after = ChainStep::action("s2", "bigip-pool-status");
        store
            .save_workflow(&workflow("wf1", vec![gated, after]))
            .unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        let run = coordinator
            .resume(&run.id, ResumeAction::Approve, None, None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.step_results.len(), 2);
        let calls = runner.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| c.action == "bigip-node-toggle")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_second_gate_pauses_again_after_approval() {
        let (store, _runner, coordinator) = harness();
        let mut g1 = ChainStep::action("s1", "one");
        g1.gate = Gate::Approve;
        let mut g2 = ChainStep::action("s2", "two");
        g2.gate = Gate::Approve;
        store.save_workflow(&workflow("wf1", vec![g1, g2])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        let run = coordinator
            .resume(&run.id, ResumeAction::Approve, None, None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::WaitingApproval);
        assert_eq!(run.waiting_step.as_deref(), Some("s2"));
        assert_eq!(run.step_results.len(), 1);
    }

    #[tokio::test]
    async fn test_workflow_edits_never_reach_inflight_run() {
        let (store, runner, coordinator) = harness();
        let mut gated = ChainStep::action("s1", "original-action");
        gated.gate = Gate::Approve;
        store.save_workflow(&workflow("wf1", vec![gated])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::WaitingApproval);

        // edit the definition while the run is paused
        store
            .save_workflow(&workflow(
                "wf1",
                vec![ChainStep::action("s1", "edited-action")],
            ))
            .unwrap();

        let run = coordinator
            .resume(&run.id, ResumeAction::Approve, None, None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Complete);
        // the already-linearized plan was executed, not the edit
        assert_eq!(runner.calls()[0].action, "original-action");
    }

    #[tokio::test]
    async fn test_resume_conflict_when_not_waiting() {
        let (store, _runner, coordinator) = harness();
        store
            .save_workflow(&workflow("wf1", vec![ChainStep::action("s1", "check")]))
            .unwrap();
        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Complete);

        let err = coordinator
            .resume(&run.id, ResumeAction::Approve, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_waiting_run() {
        let (store, _runner, coordinator) = harness();
        let mut step = ChainStep::action("s1", "toggle");
        step.gate = Gate::Approve;
        store.save_workflow(&workflow("wf1", vec![step])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        let run = coordinator.cancel(&run.id, None, None).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);

        // terminal: a second cancel conflicts
        let err = coordinator.cancel(&run.id, None, None).await.unwrap_err();
        assert!(matches!(err, RunbookError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_stop_policy_halts_run() {
        let (store, runner, coordinator) = harness();
        runner.respond("a", MockRunner::fail("boom"));
        let a = ChainStep::action("s1", "a");
        let b = ChainStep::action("s2", "b");
        store.save_workflow(&workflow("wf1", vec![a, b])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step_results.len(), 1);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_policy_continues_run() {
        let (store, runner, coordinator) = harness();
        runner.respond("a", MockRunner::fail("boom"));
        let mut a = ChainStep::action("s1", "a");
        a.on_failure = FailurePolicy::Skip;
        let b = ChainStep::action("s2", "b");
        store.save_workflow(&workflow("wf1", vec![a, b])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.step_results.len(), 2);
        assert_eq!(run.step_results[0].status, StepStatus::Failed);
        assert_eq!(run.step_results[1].status, StepStatus::Complete);
    }

    #[tokio::test]
    async fn test_parameter_forwarding_between_steps() {
        let (store, runner, coordinator) = harness();
        runner.respond(
            "provision",
            ActionResult {
                status: ActionStatus::Complete,
                output: r#"{"mgmt_ip": "10.1.1.5"}"#.to_string(),
                structured_output: None,
                duration_ms: 5,
            },
        );
        let a = ChainStep::action("s1", "provision");
        let mut b = ChainStep::action("s2", "license");
        b.parameters.insert(
            "mgmt_ip".to_string(),
            "{{steps.s1.output.mgmt_ip}}".to_string(),
        );
        store.save_workflow(&workflow("wf1", vec![a, b])).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Complete);

        let calls = runner.calls();
        let license = calls.iter().find(|c| c.action == "license").unwrap();
        assert_eq!(license.parameters["mgmt_ip"], "10.1.1.5");
        // chain params flow through as defaults
        assert_eq!(license.parameters["device"], "bigip01");
    }

    #[tokio::test]
    async fn test_branch_selects_false_path() {
        let (store, runner, coordinator) = harness();
        runner.respond(
            "pool-status",
            ActionResult {
                status: ActionStatus::Complete,
                output: r#"{"members_up": 0}"#.to_string(),
                structured_output: None,
                duration_ms: 5,
            },
        );

        // graph: start -> s1 -> b1; true -> s2 -> end, false -> deny
        let s1 = ChainStep::action("s1", "pool-status");
        let b1 = ChainStep {
            id: "b1".to_string(),
            kind: StepKind::Branch,
            conditions: vec![Condition::new(
                "{{steps.s1.output.members_up}}",
                CompareOp::Gt,
                "0",
            )],
            ..ChainStep::action("b1", "")
        };
        let s2 = ChainStep::action("s2", "drain");
        let steps = vec![s1, b1, s2];
        let mut graph = reconstruct(&steps, None);
        // wire the branch false port to a deny terminal
        graph.add_node(Node::with_id(
            "denied",
            NodeKind::Terminal(TerminalAttrs {
                outcome: Outcome::Deny,
                message: "pool is down".to_string(),
                ..TerminalAttrs::default()
            }),
            Position::default(),
        ));
        graph.add_edge(Edge {
            id: "e-false".to_string(),
            from: "b1".to_string(),
            to: "denied".to_string(),
            port: Port::False,
        });
        let (steps, layout) = linearize(&graph);

        let mut def = workflow("wf1", steps);
        def.layout = Some(layout);
        store.save_workflow(&def).unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.reason.as_deref(), Some("pool is down"));
        // the drain step on the true path never dispatched
        assert!(runner.calls().iter().all(|c| c.action != "drain"));
        // branch recorded its evaluation
        let branch = run.step_results.iter().find(|r| r.step_id == "b1").unwrap();
        assert_eq!(branch.status, StepStatus::Complete);
    }

    #[tokio::test]
    async fn test_branch_selects_true_path() {
        let (store, runner, coordinator) = harness();
        runner.respond(
            "pool-status",
            ActionResult {
                status: ActionStatus::Complete,
                output: r#"{"members_up": 3}"#.to_string(),
                structured_output: None,
                duration_ms: 5,
            },
        );
        let s1 = ChainStep::action("s1", "pool-status");
        let b1 = ChainStep {
            id: "b1".to_string(),
            kind: StepKind::Branch,
            conditions: vec![Condition::new(
                "{{steps.s1.output.members_up}}",
                CompareOp::Gt,
                "0",
            )],
            ..ChainStep::action("b1", "")
        };
        let s2 = ChainStep::action("s2", "drain");
        store
            .save_workflow(&workflow("wf1", vec![s1, b1, s2]))
            .unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert!(runner.calls().iter().any(|c| c.action == "drain"));
    }

    #[tokio::test]
    async fn test_macro_step_runs_child_inline() {
        let (store, runner, coordinator) = harness();
        let mut child_step = ChainStep::action("c1", "child-action");
        child_step.target.target_source = TargetSource::Fixed;
        child_step.target.target_fixed = "bigip02".to_string();
        let mut child = workflow("wf-child", vec![child_step]);
        child.parameters = vec![ParamDef {
            name: "cluster_id".to_string(),
            label: String::new(),
            param_type: ParamType::String,
            required: true,
            default: None,
        }];
        store.save_workflow(&child).unwrap();

        let parent_macro = ChainStep {
            id: "m1".to_string(),
            kind: StepKind::Macro,
            macro_ref: Some("wf-child".to_string()),
            parameters: [("cluster_id".to_string(), "{{chain.device}}".to_string())]
                .into_iter()
                .collect(),
            ..ChainStep::action("m1", "")
        };
        store
            .save_workflow(&workflow("wf1", vec![parent_macro]))
            .unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.step_results.len(), 1);
        assert_eq!(run.step_results[0].status, StepStatus::Complete);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, "child-action");
        assert_eq!(calls[0].target, "bigip02");
        assert_eq!(calls[0].parameters["cluster_id"], "bigip01");
    }

    #[tokio::test]
    async fn test_macro_missing_child_fails_step() {
        let (store, _runner, coordinator) = harness();
        let parent_macro = ChainStep {
            id: "m1".to_string(),
            kind: StepKind::Macro,
            macro_ref: Some("wf-ghost".to_string()),
            ..ChainStep::action("m1", "")
        };
        store
            .save_workflow(&workflow("wf1", vec![parent_macro]))
            .unwrap();

        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.step_results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("wf-ghost"));
    }

    #[tokio::test]
    async fn test_unresolvable_target_fails_step() {
        let (store, runner, coordinator) = harness();
        let mut step = ChainStep::action("s1", "check");
        step.target.target_param = "absent".to_string();
        let mut def = workflow("wf1", vec![step]);
        def.parameters = Vec::new();
        store.save_workflow(&def).unwrap();

        let run = coordinator
            .start("wf1", Map::new(), Map::new(), None)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(runner.calls().is_empty());
        assert!(run.step_results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("target"));
    }

    #[tokio::test]
    async fn test_events_strictly_ordered() {
        let (store, _runner, coordinator) = harness();
        store
            .save_workflow(&workflow(
                "wf1",
                vec![
                    ChainStep::action("s1", "one"),
                    ChainStep::action("s2", "two"),
                ],
            ))
            .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        coordinator
            .start("wf1", params("bigip01"), Map::new(), Some(tx))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        // every s1 event precedes every s2 event
        let first_s2 = events
            .iter()
            .position(|e| matches!(e, RunEvent::StepStarted { step_id, .. } if step_id == "s2"))
            .unwrap();
        let last_s1 = events
            .iter()
            .rposition(|e| {
                matches!(e, RunEvent::StepFinished { step_id, .. } if step_id == "s1")
                    || matches!(e, RunEvent::StepProgress { step_id, .. } if step_id == "s1")
            })
            .unwrap();
        assert!(last_s1 < first_s2);
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(events.last(), Some(RunEvent::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_progress_appended_to_store() {
        let (store, _runner, coordinator) = harness();
        store
            .save_workflow(&workflow("wf1", vec![ChainStep::action("s1", "one")]))
            .unwrap();
        let run = coordinator
            .start("wf1", params("bigip01"), Map::new(), None)
            .await
            .unwrap();

        let events = store.events_for(&run.id);
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(events.last(), Some(RunEvent::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_invalid_parameter_type_rejected() {
        let (store, _runner, coordinator) = harness();
        let mut def = workflow("wf1", vec![ChainStep::action("s1", "check")]);
        def.parameters.push(ParamDef {
            name: "count".to_string(),
            label: String::new(),
            param_type: ParamType::Number,
            required: false,
            default: None,
        });
        store.save_workflow(&def).unwrap();

        let mut supplied = params("bigip01");
        supplied.insert("count".to_string(), Value::String("not-a-number".to_string()));
        let err = coordinator
            .start("wf1", supplied, Map::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::InvalidParameter { name, .. } if name == "count"));
    }
}
