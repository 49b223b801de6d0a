//! In-process workflow engine.
//!
//! [`WorkflowEngine`] is the control surface callers hold: create executions
//! from templates, start them, pause/resume/cancel, and inspect status. Each
//! started execution gets its own controller task; the engine keeps a watch
//! receiver per active run so `wait` is a subscription, not a poll loop.
//!
//! The engine is plain data behind `Arc`s. Construct as many as you need;
//! nothing here is global.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_types::error::EngineError;
use relay_types::workflow::{ExecutionStatus, StepStatus, WorkflowExecution};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dispatch::ActionDispatcher;
use super::executor::{make_signals, ExecutionController, SharedExecution};
use super::monitor::{PerformanceMonitor, PerformanceReport};
use super::template::{TemplateRegistry, TemplateSummary};

// ---------------------------------------------------------------------------
// Status reporting
// ---------------------------------------------------------------------------

/// Point-in-time view of one step for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub definition_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatusReport {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// Terminal steps over total steps, in percent.
    pub progress_pct: u8,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Control handles for one running execution.
struct ActiveRun {
    cancel: CancellationToken,
    resume: Arc<Notify>,
    status_rx: watch::Receiver<ExecutionStatus>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    templates: Arc<TemplateRegistry>,
    dispatcher: Arc<dyn ActionDispatcher>,
    monitor: Arc<PerformanceMonitor>,
    executions: DashMap<Uuid, SharedExecution>,
    active: Arc<DashMap<Uuid, ActiveRun>>,
}

impl WorkflowEngine {
    pub fn new(templates: Arc<TemplateRegistry>, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self {
            templates,
            dispatcher,
            monitor: Arc::new(PerformanceMonitor::new()),
            executions: DashMap::new(),
            active: Arc::new(DashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Instantiate a template into a PENDING execution and register it.
    pub fn create_from_template(
        &self,
        template_id: &str,
        parameters: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let execution = self.templates.instantiate(template_id, parameters)?;
        let id = execution.id;
        self.executions.insert(id, Arc::new(RwLock::new(execution)));
        tracing::info!(execution_id = %id, %template_id, "execution created");
        Ok(id)
    }

    /// Register a hand-built execution (steps already instantiated).
    pub fn submit(&self, execution: WorkflowExecution) -> Result<Uuid, EngineError> {
        if execution.status != ExecutionStatus::Pending {
            return Err(EngineError::InvalidStateTransition {
                from: execution.status,
                to: ExecutionStatus::Pending,
            });
        }
        let id = execution.id;
        self.executions.insert(id, Arc::new(RwLock::new(execution)));
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a PENDING execution. Extra `input` entries merge over the
    /// context input seeded at creation. Returns the execution id.
    pub async fn execute(
        &self,
        id: Uuid,
        input: Map<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let shared = self.shared(id)?;
        {
            let mut exec = shared.write().await;
            if exec.status != ExecutionStatus::Pending {
                return Err(EngineError::InvalidStateTransition {
                    from: exec.status,
                    to: ExecutionStatus::Running,
                });
            }
            if !input.is_empty() {
                match exec.context.get_mut("input") {
                    Some(Value::Object(existing)) => {
                        for (k, v) in input {
                            existing.insert(k, v);
                        }
                    }
                    _ => {
                        exec.context.insert("input".to_string(), Value::Object(input));
                    }
                }
            }
        }

        let (signals, status_rx) = make_signals(ExecutionStatus::Pending);
        self.active.insert(
            id,
            ActiveRun {
                cancel: signals.cancel.clone(),
                resume: Arc::clone(&signals.resume),
                status_rx,
            },
        );
        let status_tx = Arc::clone(&signals.status_tx);

        let controller = ExecutionController::new(
            Arc::clone(&shared),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.monitor),
            signals,
        );
        let active = Arc::clone(&self.active);
        let guard_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            // Step panics are contained by the controller; this guard covers
            // a controller bug, so the execution still settles and the
            // active index never leaks an entry.
            if let Err(err) = tokio::spawn(controller.run()).await {
                tracing::error!(execution_id = %id, error = %err, "execution controller panicked");
                let mut exec = guard_shared.write().await;
                if !exec.status.is_terminal() {
                    let now = Utc::now();
                    exec.status = ExecutionStatus::Failed;
                    exec.error = Some("internal error: execution controller aborted".to_string());
                    exec.finished_at = Some(now);
                    for step in exec.steps.iter_mut() {
                        match step.status {
                            StepStatus::Running => {
                                step.status = StepStatus::Failed;
                                step.error =
                                    Some("step task aborted unexpectedly".to_string());
                            }
                            StepStatus::Pending => step.status = StepStatus::Cancelled,
                            _ => continue,
                        }
                        step.finished_at = Some(now);
                    }
                    let _ = status_tx.send(ExecutionStatus::Failed);
                }
            }
            active.remove(&id);
        });
        Ok(id)
    }

    /// Pause a RUNNING execution. In-flight steps finish; no new steps start
    /// until `resume`.
    pub async fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        let shared = self.shared(id)?;
        let mut exec = shared.write().await;
        if exec.status != ExecutionStatus::Running {
            return Err(EngineError::InvalidStateTransition {
                from: exec.status,
                to: ExecutionStatus::Paused,
            });
        }
        exec.status = ExecutionStatus::Paused;
        tracing::info!(execution_id = %id, "execution paused");
        Ok(())
    }

    /// Resume a PAUSED execution.
    pub async fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        let shared = self.shared(id)?;
        {
            let mut exec = shared.write().await;
            if exec.status != ExecutionStatus::Paused {
                return Err(EngineError::InvalidStateTransition {
                    from: exec.status,
                    to: ExecutionStatus::Running,
                });
            }
            exec.status = ExecutionStatus::Running;
        }
        if let Some(run) = self.active.get(&id) {
            run.resume.notify_one();
        }
        tracing::info!(execution_id = %id, "execution resumed");
        Ok(())
    }

    /// Cancel a non-terminal execution. Running steps finish naturally;
    /// steps still PENDING are marked Cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        let shared = self.shared(id)?;

        if let Some(run) = self.active.get(&id) {
            let status = shared.read().await.status;
            if status.is_terminal() {
                return Err(EngineError::InvalidStateTransition {
                    from: status,
                    to: ExecutionStatus::Cancelled,
                });
            }
            run.cancel.cancel();
            // A paused controller is parked on resume/cancel select; the
            // token wakes it.
            tracing::info!(execution_id = %id, "execution cancel requested");
            return Ok(());
        }

        // Never started: settle it directly.
        let mut exec = shared.write().await;
        if exec.status.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                from: exec.status,
                to: ExecutionStatus::Cancelled,
            });
        }
        let now = Utc::now();
        exec.status = ExecutionStatus::Cancelled;
        exec.finished_at = Some(now);
        for step in exec.steps.iter_mut() {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Cancelled;
                step.finished_at = Some(now);
            }
        }
        tracing::info!(execution_id = %id, "pending execution cancelled");
        Ok(())
    }

    /// Wait for the execution to reach a terminal status.
    pub async fn wait(&self, id: Uuid) -> Result<ExecutionStatus, EngineError> {
        let rx = self.active.get(&id).map(|run| run.status_rx.clone());
        if let Some(mut rx) = rx {
            if let Ok(status) = rx.wait_for(|s| s.is_terminal()).await {
                return Ok(*status);
            }
            // Channel closed: the controller finished; fall through to the
            // stored execution.
        }
        let shared = self.shared(id)?;
        let status = shared.read().await.status;
        if status.is_terminal() {
            Ok(status)
        } else {
            Err(EngineError::Policy(format!(
                "execution {id} has not been started"
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Full snapshot of an execution.
    pub async fn execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        Ok(self.shared(id)?.read().await.clone())
    }

    /// Step-level status report for an execution.
    pub async fn status(&self, id: Uuid) -> Result<ExecutionStatusReport, EngineError> {
        let shared = self.shared(id)?;
        let exec = shared.read().await;

        let steps: Vec<StepReport> = exec
            .steps
            .iter()
            .map(|s| StepReport {
                definition_id: s.definition_id.clone(),
                status: s.status,
                duration_ms: match (s.started_at, s.finished_at) {
                    (Some(start), Some(end)) => {
                        Some((end - start).num_milliseconds().max(0) as u64)
                    }
                    _ => None,
                },
                error: s.error.clone(),
            })
            .collect();

        let total = exec.steps.len();
        let terminal = exec.steps.iter().filter(|s| s.status.is_terminal()).count();
        let progress_pct = if total == 0 {
            100
        } else {
            ((terminal * 100) / total) as u8
        };

        Ok(ExecutionStatusReport {
            execution_id: exec.id,
            status: exec.status,
            progress_pct,
            completed: exec.count_status(StepStatus::Completed),
            failed: exec.count_status(StepStatus::Failed),
            total,
            started_at: exec.started_at,
            finished_at: exec.finished_at,
            steps,
            error: exec.error.clone(),
        })
    }

    pub fn list_templates(&self) -> Vec<TemplateSummary> {
        self.templates.list()
    }

    pub fn performance_report(&self, id: Uuid) -> Option<PerformanceReport> {
        self.monitor.report(id)
    }

    fn shared(&self, id: Uuid) -> Result<SharedExecution, EngineError> {
        self.executions
            .get(&id)
            .map(|e| Arc::clone(&e))
            .ok_or(EngineError::ExecutionNotFound(id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use relay_types::workflow::{
        ConditionOp, ConditionalRule, ParallelMode, RetryPolicy, StepDefinition, WorkflowTemplate,
    };
    use serde_json::json;

    use super::super::dispatch::{ActionResult, HandlerRegistry};

    fn template(steps: Vec<StepDefinition>) -> WorkflowTemplate {
        WorkflowTemplate {
            id: "t".to_string(),
            name: "t".to_string(),
            category: "test".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            tags: vec![],
            parameters: HashMap::new(),
            steps,
        }
    }

    fn step(id: &str, service: &str, action: &str, depends_on: Vec<&str>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            service: service.to_string(),
            action: action.to_string(),
            parameters: Map::new(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            parallel: false,
            parallel_group: None,
            parallel_mode: ParallelMode::All,
            condition: None,
            timeout_secs: None,
            retry: None,
        }
    }

    fn engine_with(template: WorkflowTemplate, registry: Arc<HandlerRegistry>) -> WorkflowEngine {
        let templates = Arc::new(TemplateRegistry::new());
        templates.publish(template).unwrap();
        WorkflowEngine::new(templates, registry)
    }

    fn trace_init() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("relay_core=debug")
            .try_init();
    }

    async fn run_to_end(engine: &WorkflowEngine) -> WorkflowExecution {
        trace_init();
        let id = engine.create_from_template("t", Map::new()).unwrap();
        engine.execute(id, Map::new()).await.unwrap();
        engine.wait(id).await.unwrap();
        engine.execution(id).await.unwrap()
    }

    // -----------------------------------------------------------------------
    // End-to-end scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn diamond_in_dependencies_complete_with_all_outputs() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "op", |_, _| async { ActionResult::ok(json!("ok")) });

        // a and c are roots; b joins on both.
        let engine = engine_with(
            template(vec![
                step("a", "svc", "op", vec![]),
                step("b", "svc", "op", vec!["a", "c"]),
                step("c", "svc", "op", vec![]),
            ]),
            registry,
        );
        let exec = run_to_end(&engine).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.output.len(), 3);
        assert!(exec.steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn false_conditional_skips_step_but_execution_completes() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "op", |_, _| async { ActionResult::ok(json!("ok")) });
        registry.register_fn("chat", "post_message", |_, _| async {
            panic!("gated step must not dispatch")
        });

        let mut gated = step("notify", "chat", "post_message", vec!["work"]);
        gated.condition = Some(ConditionalRule::compare(
            ConditionOp::Equals,
            "input.notify",
            json!(true),
        ));
        let engine = engine_with(
            template(vec![step("work", "svc", "op", vec![]), gated]),
            registry,
        );

        let id = engine.create_from_template("t", Map::new()).unwrap();
        let mut input = Map::new();
        input.insert("notify".to_string(), json!(false));
        engine.execute(id, input).await.unwrap();
        engine.wait(id).await.unwrap();
        let exec = engine.execution(id).await.unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(
            exec.step_by_definition("notify").unwrap().status,
            StepStatus::Skipped
        );
        // Skipped steps contribute nothing to the output map.
        assert_eq!(exec.output.len(), 1);
        assert!(exec.output.contains_key("work"));
    }

    #[tokio::test]
    async fn all_mode_group_with_one_failure_fails_the_execution() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "ok", |_, _| async { ActionResult::ok(json!("fine")) });
        registry.register_fn("svc", "fail", |_, _| async {
            ActionResult::failed("provider down")
        });

        let mut good = step("good", "svc", "ok", vec![]);
        good.parallel = true;
        good.parallel_group = Some("g".to_string());
        let mut bad = step("bad", "svc", "fail", vec![]);
        bad.parallel = true;
        bad.parallel_group = Some("g".to_string());

        let engine = engine_with(template(vec![good, bad]), registry);
        let exec = run_to_end(&engine).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(
            exec.step_by_definition("good").unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(
            exec.step_by_definition("bad").unwrap().status,
            StepStatus::Failed
        );
        assert!(exec.error.as_deref().unwrap().contains("provider down"));
    }

    #[tokio::test]
    async fn any_mode_group_succeeds_on_first_winner() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "fast", |_, _| async { ActionResult::ok(json!("won")) });
        registry.register_fn("svc", "slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ActionResult::ok(json!("late"))
        });

        let mut fast = step("fast", "svc", "fast", vec![]);
        fast.parallel = true;
        fast.parallel_group = Some("race".to_string());
        fast.parallel_mode = ParallelMode::Any;
        let mut slow = step("slow", "svc", "slow", vec![]);
        slow.parallel = true;
        slow.parallel_group = Some("race".to_string());
        slow.parallel_mode = ParallelMode::Any;

        let engine = engine_with(template(vec![fast, slow]), registry);
        let exec = run_to_end(&engine).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(
            exec.step_by_definition("fast").unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(
            exec.step_by_definition("slow").unwrap().status,
            StepStatus::Cancelled
        );
        assert_eq!(exec.output.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Retry semantics
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_total_attempts() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "flaky", |_, _| async {
            ActionResult::failed("connection reset")
        });

        let mut flaky = step("flaky", "svc", "flaky", vec![]);
        flaky.retry = Some(RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1000,
            exponential: true,
            max_delay_ms: 8000,
            retryable_errors: None,
        });

        let engine = engine_with(template(vec![flaky]), registry);
        let exec = run_to_end(&engine).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        let error = exec
            .step_by_definition("flaky")
            .unwrap()
            .error
            .clone()
            .unwrap();
        assert!(error.contains("4 attempts"), "unexpected error: {error}");
        assert!(error.contains("connection reset"));
    }

    // -----------------------------------------------------------------------
    // Lifecycle control
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pause_holds_back_pending_steps_until_resume() {
        let gate = Arc::new(Notify::new());
        let gate_in = Arc::clone(&gate);

        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "gated", move |_, _| {
            let gate = Arc::clone(&gate_in);
            async move {
                gate.notified().await;
                ActionResult::ok(json!("released"))
            }
        });
        registry.register_fn("svc", "after", |_, _| async { ActionResult::ok(json!("done")) });

        let engine = engine_with(
            template(vec![
                step("first", "svc", "gated", vec![]),
                step("second", "svc", "after", vec!["first"]),
            ]),
            registry,
        );
        let id = engine.create_from_template("t", Map::new()).unwrap();
        engine.execute(id, Map::new()).await.unwrap();

        // Wait until the controller marks the execution Running.
        loop {
            if engine.status(id).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.pause(id).await.unwrap();
        gate.notify_one();

        // The in-flight step finishes, but the dependent must not start
        // while paused.
        loop {
            let report = engine.status(id).await.unwrap();
            let first = &report.steps[0];
            if first.status == StepStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = engine.status(id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Paused);
        assert_eq!(report.steps[1].status, StepStatus::Pending);

        engine.resume(id).await.unwrap();
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
        let exec = engine.execution(id).await.unwrap();
        assert_eq!(exec.output["second"], json!("done"));
    }

    #[tokio::test]
    async fn cancel_stops_pending_steps_and_keeps_finished_work() {
        let gate = Arc::new(Notify::new());
        let gate_in = Arc::clone(&gate);

        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "gated", move |_, _| {
            let gate = Arc::clone(&gate_in);
            async move {
                gate.notified().await;
                ActionResult::ok(json!("finished anyway"))
            }
        });
        registry.register_fn("svc", "after", |_, _| async {
            panic!("cancelled execution must not start new steps")
        });

        let engine = engine_with(
            template(vec![
                step("first", "svc", "gated", vec![]),
                step("second", "svc", "after", vec!["first"]),
            ]),
            registry,
        );
        let id = engine.create_from_template("t", Map::new()).unwrap();
        engine.execute(id, Map::new()).await.unwrap();

        loop {
            if engine.status(id).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.cancel(id).await.unwrap();
        gate.notify_one();

        let status = engine.wait(id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);
        let exec = engine.execution(id).await.unwrap();
        assert_eq!(
            exec.step_by_definition("first").unwrap().status,
            StepStatus::Completed,
            "running step finishes naturally"
        );
        assert_eq!(
            exec.step_by_definition("second").unwrap().status,
            StepStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn panicking_handler_still_resolves_wait_with_failed() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "explode", |_, _| async {
            panic!("adapter bug")
        });

        let engine = engine_with(
            template(vec![step("boom", "svc", "explode", vec![])]),
            registry,
        );
        let id = engine.create_from_template("t", Map::new()).unwrap();
        engine.execute(id, Map::new()).await.unwrap();

        // Waiters get a real terminal status, not a stuck RUNNING execution.
        let status = engine.wait(id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Failed);

        let exec = engine.execution(id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        let boom = exec.step_by_definition("boom").unwrap();
        assert_eq!(boom.status, StepStatus::Failed);
        assert!(boom.error.as_deref().unwrap().contains("aborted unexpectedly"));
        assert!(exec.finished_at.is_some());

        // The run settled, so lifecycle calls see a terminal execution.
        assert!(matches!(
            engine.cancel(id).await.unwrap_err(),
            EngineError::InvalidStateTransition { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_of_never_started_execution_settles_it() {
        let registry = Arc::new(HandlerRegistry::new());
        let engine = engine_with(
            template(vec![step("a", "svc", "op", vec![])]),
            registry,
        );
        let id = engine.create_from_template("t", Map::new()).unwrap();
        engine.cancel(id).await.unwrap();

        let exec = engine.execution(id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert_eq!(exec.steps[0].status, StepStatus::Cancelled);
        assert!(exec.finished_at.is_some());

        // Terminal executions reject further cancels.
        assert!(matches!(
            engine.cancel(id).await.unwrap_err(),
            EngineError::InvalidStateTransition { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "op", |_, _| async { ActionResult::ok(json!(null)) });
        let engine = engine_with(
            template(vec![step("a", "svc", "op", vec![])]),
            registry,
        );
        let id = engine.create_from_template("t", Map::new()).unwrap();

        // Pause before start.
        assert!(matches!(
            engine.pause(id).await.unwrap_err(),
            EngineError::InvalidStateTransition { .. }
        ));
        // Resume before pause.
        assert!(matches!(
            engine.resume(id).await.unwrap_err(),
            EngineError::InvalidStateTransition { .. }
        ));

        engine.execute(id, Map::new()).await.unwrap();
        engine.wait(id).await.unwrap();
        // Double-start.
        assert!(matches!(
            engine.execute(id, Map::new()).await.unwrap_err(),
            EngineError::InvalidStateTransition { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_execution_id_errors() {
        let registry = Arc::new(HandlerRegistry::new());
        let engine = engine_with(
            template(vec![step("a", "svc", "op", vec![])]),
            registry,
        );
        let missing = Uuid::now_v7();
        assert!(matches!(
            engine.status(missing).await.unwrap_err(),
            EngineError::ExecutionNotFound(_)
        ));
        assert!(matches!(
            engine.execute(missing, Map::new()).await.unwrap_err(),
            EngineError::ExecutionNotFound(_)
        ));
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn status_report_tracks_progress_and_durations() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "op", |_, _| async { ActionResult::ok(json!(null)) });
        let engine = engine_with(
            template(vec![
                step("a", "svc", "op", vec![]),
                step("b", "svc", "op", vec!["a"]),
            ]),
            registry,
        );
        let exec = run_to_end(&engine).await;

        let report = engine.status(exec.id).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.progress_pct, 100);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total, 2);
        assert!(report.steps.iter().all(|s| s.duration_ms.is_some()));

        let perf = engine.performance_report(exec.id).unwrap();
        assert_eq!(perf.steps_recorded, 2);
        assert_eq!(perf.efficiency_pct, 100);
    }

    #[tokio::test]
    async fn deadlocked_execution_fails_with_blocked_steps_named() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("svc", "fail", |_, _| async {
            ActionResult::failed("nope")
        });

        let engine = engine_with(
            template(vec![
                step("root", "svc", "fail", vec![]),
                step("stuck", "svc", "fail", vec!["root"]),
            ]),
            registry,
        );
        let exec = run_to_end(&engine).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(
            exec.step_by_definition("stuck").unwrap().status,
            StepStatus::Pending
        );
        assert!(exec.error.is_some());
    }
}
