//! Per-execution controller task.
//!
//! Each running execution is driven by exactly one controller task that owns
//! the scheduling loop: compute the ready set under the write lock, mark the
//! chosen steps Running, run sequential steps inline and spawn parallel
//! groups into an in-flight [`JoinSet`], then apply outcomes as they join.
//! When nothing is ready and work is in flight, the loop parks on
//! `join_next` (or a cancel/resume signal) rather than polling. Deadlock is
//! only judged when nothing is in flight, so a blocked-on-running step never
//! counts as deadlocked.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_types::error::EngineError;
use relay_types::workflow::{ExecutionStatus, ParallelMode, StepStatus, WorkflowExecution};
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::dag;
use super::dispatch::ActionDispatcher;
use super::monitor::PerformanceMonitor;
use super::parallel;
use super::runner::{self, StepOutcome, StepTask};

/// Execution state shared between the controller task and the engine's
/// control surface.
pub type SharedExecution = Arc<RwLock<WorkflowExecution>>;

/// Control signals wired between the engine and one controller task.
pub struct ExecutionSignals {
    /// Fired by `cancel`; stops scheduling new steps.
    pub cancel: CancellationToken,
    /// Pinged by `resume` to wake a paused controller.
    pub resume: Arc<Notify>,
    /// Broadcasts execution status transitions to waiters. Shared so the
    /// engine can still announce a terminal status if the controller task
    /// dies before finalizing.
    pub status_tx: Arc<watch::Sender<ExecutionStatus>>,
}

/// One scheduling pass: what to run now, plus the idle diagnosis when
/// nothing is runnable.
struct SchedulePass {
    sequential: Vec<StepTask>,
    groups: Vec<(ParallelMode, Vec<StepTask>)>,
    deadlocked: bool,
    blocked: Vec<String>,
}

// ---------------------------------------------------------------------------
// ExecutionController
// ---------------------------------------------------------------------------

/// Drives one execution from PENDING to a terminal status.
pub struct ExecutionController {
    execution: SharedExecution,
    dispatcher: Arc<dyn ActionDispatcher>,
    monitor: Arc<PerformanceMonitor>,
    signals: ExecutionSignals,
}

impl ExecutionController {
    pub fn new(
        execution: SharedExecution,
        dispatcher: Arc<dyn ActionDispatcher>,
        monitor: Arc<PerformanceMonitor>,
        signals: ExecutionSignals,
    ) -> Self {
        Self {
            execution,
            dispatcher,
            monitor,
            signals,
        }
    }

    /// Run the execution to completion. Consumes the controller; the engine
    /// spawns this as the execution's task.
    pub async fn run(self) {
        let execution_id = {
            let mut exec = self.execution.write().await;
            if self.signals.cancel.is_cancelled() || exec.status.is_terminal() {
                drop(exec);
                self.finalize(true, None).await;
                return;
            }
            exec.status = ExecutionStatus::Running;
            exec.started_at = Some(Utc::now());
            let _ = self.signals.status_tx.send(ExecutionStatus::Running);
            exec.id
        };

        self.monitor.record_start(execution_id);
        tracing::info!(%execution_id, "execution started");

        let mut inflight: JoinSet<Vec<StepOutcome>> = JoinSet::new();
        let mut cancelled = false;
        let mut deadlock: Option<Vec<String>> = None;

        'outer: loop {
            if self.signals.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if self.is_paused().await {
                tokio::select! {
                    _ = self.signals.resume.notified() => {}
                    _ = self.signals.cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    Some(joined) = inflight.join_next() => {
                        self.apply_joined(joined).await;
                    }
                }
                continue;
            }

            let pass = self.schedule_pass().await;

            if pass.sequential.is_empty() && pass.groups.is_empty() {
                if inflight.is_empty() {
                    if pass.deadlocked {
                        deadlock = Some(pass.blocked);
                    }
                    break;
                }
                // Idle: park until in-flight work joins or cancel fires.
                tokio::select! {
                    Some(joined) = inflight.join_next() => {
                        self.apply_joined(joined).await;
                    }
                    _ = self.signals.cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                }
                continue;
            }

            for (mode, tasks) in pass.groups {
                inflight.spawn(parallel::run_group(mode, tasks));
            }

            for task in pass.sequential {
                if self.signals.cancel.is_cancelled() {
                    cancelled = true;
                    break 'outer;
                }
                let outcome = self.run_sequential(task).await;
                self.apply_outcomes(vec![outcome]).await;
            }
        }

        // In-flight batches finish naturally; cancellation stops new steps
        // from starting but does not abandon running ones.
        while let Some(joined) = inflight.join_next().await {
            self.apply_joined(joined).await;
        }

        self.finalize(cancelled, deadlock).await;
    }

    async fn is_paused(&self) -> bool {
        self.execution.read().await.status == ExecutionStatus::Paused
    }

    /// Run one sequential step in its own task so a panicking handler fails
    /// the step instead of unwinding the controller, matching the parallel
    /// path's containment.
    async fn run_sequential(&self, task: StepTask) -> StepOutcome {
        let step_id = task.step_id;
        let definition_id = task.definition_id.clone();
        let service = task.service.clone();

        match tokio::spawn(runner::run_step(task)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    step_id = %step_id,
                    %definition_id,
                    error = %err,
                    "step task panicked"
                );
                StepOutcome {
                    step_id,
                    definition_id,
                    service,
                    status: StepStatus::Failed,
                    result: None,
                    error: Some("step task aborted unexpectedly".to_string()),
                    duration: Duration::ZERO,
                }
            }
        }
    }

    /// Compute the ready set, mark chosen steps Running, and snapshot them
    /// into tasks. Sequential steps keep definition order; parallel steps are
    /// batched by group name with the first member's mode.
    async fn schedule_pass(&self) -> SchedulePass {
        let mut exec = self.execution.write().await;
        let ready = dag::ready_steps(&exec);

        if ready.is_empty() {
            return SchedulePass {
                sequential: Vec::new(),
                groups: Vec::new(),
                deadlocked: dag::is_deadlocked(&exec),
                blocked: dag::blocked_steps(&exec),
            };
        }

        let context = exec.context.clone();
        let mut sequential = Vec::new();
        let mut groups: Vec<(String, ParallelMode, Vec<StepTask>)> = Vec::new();

        for id in ready {
            let Some(step) = exec.step_mut(id) else {
                continue;
            };
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            let task = StepTask::from_step(step, &context, Arc::clone(&self.dispatcher));

            if step.parallel {
                let group = step
                    .parallel_group
                    .clone()
                    .unwrap_or_else(|| "default".to_string());
                match groups.iter_mut().find(|(name, _, _)| *name == group) {
                    Some((_, _, members)) => members.push(task),
                    None => groups.push((group, step.parallel_mode, vec![task])),
                }
            } else {
                sequential.push(task);
            }
        }

        SchedulePass {
            sequential,
            groups: groups
                .into_iter()
                .map(|(_, mode, members)| (mode, members))
                .collect(),
            deadlocked: false,
            blocked: Vec::new(),
        }
    }

    async fn apply_joined(&self, joined: Result<Vec<StepOutcome>, JoinError>) {
        match joined {
            Ok(outcomes) => self.apply_outcomes(outcomes).await,
            Err(err) => tracing::error!(error = %err, "parallel group task failed to join"),
        }
    }

    /// Apply terminal step outcomes under the write lock. Completed results
    /// land in `context.steps` keyed by definition id; every outcome is
    /// reported to the monitor.
    async fn apply_outcomes(&self, outcomes: Vec<StepOutcome>) {
        let mut exec = self.execution.write().await;
        let execution_id = exec.id;

        for outcome in outcomes {
            tracing::debug!(
                %execution_id,
                step_id = %outcome.step_id,
                definition_id = %outcome.definition_id,
                status = ?outcome.status,
                duration_ms = outcome.duration.as_millis() as u64,
                "step finished"
            );

            if outcome.status == StepStatus::Completed {
                let value = outcome.result.clone().unwrap_or(Value::Null);
                if let Some(Value::Object(steps)) = exec.context.get_mut("steps") {
                    steps.insert(outcome.definition_id.clone(), value);
                }
            }

            self.monitor.record_step(
                execution_id,
                &outcome.service,
                outcome.duration,
                outcome.status,
            );

            if let Some(step) = exec.step_mut(outcome.step_id) {
                step.status = outcome.status;
                step.result = outcome.result;
                step.error = outcome.error;
                step.finished_at = Some(Utc::now());
            }
        }
    }

    /// Stamp the terminal status, cancel leftover steps on cancellation,
    /// build the output map from completed results, and notify waiters.
    async fn finalize(&self, cancelled: bool, deadlock: Option<Vec<String>>) {
        let mut exec = self.execution.write().await;
        let now = Utc::now();
        exec.finished_at = Some(now);
        if exec.started_at.is_none() {
            exec.started_at = Some(now);
        }

        let status = if cancelled {
            // Steps never dispatched stay out of terminal Failed/Completed.
            for step in exec.steps.iter_mut() {
                if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                    step.status = StepStatus::Cancelled;
                    step.finished_at = Some(now);
                }
            }
            ExecutionStatus::Cancelled
        } else if exec.steps.iter().any(|s| s.status == StepStatus::Failed) {
            // Step failures outrank a deadlock they may have caused.
            let summary: Vec<String> = exec
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .map(|s| {
                    EngineError::StepFailed {
                        step_id: s.definition_id.clone(),
                        error: s.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                    }
                    .to_string()
                })
                .collect();
            exec.error = Some(summary.join("; "));
            ExecutionStatus::Failed
        } else if let Some(blocked) = deadlock {
            exec.error = Some(EngineError::Deadlock(blocked).to_string());
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        exec.status = status;

        let mut output = Map::new();
        for step in &exec.steps {
            if step.status == StepStatus::Completed {
                output.insert(
                    step.definition_id.clone(),
                    step.result.clone().unwrap_or(Value::Null),
                );
            }
        }
        exec.output = output;

        tracing::info!(
            execution_id = %exec.id,
            status = ?status,
            completed = exec.count_status(StepStatus::Completed),
            failed = exec.count_status(StepStatus::Failed),
            skipped = exec.count_status(StepStatus::Skipped),
            "execution finished"
        );
        let _ = self.signals.status_tx.send(status);
    }
}

/// Build a fresh signal bundle plus the watch receiver the engine keeps.
pub fn make_signals(initial: ExecutionStatus) -> (ExecutionSignals, watch::Receiver<ExecutionStatus>) {
    let (status_tx, status_rx) = watch::channel(initial);
    (
        ExecutionSignals {
            cancel: CancellationToken::new(),
            resume: Arc::new(Notify::new()),
            status_tx: Arc::new(status_tx),
        },
        status_rx,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
