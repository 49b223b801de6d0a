//! Single-step execution unit.
//!
//! A [`StepTask`] is a self-contained snapshot of everything one step needs
//! to run: the capability pair, parameters, gate, retry policy, and a frozen
//! copy of the context. The controller builds tasks under its write lock,
//! then runs them without touching shared state; results flow back as
//! [`StepOutcome`] values that only the controller applies.

use std::sync::Arc;
use std::time::Duration;

use relay_types::workflow::{ConditionalRule, RetryPolicy, Step, StepStatus};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::condition;
use super::dispatch::{ActionDispatcher, ActionResult};
use super::retry;

/// Applied when a step carries no explicit `timeout_secs`.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// StepTask
// ---------------------------------------------------------------------------

/// A runnable snapshot of one step.
#[derive(Clone)]
pub struct StepTask {
    pub step_id: Uuid,
    pub definition_id: String,
    pub service: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub condition: Option<ConditionalRule>,
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryPolicy>,
    /// Frozen context at the moment the step became ready.
    pub context: Value,
    pub dispatcher: Arc<dyn ActionDispatcher>,
}

impl StepTask {
    /// Snapshot a ready step together with the current context.
    pub fn from_step(
        step: &Step,
        context: &Map<String, Value>,
        dispatcher: Arc<dyn ActionDispatcher>,
    ) -> Self {
        Self {
            step_id: step.id,
            definition_id: step.definition_id.clone(),
            service: step.service.clone(),
            action: step.action.clone(),
            parameters: step.parameters.clone(),
            condition: step.condition.clone(),
            timeout_secs: step.timeout_secs,
            retry: step.retry.clone(),
            context: Value::Object(context.clone()),
            dispatcher,
        }
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Terminal result of running (or gating out) one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: Uuid,
    pub definition_id: String,
    pub service: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl StepOutcome {
    pub fn cancelled(task: &StepTask, reason: impl Into<String>) -> Self {
        Self {
            step_id: task.step_id,
            definition_id: task.definition_id.clone(),
            service: task.service.clone(),
            status: StepStatus::Cancelled,
            result: None,
            error: Some(reason.into()),
            duration: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// run_step
// ---------------------------------------------------------------------------

/// Drive one step to a terminal outcome: gate check, then the dispatched
/// action under retry and timeout.
pub async fn run_step(task: StepTask) -> StepOutcome {
    let started = tokio::time::Instant::now();

    // Conditional gate first; a false or errored rule skips the step without
    // dispatching anything.
    if let Some(rule) = &task.condition {
        if !condition::evaluate(rule, &task.context) {
            tracing::debug!(
                step_id = %task.step_id,
                definition_id = %task.definition_id,
                "conditional gate false, skipping step"
            );
            return StepOutcome {
                step_id: task.step_id,
                definition_id: task.definition_id,
                service: task.service,
                status: StepStatus::Skipped,
                result: None,
                error: None,
                duration: started.elapsed(),
            };
        }
    }

    let timeout = Duration::from_secs(task.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS));
    let dispatcher = Arc::clone(&task.dispatcher);
    let attempt = {
        let service = task.service.clone();
        let action = task.action.clone();
        let parameters = task.parameters.clone();
        let context = task.context.clone();
        move || {
            dispatcher.execute(
                &service,
                &action,
                parameters.clone(),
                context.clone(),
            )
        }
    };

    let result = match tokio::time::timeout(
        timeout,
        retry::execute_with_retry(task.retry.as_ref(), attempt),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => ActionResult::failed(format!(
            "step timed out after {}s",
            timeout.as_secs()
        )),
    };

    let duration = started.elapsed();
    let status = if result.success {
        StepStatus::Completed
    } else {
        StepStatus::Failed
    };

    if !result.success {
        tracing::warn!(
            step_id = %task.step_id,
            definition_id = %task.definition_id,
            service = %task.service,
            action = %task.action,
            error = result.error.as_deref().unwrap_or("unknown"),
            "step failed"
        );
    }

    StepOutcome {
        step_id: task.step_id,
        definition_id: task.definition_id,
        service: task.service,
        status,
        result: result.data,
        error: result.error,
        duration,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
