//! Parallel-group execution semantics.
//!
//! A parallel group is a set of steps that became ready in the same
//! scheduling pass and share a group name. The group's mode decides how its
//! members run:
//!
//! - `all` -- launch every member concurrently, wait for every terminal
//!   status; member failures surface individually.
//! - `any` -- first member to *succeed* wins; the rest are cancelled.
//! - `delayed` -- members run serially with a fixed gap between launches.

use std::time::Duration;

use relay_types::workflow::{ParallelMode, StepStatus};
use tokio::task::JoinSet;

use super::runner::{self, StepOutcome, StepTask};

/// Gap between successive launches in a `delayed` group.
pub const DELAYED_STEP_GAP_MS: u64 = 250;

/// Run a parallel group to completion and return one outcome per member.
pub async fn run_group(mode: ParallelMode, tasks: Vec<StepTask>) -> Vec<StepOutcome> {
    match mode {
        ParallelMode::All => run_all(tasks).await,
        ParallelMode::Any => run_any(tasks).await,
        ParallelMode::Delayed => run_delayed(tasks).await,
    }
}

/// Every member runs concurrently; we wait for all of them.
async fn run_all(tasks: Vec<StepTask>) -> Vec<StepOutcome> {
    let mut set = JoinSet::new();
    let members: Vec<_> = tasks
        .iter()
        .map(|t| (t.step_id, t.definition_id.clone(), t.service.clone()))
        .collect();

    for task in tasks {
        set.spawn(runner::run_step(task));
    }

    let mut outcomes = Vec::with_capacity(members.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => tracing::error!(error = %err, "parallel group member panicked"),
        }
    }

    // A panicked member never reported; fail it explicitly so the group
    // always accounts for every step.
    for (step_id, definition_id, service) in members {
        if !outcomes.iter().any(|o| o.step_id == step_id) {
            outcomes.push(StepOutcome {
                step_id,
                definition_id,
                service,
                status: StepStatus::Failed,
                result: None,
                error: Some("step task aborted unexpectedly".to_string()),
                duration: Duration::ZERO,
            });
        }
    }
    outcomes
}

/// First success wins; in-flight losers are aborted and reported Cancelled.
async fn run_any(tasks: Vec<StepTask>) -> Vec<StepOutcome> {
    let mut set = JoinSet::new();
    let members: Vec<_> = tasks
        .iter()
        .map(|t| (t.step_id, t.definition_id.clone(), t.service.clone()))
        .collect();

    for task in tasks {
        set.spawn(runner::run_step(task));
    }

    let mut outcomes = Vec::with_capacity(members.len());
    let mut winner = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => {
                let won = outcome.status == StepStatus::Completed;
                outcomes.push(outcome);
                if won && winner.is_none() {
                    winner = Some(());
                    set.abort_all();
                }
            }
            // Aborted losers land here; their Cancelled outcomes are
            // synthesized below.
            Err(_) => {}
        }
    }

    for (step_id, definition_id, service) in members {
        if !outcomes.iter().any(|o| o.step_id == step_id) {
            outcomes.push(StepOutcome {
                step_id,
                definition_id,
                service,
                status: StepStatus::Cancelled,
                result: None,
                error: Some("superseded by first successful group member".to_string()),
                duration: Duration::ZERO,
            });
        }
    }
    outcomes
}

/// Serial execution with a fixed inter-launch gap.
async fn run_delayed(tasks: Vec<StepTask>) -> Vec<StepOutcome> {
    let mut outcomes = Vec::with_capacity(tasks.len());
    let mut first = true;
    for task in tasks {
        if !first {
            tokio::time::sleep(Duration::from_millis(DELAYED_STEP_GAP_MS)).await;
        }
        first = false;
        outcomes.push(runner::run_step(task).await);
    }
    outcomes
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
