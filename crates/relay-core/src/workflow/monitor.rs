//! Per-execution performance aggregation.
//!
//! The controller reports every terminal step outcome here; the monitor
//! keeps raw timings and turns them into a [`PerformanceReport`] on demand.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_types::workflow::StepStatus;
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StepTiming {
    service: String,
    duration: Duration,
    status: StepStatus,
}

#[derive(Debug, Clone)]
struct ExecutionMetrics {
    started_at: DateTime<Utc>,
    timings: Vec<StepTiming>,
}

/// Aggregated view of one execution's step timings.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub steps_recorded: usize,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    /// Terminal step counts keyed by status.
    pub status_counts: HashMap<StepStatus, usize>,
    /// Summed step durations per service, in milliseconds.
    pub service_totals_ms: HashMap<String, u64>,
    /// completed / recorded * 100, rounded down. 100 when nothing recorded.
    pub efficiency_pct: u8,
}

// ---------------------------------------------------------------------------
// PerformanceMonitor
// ---------------------------------------------------------------------------

/// Collects step timings across concurrent executions.
#[derive(Default)]
pub struct PerformanceMonitor {
    metrics: DashMap<Uuid, ExecutionMetrics>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an execution as started. Idempotent.
    pub fn record_start(&self, execution_id: Uuid) {
        self.metrics.entry(execution_id).or_insert_with(|| ExecutionMetrics {
            started_at: Utc::now(),
            timings: Vec::new(),
        });
    }

    /// Record one terminal step outcome.
    pub fn record_step(
        &self,
        execution_id: Uuid,
        service: &str,
        duration: Duration,
        status: StepStatus,
    ) {
        let mut entry = self.metrics.entry(execution_id).or_insert_with(|| ExecutionMetrics {
            started_at: Utc::now(),
            timings: Vec::new(),
        });
        entry.timings.push(StepTiming {
            service: service.to_string(),
            duration,
            status,
        });
    }

    /// Build the aggregate report for one execution, or `None` if it was
    /// never recorded.
    pub fn report(&self, execution_id: Uuid) -> Option<PerformanceReport> {
        let entry = self.metrics.get(&execution_id)?;
        let timings = &entry.timings;

        let durations_ms: Vec<u64> =
            timings.iter().map(|t| t.duration.as_millis() as u64).collect();
        let total: u64 = durations_ms.iter().sum();

        let mut status_counts: HashMap<StepStatus, usize> = HashMap::new();
        let mut service_totals_ms: HashMap<String, u64> = HashMap::new();
        for timing in timings {
            *status_counts.entry(timing.status).or_default() += 1;
            *service_totals_ms.entry(timing.service.clone()).or_default() +=
                timing.duration.as_millis() as u64;
        }

        let completed = status_counts
            .get(&StepStatus::Completed)
            .copied()
            .unwrap_or(0);
        let efficiency_pct = if timings.is_empty() {
            100
        } else {
            ((completed * 100) / timings.len()) as u8
        };

        Some(PerformanceReport {
            execution_id,
            started_at: entry.started_at,
            steps_recorded: timings.len(),
            total_duration_ms: total,
            average_duration_ms: if timings.is_empty() {
                0
            } else {
                total / timings.len() as u64
            },
            min_duration_ms: durations_ms.iter().copied().min().unwrap_or(0),
            max_duration_ms: durations_ms.iter().copied().max().unwrap_or(0),
            status_counts,
            service_totals_ms,
            efficiency_pct,
        })
    }

    /// Drop records for an execution (e.g. when it is evicted).
    pub fn forget(&self, execution_id: Uuid) {
        self.metrics.remove(&execution_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
