//! Workflow domain types for Relay.
//!
//! Defines the template side (reusable, parameterized step graphs) and the
//! execution side (per-run instances with mutable status). Templates are
//! immutable after publish; every run clones the template's steps into
//! execution-owned `Step` instances with fresh ids.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Template
// ---------------------------------------------------------------------------

/// A reusable, parameterized blueprint for producing workflow executions.
///
/// Immutable after publish: changing a template means publishing a new
/// version. Step parameter values that are exactly `${name}` are substituted
/// from caller parameters (layered over `parameters` defaults) when the
/// template is instantiated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Stable template slug (e.g. "customer-onboarding").
    pub id: String,
    /// Human-readable template name.
    pub name: String,
    /// Grouping category (e.g. "sales", "billing").
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Placeholder defaults: `${name}` references resolve against caller
    /// parameters layered over these values.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step id (e.g. "send-welcome"). Unique within a template.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Target service capability (e.g. "crm").
    pub service: String,
    /// Action within the service (e.g. "create_contact").
    pub action: String,
    /// Action parameters. Values exactly equal to `${name}` are substituted
    /// whole-value-only at instantiation; unresolved placeholders pass
    /// through unchanged.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Step ids this step depends on (DAG edges within the same template).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether this step is eligible for concurrent execution.
    #[serde(default)]
    pub parallel: bool,
    /// Named parallel group; parallel steps without a group share a default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Concurrency semantics for the step's parallel group.
    #[serde(default)]
    pub parallel_mode: ParallelMode,
    /// Conditional gate: evaluated against the run context; a false or
    /// errored rule marks the step Skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionalRule>,
    /// Step-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry configuration for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Concurrency semantics for a parallel group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    /// Launch every member concurrently; wait for all terminal statuses.
    #[default]
    All,
    /// First member to succeed wins; remaining members are cancelled.
    #[serde(alias = "first_success")]
    Any,
    /// Serial execution with a fixed inter-step gap.
    Delayed,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Bounded, backed-off retry configuration for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure (total attempts =
    /// `max_retries + 1`).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Double the delay after each failed attempt, capped at `max_delay_ms`.
    #[serde(default = "default_exponential")]
    pub exponential: bool,
    /// Upper bound on any single backoff delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Allow-list of retryable error substrings. An error matching none of
    /// the entries fails immediately without further attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<String>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            exponential: default_exponential(),
            max_delay_ms: default_max_delay_ms(),
            retryable_errors: None,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_exponential() -> bool {
    true
}

fn default_max_delay_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Conditional Rule
// ---------------------------------------------------------------------------

/// A boolean rule tree evaluated against the run context.
///
/// Comparison operators use `path` (dot-path into the context) and `value`
/// (literal operand); `And`/`Or` recurse over `rules`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub op: ConditionOp,
    /// Dot-path into the context map (e.g. "steps.check-balance.total").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Literal right-hand operand for comparison operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Nested rules for `And`/`Or`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ConditionalRule>,
}

impl ConditionalRule {
    /// Build a comparison rule (`path <op> value`).
    pub fn compare(op: ConditionOp, path: impl Into<String>, value: Value) -> Self {
        Self {
            op,
            path: Some(path.into()),
            value: Some(value),
            rules: Vec::new(),
        }
    }

    /// Build an `And` over nested rules.
    pub fn all(rules: Vec<ConditionalRule>) -> Self {
        Self {
            op: ConditionOp::And,
            path: None,
            value: None,
            rules,
        }
    }

    /// Build an `Or` over nested rules.
    pub fn any(rules: Vec<ConditionalRule>) -> Self {
        Self {
            op: ConditionOp::Or,
            path: None,
            value: None,
            rules,
        }
    }
}

/// Operators supported by [`ConditionalRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    And,
    Or,
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of an individual step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The step's conditional gate evaluated false (or errored).
    Skipped,
    /// The step was still pending when its execution was cancelled, or it
    /// lost an any-mode parallel race.
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Step (execution instance)
// ---------------------------------------------------------------------------

/// A per-execution clone of a [`StepDefinition`] with mutable run state.
///
/// `depends_on` holds *instance* ids: the template's string references are
/// rewritten through an id-remap table when the execution is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Freshly generated instance id.
    pub id: Uuid,
    /// The template-local definition id this instance was cloned from.
    pub definition_id: String,
    pub name: String,
    pub service: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    /// Instance ids of the steps this one depends on.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub parallel_mode: ParallelMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionalRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Workflow Execution
// ---------------------------------------------------------------------------

/// A single runnable instance of a workflow.
///
/// Exclusively owns its cloned steps; the shared `context` is readable by
/// conditional gates and written only by the execution controller after a
/// step reaches a terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    /// Source template id, when created from a template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub name: String,
    pub steps: Vec<Step>,
    /// Shared run context: the caller's `input` object plus a `steps` object
    /// keyed by definition id with each completed step's result.
    #[serde(default)]
    pub context: Map<String, Value>,
    pub status: ExecutionStatus,
    /// Index of parallel group name to member step instance ids.
    #[serde(default)]
    pub parallel_groups: HashMap<String, Vec<Uuid>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Aggregated results of COMPLETED steps, keyed by definition id.
    /// Populated when the execution finalizes.
    #[serde(default)]
    pub output: Map<String, Value>,
    /// Terminal error text (deadlock report or failed-step summary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// Look up a step by instance id.
    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Look up a step by instance id, mutably.
    pub fn step_mut(&mut self, id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Look up a step by its template-local definition id.
    pub fn step_by_definition(&self, definition_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.definition_id == definition_id)
    }

    /// Count steps currently in the given status.
    pub fn count_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
