//! Workflow engine core: template instantiation, DAG scheduling, and
//! parallel execution.
//!
//! - `template` -- template registry, validation, instantiation, seeds
//! - `dag` -- topological validation, ready-set computation, deadlock check
//! - `condition` -- fail-closed boolean rule-tree evaluator
//! - `retry` -- bounded retry with exponential backoff
//! - `dispatch` -- action dispatch trait and handler registry
//! - `runner` -- single-step execution unit (gate, retry, timeout)
//! - `parallel` -- parallel-group semantics (all / any / delayed)
//! - `executor` -- the per-execution controller task
//! - `engine` -- in-process control surface
//! - `monitor` -- per-step timing aggregation

pub mod condition;
pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod monitor;
pub mod parallel;
pub mod retry;
pub mod runner;
pub mod template;
