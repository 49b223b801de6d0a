//! Workflow orchestration engine for Relay.
//!
//! This crate is the "brain" of the platform: it turns published templates
//! into runnable executions and drives them through a dependency-graph
//! scheduler with parallel groups, conditional gates, bounded retries, and
//! pause/resume/cancel control. Integration adapters stay behind the
//! [`workflow::dispatch::ActionDispatcher`] seam.

pub mod workflow;
