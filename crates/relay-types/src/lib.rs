//! Shared domain types for the Relay workflow engine.
//!
//! This crate contains the canonical workflow types: templates, step
//! definitions, execution instances, retry policies, conditional rules, and
//! the engine error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror.

pub mod error;
pub mod workflow;
