//! Action dispatch: the narrow seam between the engine and integration
//! adapters.
//!
//! The engine never knows what a `(service, action)` pair does. It hands the
//! pair, the step parameters, and a context snapshot to an
//! [`ActionDispatcher`] and gets back an [`ActionResult`]. The default
//! dispatcher is [`HandlerRegistry`], a concurrent map of named handlers.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

/// Result reported by an action handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    /// A successful result carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed result carrying an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionDispatcher
// ---------------------------------------------------------------------------

/// Executes a named service action. Implemented by the adapter layer; the
/// engine only ever sees this trait.
///
/// Returns a boxed future so the trait stays object-safe (the engine holds
/// an `Arc<dyn ActionDispatcher>`).
pub trait ActionDispatcher: Send + Sync {
    fn execute(
        &self,
        service: &str,
        action: &str,
        parameters: Map<String, Value>,
        context: Value,
    ) -> BoxFuture<'static, ActionResult>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

type HandlerFn =
    dyn Fn(Map<String, Value>, Value) -> BoxFuture<'static, ActionResult> + Send + Sync;

/// Pluggable adapter registry keyed by `(service, action)`.
///
/// Dispatching an unregistered capability yields a failed [`ActionResult`]
/// rather than an engine error: to the workflow it is just a failing step.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<(String, String), Arc<HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure handler for `(service, action)`. Later
    /// registrations replace earlier ones.
    pub fn register_fn<F, Fut>(&self, service: impl Into<String>, action: impl Into<String>, f: F)
    where
        F: Fn(Map<String, Value>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let handler: Arc<HandlerFn> = Arc::new(move |params, ctx| Box::pin(f(params, ctx)));
        self.handlers.insert((service.into(), action.into()), handler);
    }

    /// Whether a handler is registered for `(service, action)`.
    pub fn has(&self, service: &str, action: &str) -> bool {
        self.handlers
            .contains_key(&(service.to_string(), action.to_string()))
    }
}

impl ActionDispatcher for HandlerRegistry {
    fn execute(
        &self,
        service: &str,
        action: &str,
        parameters: Map<String, Value>,
        context: Value,
    ) -> BoxFuture<'static, ActionResult> {
        let key = (service.to_string(), action.to_string());
        match self.handlers.get(&key) {
            Some(handler) => {
                let handler = Arc::clone(&handler);
                handler(parameters, context)
            }
            None => {
                tracing::warn!(service, action, "no handler registered");
                Box::pin(std::future::ready(ActionResult::failed(format!(
                    "no handler registered for {service}.{action}"
                ))))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
