//! Pluggable action handler registry.
//!
//! The engine never knows what a step actually does; it looks up an
//! [`ActionHandler`] by `(action_type, module, version)` and invokes it with
//! the resolved input. Compensation actions are registered under their own
//! key and looked up by `compensation_action_type` with the same module and
//! version.
//!
//! `ActionHandler` uses RPITIT and therefore cannot be a trait object
//! directly; `ActionHandlerDyn` is the object-safe variant with boxed
//! futures, blanket-implemented for every `ActionHandler`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chainflow_types::chain::CreatedEntity;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Handler key
// ---------------------------------------------------------------------------

/// Identifies an action contract: what to do, who owns it, which version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub action_type: String,
    pub module: String,
    pub version: String,
}

impl HandlerKey {
    pub fn new(
        action_type: impl Into<String>,
        module: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            module: module.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.module, self.action_type, self.version)
    }
}

// ---------------------------------------------------------------------------
// Action outcome
// ---------------------------------------------------------------------------

/// The result of one handler invocation.
///
/// Outcomes are data, not errors: a failed action is a normal value that the
/// dispatcher maps to retry or terminal-failure policy. No exception type
/// crosses the handler boundary.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    /// The action succeeded, producing an output and zero or more created
    /// entities for the audit trail.
    Success {
        output: Value,
        created_entities: Vec<CreatedEntity>,
    },
    /// The action failed. `retryable` distinguishes transient failures
    /// (worth a backoff retry) from terminal ones.
    Failure { retryable: bool, message: String },
}

impl ActionOutcome {
    /// A success with no created entities.
    pub fn success(output: Value) -> Self {
        Self::Success {
            output,
            created_entities: Vec::new(),
        }
    }

    /// A transient failure worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failure {
            retryable: true,
            message: message.into(),
        }
    }

    /// A terminal failure; no retry will help.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Failure {
            retryable: false,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionHandler trait
// ---------------------------------------------------------------------------

/// A pluggable action invoked by the dispatcher.
///
/// Handlers receive the resolved JSON input and a cancellation token that
/// fires on engine shutdown. Long-running handlers should observe the token;
/// the dispatcher additionally bounds every invocation with a timeout.
pub trait ActionHandler: Send + Sync {
    fn execute(
        &self,
        input: Value,
        cancel: CancellationToken,
    ) -> impl Future<Output = ActionOutcome> + Send;
}

/// Object-safe version of [`ActionHandler`] with boxed futures.
///
/// Exists solely to enable dynamic dispatch; a blanket implementation is
/// provided for all types implementing `ActionHandler`.
pub trait ActionHandlerDyn: Send + Sync {
    fn execute_boxed(
        &self,
        input: Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ActionOutcome> + Send + '_>>;
}

impl<T: ActionHandler> ActionHandlerDyn for T {
    fn execute_boxed(
        &self,
        input: Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ActionOutcome> + Send + '_>> {
        Box::pin(self.execute(input, cancel))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent registry mapping handler keys to action handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<HandlerKey, Arc<dyn ActionHandlerDyn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a key, replacing any previous registration.
    pub fn register<H: ActionHandler + 'static>(&self, key: HandlerKey, handler: H) {
        self.handlers.insert(key, Arc::new(handler));
    }

    /// Look up the handler for a key.
    pub fn get(&self, key: &HandlerKey) -> Option<Arc<dyn ActionHandlerDyn>> {
        self.handlers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
