//! The orchestration engine: the "brain" of Chainflow.
//!
//! - `context` -- execution context with step output tracking and size limits
//! - `expression` -- JEXL evaluator for conditions and input mappings
//! - `handler` -- pluggable action handler registry
//! - `dispatcher` -- single-step dispatch with timeout and backoff policy
//! - `coordinator` -- execution lifecycle: start, advance, fail
//! - `compensation` -- reverse-order compensation walk on failure
//! - `scheduler` -- due-date polling loop for retry jobs
//! - `router` -- trigger event to chain definition matching

pub mod compensation;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod expression;
pub mod handler;
pub mod router;
pub mod scheduler;
