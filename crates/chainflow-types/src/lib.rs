//! Shared domain types for Chainflow.
//!
//! This crate contains the core domain types of the event-chain orchestration
//! engine: chain definitions, executions, step state, scheduled retry jobs,
//! entity mappings, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod chain;
pub mod config;
pub mod error;
pub mod event;
