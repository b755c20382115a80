//! Orchestration engine and repository trait definitions for Chainflow.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the engine itself: execution coordination, step
//! dispatch, retry scheduling, and compensation. It depends only on
//! `chainflow-types` -- never on `chainflow-infra` or any database/IO crate.

pub mod engine;
pub mod event;
pub mod repository;
