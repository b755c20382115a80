//! Observability for Chainflow: tracing subscriber setup and span attribute
//! conventions for chain execution instrumentation.

pub mod chain_attrs;
pub mod tracing_setup;
