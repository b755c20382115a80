//! Span attribute constants for chain execution instrumentation.
//!
//! All constants are string slices usable in `tracing::span!` and
//! `tracing::info_span!` field names, so dashboards can correlate spans
//! across the engine, scheduler, and repository layers.
//!
//! Span naming convention: `"{operation} {chain_name}"`
//! (e.g., `"execute_chain member-onboarding"`)

// --- Chain attributes ---

/// The chain definition name.
pub const CHAIN_NAME: &str = "chain.name";

/// The chain definition UUID.
pub const CHAIN_DEFINITION_ID: &str = "chain.definition_id";

/// The chain execution UUID.
pub const CHAIN_EXECUTION_ID: &str = "chain.execution_id";

/// Correlation id carried across systems for this execution.
pub const CHAIN_CORRELATION_ID: &str = "chain.correlation_id";

/// The owning family (tenant) UUID.
pub const CHAIN_FAMILY_ID: &str = "chain.family_id";

/// Terminal status of the execution (e.g., "completed", "compensated").
pub const CHAIN_STATUS: &str = "chain.status";

// --- Step attributes ---

/// The step alias within the chain.
pub const STEP_ALIAS: &str = "chain.step.alias";

/// The action type dispatched by the step.
pub const STEP_ACTION_TYPE: &str = "chain.step.action_type";

/// Retries consumed by the step so far.
pub const STEP_RETRY_COUNT: &str = "chain.step.retry_count";

// --- Trigger attributes ---

/// Domain event type that started the execution.
pub const TRIGGER_EVENT_TYPE: &str = "chain.trigger.event_type";

/// Module the trigger event originated from.
pub const TRIGGER_MODULE: &str = "chain.trigger.module";

// --- Operation name values ---

/// Driving a chain execution forward.
pub const OP_EXECUTE_CHAIN: &str = "execute_chain";

/// Dispatching a single step action.
pub const OP_DISPATCH_STEP: &str = "dispatch_step";

/// Running compensation for a failed execution.
pub const OP_COMPENSATE_CHAIN: &str = "compensate_chain";

/// Retry scheduler poll cycle.
pub const OP_POLL_RETRIES: &str = "poll_retries";
