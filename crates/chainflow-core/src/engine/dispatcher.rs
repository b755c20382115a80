//! Single-step dispatch: condition gating, input resolution, handler
//! invocation with timeout, and retry/backoff policy.
//!
//! The dispatcher is stateless with respect to the execution; the
//! coordinator owns persistence and ordering. Given one step it decides
//! exactly one of: the step completed, the step should be retried after a
//! backoff delay, or the step failed terminally.

use std::sync::Arc;
use std::time::Duration;

use chainflow_types::chain::{ChainDefinitionStep, CreatedEntity, StepExecution};
use chainflow_types::config::EngineConfig;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::ExecutionContext;
use super::expression::ChainEvaluator;
use super::handler::{ActionOutcome, HandlerKey, HandlerRegistry};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What happened when a step was dispatched.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The handler succeeded.
    Completed {
        input: Value,
        output: Value,
        created_entities: Vec<CreatedEntity>,
        duration_ms: u64,
    },
    /// A transient failure with retry budget left; re-dispatch no earlier
    /// than `not_before`.
    Retry {
        input: Value,
        not_before: DateTime<Utc>,
        error: String,
    },
    /// Terminal failure: non-retryable error, exhausted retries, or a
    /// dispatch precondition (input resolution, handler lookup) failed.
    Failed { input: Option<Value>, error: String },
}

// ---------------------------------------------------------------------------
// StepDispatcher
// ---------------------------------------------------------------------------

/// Dispatches one step at a time against the handler registry.
pub struct StepDispatcher {
    registry: Arc<HandlerRegistry>,
    evaluator: ChainEvaluator,
    step_timeout: Duration,
    retry_base_delay_secs: u64,
    retry_max_delay_secs: u64,
}

impl StepDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            evaluator: ChainEvaluator::new(),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            retry_base_delay_secs: config.retry_base_delay_secs,
            retry_max_delay_secs: config.retry_max_delay_secs,
        }
    }

    /// Evaluate the step's guard condition against the execution context.
    ///
    /// A step without a condition always runs. An evaluation error is
    /// reported as `Err` and treated by the coordinator as a terminal step
    /// failure, never a silent skip.
    pub fn should_run(
        &self,
        def_step: &ChainDefinitionStep,
        context: &ExecutionContext,
    ) -> Result<bool, String> {
        let Some(condition) = &def_step.condition else {
            return Ok(true);
        };
        self.evaluator
            .evaluate_bool(condition, &context.to_expression_context())
            .map_err(|e| format!("condition '{condition}' failed: {e}"))
    }

    /// Resolve the step input and invoke its handler, bounded by the step
    /// timeout. Timeouts count as transient failures.
    pub async fn dispatch(
        &self,
        def_step: &ChainDefinitionStep,
        step: &StepExecution,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> DispatchOutcome {
        let expr_context = context.to_expression_context();
        let input = match self
            .evaluator
            .resolve_input_mapping(&def_step.input_mapping, &expr_context)
        {
            Ok(input) => input,
            Err(e) => {
                return DispatchOutcome::Failed {
                    input: None,
                    error: format!("input mapping failed: {e}"),
                };
            }
        };

        let key = HandlerKey::new(
            def_step.action_type.clone(),
            def_step.module.clone(),
            def_step.action_version.clone(),
        );
        let Some(handler) = self.registry.get(&key) else {
            return DispatchOutcome::Failed {
                input: Some(input),
                error: format!("no handler registered for {key}"),
            };
        };

        let started = std::time::Instant::now();
        let invocation = handler.execute_boxed(input.clone(), cancel);
        let outcome = match tokio::time::timeout(self.step_timeout, invocation).await {
            Ok(outcome) => outcome,
            Err(_) => ActionOutcome::retryable(format!(
                "handler {key} timed out after {}s",
                self.step_timeout.as_secs()
            )),
        };

        match outcome {
            ActionOutcome::Success {
                output,
                created_entities,
            } => DispatchOutcome::Completed {
                input,
                output,
                created_entities,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            ActionOutcome::Failure { retryable, message } => {
                if retryable && step.can_retry() {
                    DispatchOutcome::Retry {
                        input,
                        not_before: Utc::now() + self.backoff_delay(step.retry_count),
                        error: message,
                    }
                } else {
                    DispatchOutcome::Failed {
                        input: Some(input),
                        error: message,
                    }
                }
            }
        }
    }

    /// Invoke a step's compensation handler with the step's recorded output.
    ///
    /// Compensation is never retried; any failure (including timeout or a
    /// missing handler) is returned as an error and stops the walk.
    pub async fn compensate(
        &self,
        def_step: &ChainDefinitionStep,
        recorded_output: Value,
        cancel: CancellationToken,
    ) -> Result<Value, String> {
        let Some(action_type) = &def_step.compensation_action_type else {
            return Err(format!(
                "step '{}' has no compensation action",
                def_step.alias
            ));
        };
        let key = HandlerKey::new(
            action_type.clone(),
            def_step.module.clone(),
            def_step.action_version.clone(),
        );
        let Some(handler) = self.registry.get(&key) else {
            return Err(format!("no handler registered for {key}"));
        };

        let invocation = handler.execute_boxed(recorded_output, cancel);
        let outcome = tokio::time::timeout(self.step_timeout, invocation)
            .await
            .map_err(|_| {
                format!(
                    "compensation handler {key} timed out after {}s",
                    self.step_timeout.as_secs()
                )
            })?;

        match outcome {
            ActionOutcome::Success { output, .. } => Ok(output),
            ActionOutcome::Failure { message, .. } => Err(message),
        }
    }

    /// Exponential backoff: `base * 2^retry_count`, capped at the maximum.
    pub fn backoff_delay(&self, retry_count: u32) -> chrono::Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let secs = self
            .retry_base_delay_secs
            .saturating_mul(factor)
            .min(self.retry_max_delay_secs);
        chrono::Duration::seconds(secs as i64)
    }
}

impl std::fmt::Debug for StepDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDispatcher")
            .field("step_timeout", &self.step_timeout)
            .field("retry_base_delay_secs", &self.retry_base_delay_secs)
            .field("retry_max_delay_secs", &self.retry_max_delay_secs)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
