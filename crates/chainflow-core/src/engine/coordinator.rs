//! Execution coordination: start, advance, fail.
//!
//! The coordinator owns the execution lifecycle. It dispatches steps in
//! strict `step_order`, merges outputs into the context, and persists every
//! transition before publishing the matching event, so subscribers never
//! observe uncommitted state.
//!
//! Concurrency: all mutations of one execution flow through a per-execution
//! async mutex (in-process single writer), and every execution write carries
//! an optimistic version check (cross-process single writer). A version
//! conflict re-reads and replays; because step rows commit before the
//! execution row, the replay path sees the already-terminal step and simply
//! advances the index instead of re-invoking the handler.

use std::sync::Arc;

use chainflow_types::chain::{
    ChainDefinition, ChainEntityMapping, ChainExecution, ChainExecutionStatus, ChainScheduledJob,
    StepExecution, StepExecutionStatus, TriggerEvent,
};
use chainflow_observe::chain_attrs;
use chainflow_types::error::{DefinitionError, RepositoryError};
use chainflow_types::event::ChainEvent;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::Instrument;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::compensation::CompensationCoordinator;
use super::context::ExecutionContext;
use super::dispatcher::{DispatchOutcome, StepDispatcher};
use crate::event::bus::EventBus;
use crate::repository::chain::ChainRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the engine's coordination layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("chain definition {0} not found")]
    DefinitionNotFound(Uuid),

    #[error("illegal status transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: ChainExecutionStatus,
        to: ChainExecutionStatus,
    },

    #[error("gave up advancing execution {0} after repeated version conflicts")]
    ConflictRetriesExhausted(Uuid),
}

impl EngineError {
    fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Repository(e) if e.is_conflict())
    }
}

/// Move an execution to `next`, enforcing the status state machine.
pub(crate) fn transition_execution(
    execution: &mut ChainExecution,
    next: ChainExecutionStatus,
) -> Result<(), EngineError> {
    if !execution.status.can_transition_to(next) {
        return Err(EngineError::IllegalTransition {
            from: execution.status,
            to: next,
        });
    }
    execution.status = next;
    Ok(())
}

// ---------------------------------------------------------------------------
// ExecutionCoordinator
// ---------------------------------------------------------------------------

/// Version-conflict replays before giving up on an execution.
const CONFLICT_RETRY_LIMIT: u32 = 5;

/// What one loop iteration decided about the current step.
enum StepDisposition {
    /// The step reached a terminal state; move to the next one.
    Advanced,
    /// A retry was scheduled; the scheduler will resume this execution.
    WaitingForRetry,
    /// The step failed terminally and the chain has been failed.
    ChainFailed,
}

/// Drives chain executions from trigger to terminal state.
pub struct ExecutionCoordinator<R: ChainRepository> {
    repository: Arc<R>,
    dispatcher: Arc<StepDispatcher>,
    event_bus: EventBus,
    compensation: CompensationCoordinator<R>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
}

impl<R: ChainRepository> ExecutionCoordinator<R> {
    pub fn new(repository: Arc<R>, dispatcher: Arc<StepDispatcher>, event_bus: EventBus) -> Self {
        let shutdown = CancellationToken::new();
        let compensation = CompensationCoordinator::new(
            Arc::clone(&repository),
            Arc::clone(&dispatcher),
            event_bus.clone(),
            shutdown.child_token(),
        );
        Self {
            repository,
            dispatcher,
            event_bus,
            compensation,
            locks: DashMap::new(),
            shutdown,
        }
    }

    /// Token cancelled to shut the engine down; handlers receive children
    /// of this token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start a new execution of `definition` for a trigger event and drive
    /// it as far as it can go synchronously.
    ///
    /// The definition must already be persisted; disabled definitions and
    /// definitions without steps are rejected before any row is written.
    /// Returns the execution in its state after the initial advance (which
    /// may be terminal, or Running awaiting a retry).
    pub async fn start(
        &self,
        definition: &ChainDefinition,
        trigger: &TriggerEvent,
    ) -> Result<ChainExecution, EngineError> {
        if !definition.enabled {
            return Err(DefinitionError::Disabled(definition.name.clone()).into());
        }
        if definition.steps().is_empty() {
            return Err(DefinitionError::NoSteps.into());
        }

        let span = tracing::info_span!(
            "chain",
            operation = chain_attrs::OP_EXECUTE_CHAIN,
            { chain_attrs::CHAIN_NAME } = tracing::field::display(&definition.name),
            { chain_attrs::CHAIN_DEFINITION_ID } = tracing::field::display(definition.id),
            { chain_attrs::CHAIN_FAMILY_ID } = tracing::field::display(definition.family_id),
            { chain_attrs::CHAIN_CORRELATION_ID } = tracing::field::display(trigger.event_id),
            { chain_attrs::TRIGGER_EVENT_TYPE } = tracing::field::display(&trigger.event_type),
            { chain_attrs::TRIGGER_MODULE } = tracing::field::display(&trigger.module),
        );
        self.start_inner(definition, trigger).instrument(span).await
    }

    async fn start_inner(
        &self,
        definition: &ChainDefinition,
        trigger: &TriggerEvent,
    ) -> Result<ChainExecution, EngineError> {
        let mut execution =
            ChainExecution::new(definition, trigger.event_id, trigger.payload.clone());
        self.repository.create_execution(&execution).await?;
        for def_step in definition.steps() {
            self.repository
                .create_step(&StepExecution::from_definition_step(execution.id, def_step))
                .await?;
        }

        transition_execution(&mut execution, ChainExecutionStatus::Running)?;
        self.persist(&mut execution).await?;
        tracing::info!(
            execution_id = %execution.id,
            chain = %definition.name,
            trigger = %trigger.event_type,
            "chain execution started"
        );
        self.event_bus.publish(ChainEvent::ChainStarted {
            execution_id: execution.id,
            chain_name: definition.name.clone(),
            family_id: execution.family_id,
            trigger_event_type: trigger.event_type.clone(),
        });

        self.advance(execution.id).await?;

        self.repository
            .get_execution(&execution.id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution.id))
    }

    /// Advance an execution: dispatch steps in order until the execution is
    /// terminal, waiting on a retry, or failed.
    ///
    /// Idempotent: advancing a finalized execution is a no-op with no
    /// status change and no duplicate notifications.
    pub async fn advance(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let lock = self
            .locks
            .entry(execution_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let span = tracing::debug_span!(
            "chain",
            operation = chain_attrs::OP_EXECUTE_CHAIN,
            { chain_attrs::CHAIN_EXECUTION_ID } = tracing::field::display(execution_id),
        );
        let guard = lock.lock().await;
        let status = self.advance_locked(execution_id).instrument(span).await;
        drop(guard);

        if let Ok(status) = &status {
            if status.is_terminal() {
                self.locks.remove(&execution_id);
            }
        }
        status.map(|_| ())
    }

    /// Re-drive every execution left in a non-terminal running state, e.g.
    /// after a crash or restart.
    pub async fn recover(&self) -> Result<u32, EngineError> {
        let running = self.repository.list_running_executions().await?;
        let count = running.len() as u32;
        for execution in running {
            tracing::warn!(execution_id = %execution.id, "recovering in-flight execution");
            self.advance(execution.id).await?;
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn advance_locked(
        &self,
        execution_id: Uuid,
    ) -> Result<ChainExecutionStatus, EngineError> {
        let mut conflicts = 0u32;
        loop {
            match self.advance_once(execution_id).await {
                Ok(Some(stopped_at)) => return Ok(stopped_at),
                Ok(None) => continue,
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > CONFLICT_RETRY_LIMIT {
                        return Err(EngineError::ConflictRetriesExhausted(execution_id));
                    }
                    tracing::warn!(
                        execution_id = %execution_id,
                        attempt = conflicts,
                        "version conflict while advancing, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One iteration of the advance loop. `Ok(None)` means "state moved,
    /// go again"; `Ok(Some(status))` means the loop is done for now.
    async fn advance_once(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ChainExecutionStatus>, EngineError> {
        let mut execution = self
            .repository
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        match execution.status {
            status if status.is_terminal() => return Ok(Some(status)),
            // Failed/Compensating resolve through compensation or an
            // operator, never through advance.
            ChainExecutionStatus::Failed | ChainExecutionStatus::Compensating => {
                return Ok(Some(execution.status));
            }
            ChainExecutionStatus::Pending => {
                transition_execution(&mut execution, ChainExecutionStatus::Running)?;
                self.persist(&mut execution).await?;
            }
            ChainExecutionStatus::Running => {}
            _ => {}
        }

        let definition = self
            .repository
            .get_definition(&execution.chain_definition_id)
            .await?
            .ok_or(EngineError::DefinitionNotFound(execution.chain_definition_id))?;
        let steps = self.repository.list_steps(&execution_id).await?;

        if execution.current_step_index as usize >= steps.len() {
            let status = self.finalize(&mut execution, &steps, &definition).await?;
            return Ok(Some(status));
        }

        let step = steps[execution.current_step_index as usize].clone();
        let disposition = match step.status {
            StepExecutionStatus::Completed | StepExecutionStatus::Skipped => {
                // Committed by an earlier attempt before the execution row
                // caught up; merge and move on without re-running anything.
                self.absorb_committed_step(&mut execution, &definition, &step)
                    .await?;
                StepDisposition::Advanced
            }
            StepExecutionStatus::Retrying => {
                if step.scheduled_at.is_some_and(|due| due <= Utc::now()) {
                    self.dispatch_step(&mut execution, &definition, step).await?
                } else {
                    return Ok(Some(ChainExecutionStatus::Running));
                }
            }
            StepExecutionStatus::Pending | StepExecutionStatus::Running => {
                self.dispatch_step(&mut execution, &definition, step).await?
            }
            StepExecutionStatus::Failed => {
                let error = step.error.clone().unwrap_or_else(|| "step failed".to_string());
                self.fail(&mut execution, &definition, &step.alias, &error)
                    .await?;
                StepDisposition::ChainFailed
            }
            StepExecutionStatus::Compensating | StepExecutionStatus::Compensated => {
                return Ok(Some(execution.status));
            }
        };

        match disposition {
            StepDisposition::Advanced => Ok(None),
            StepDisposition::WaitingForRetry => Ok(Some(ChainExecutionStatus::Running)),
            StepDisposition::ChainFailed => Ok(Some(execution.status)),
        }
    }

    async fn dispatch_step(
        &self,
        execution: &mut ChainExecution,
        definition: &ChainDefinition,
        mut step: StepExecution,
    ) -> Result<StepDisposition, EngineError> {
        let entities = self.repository.list_entities(&execution.id).await?;
        let mut context = ExecutionContext::from_execution(execution, &definition.name, entities);

        let Some(def_step) = definition.step_by_alias(&step.alias) else {
            let error = format!("definition no longer contains step '{}'", step.alias);
            self.mark_step_failed(&mut step, &error).await?;
            self.fail(execution, definition, &step.alias, &error).await?;
            return Ok(StepDisposition::ChainFailed);
        };

        // Guard condition; a Retrying step already passed it.
        if step.status == StepExecutionStatus::Pending {
            match self.dispatcher.should_run(def_step, &context) {
                Ok(true) => {}
                Ok(false) => {
                    step.status = StepExecutionStatus::Skipped;
                    step.completed_at = Some(Utc::now());
                    self.repository.update_step(&step).await?;
                    execution.current_step_index += 1;
                    self.persist(execution).await?;
                    tracing::debug!(
                        execution_id = %execution.id,
                        alias = %step.alias,
                        "step condition false, skipping"
                    );
                    self.event_bus.publish(ChainEvent::StepSkipped {
                        execution_id: execution.id,
                        alias: step.alias.clone(),
                    });
                    return Ok(StepDisposition::Advanced);
                }
                Err(error) => {
                    self.mark_step_failed(&mut step, &error).await?;
                    self.event_bus.publish(ChainEvent::StepFailed {
                        execution_id: execution.id,
                        alias: step.alias.clone(),
                        error: error.clone(),
                        will_retry: false,
                    });
                    self.fail(execution, definition, &step.alias, &error).await?;
                    return Ok(StepDisposition::ChainFailed);
                }
            }
        }

        let resuming = step.status == StepExecutionStatus::Retrying;
        step.status = StepExecutionStatus::Running;
        step.started_at = Some(Utc::now());
        if resuming {
            step.picked_up_at = Some(Utc::now());
        }
        self.repository.update_step(&step).await?;
        self.event_bus.publish(ChainEvent::StepStarted {
            execution_id: execution.id,
            alias: step.alias.clone(),
            action_type: step.action_type.clone(),
        });

        let dispatch_span = tracing::info_span!(
            "step",
            operation = chain_attrs::OP_DISPATCH_STEP,
            { chain_attrs::CHAIN_EXECUTION_ID } = tracing::field::display(execution.id),
            { chain_attrs::STEP_ALIAS } = tracing::field::display(&step.alias),
            { chain_attrs::STEP_ACTION_TYPE } = tracing::field::display(&step.action_type),
            { chain_attrs::STEP_RETRY_COUNT } = step.retry_count,
        );
        let outcome = self
            .dispatcher
            .dispatch(def_step, &step, &context, self.shutdown.child_token())
            .instrument(dispatch_span)
            .await;

        match outcome {
            DispatchOutcome::Completed {
                input,
                output,
                created_entities,
                duration_ms,
            } => {
                step.status = StepExecutionStatus::Completed;
                step.input = Some(input);
                step.output = Some(output.clone());
                step.completed_at = Some(Utc::now());
                self.repository.update_step(&step).await?;

                let mappings: Vec<ChainEntityMapping> = created_entities
                    .iter()
                    .map(|e| {
                        ChainEntityMapping::new(
                            execution.id,
                            step.alias.clone(),
                            e.entity_type.clone(),
                            e.entity_id,
                            e.module.clone(),
                        )
                    })
                    .collect();
                for mapping in &mappings {
                    self.repository.record_entity(mapping).await?;
                }
                context.record_entities(mappings);
                // The handler's side effects are committed; if the context
                // cannot hold the result, the chain must still reach a
                // terminal state rather than replay the overflow forever.
                if let Err(context_error) = context.set_step_output(&step.alias, output) {
                    let error = context_error.to_string();
                    self.event_bus.publish(ChainEvent::StepFailed {
                        execution_id: execution.id,
                        alias: step.alias.clone(),
                        error: error.clone(),
                        will_retry: false,
                    });
                    self.fail(execution, definition, &step.alias, &error).await?;
                    return Ok(StepDisposition::ChainFailed);
                }

                execution.context = context.to_context_value();
                execution.current_step_index += 1;
                self.persist(execution).await?;

                tracing::info!(
                    execution_id = %execution.id,
                    alias = %step.alias,
                    duration_ms,
                    "step completed"
                );
                self.event_bus.publish(ChainEvent::StepCompleted {
                    execution_id: execution.id,
                    alias: step.alias.clone(),
                    duration_ms,
                });
                Ok(StepDisposition::Advanced)
            }
            DispatchOutcome::Retry {
                input,
                not_before,
                error,
            } => {
                step.retry_count += 1;
                step.status = StepExecutionStatus::Retrying;
                step.input = Some(input);
                step.scheduled_at = Some(not_before);
                step.error = Some(error.clone());
                self.repository.update_step(&step).await?;
                self.repository
                    .create_job(&ChainScheduledJob::new(step.id, execution.id, not_before))
                    .await?;

                tracing::warn!(
                    execution_id = %execution.id,
                    alias = %step.alias,
                    retry_count = step.retry_count,
                    %not_before,
                    error = %error,
                    "step failed, retry scheduled"
                );
                self.event_bus.publish(ChainEvent::StepFailed {
                    execution_id: execution.id,
                    alias: step.alias.clone(),
                    error,
                    will_retry: true,
                });
                self.event_bus.publish(ChainEvent::StepRetryScheduled {
                    execution_id: execution.id,
                    alias: step.alias.clone(),
                    not_before,
                });
                Ok(StepDisposition::WaitingForRetry)
            }
            DispatchOutcome::Failed { input, error } => {
                step.status = StepExecutionStatus::Failed;
                step.input = input;
                step.error = Some(error.clone());
                step.completed_at = Some(Utc::now());
                self.repository.update_step(&step).await?;

                self.event_bus.publish(ChainEvent::StepFailed {
                    execution_id: execution.id,
                    alias: step.alias.clone(),
                    error: error.clone(),
                    will_retry: false,
                });
                self.fail(execution, definition, &step.alias, &error).await?;
                Ok(StepDisposition::ChainFailed)
            }
        }
    }

    /// The step row committed but the execution row didn't: merge the step
    /// output into the context and advance the index, without re-running.
    async fn absorb_committed_step(
        &self,
        execution: &mut ChainExecution,
        definition: &ChainDefinition,
        step: &StepExecution,
    ) -> Result<(), EngineError> {
        let entities = self.repository.list_entities(&execution.id).await?;
        let mut context = ExecutionContext::from_execution(execution, &definition.name, entities);
        if step.status == StepExecutionStatus::Completed {
            if let Some(output) = &step.output {
                if let Err(context_error) = context.set_step_output(&step.alias, output.clone()) {
                    self.fail(execution, definition, &step.alias, &context_error.to_string())
                        .await?;
                    return Ok(());
                }
            }
        }
        execution.context = context.to_context_value();
        execution.current_step_index += 1;
        self.persist(execution).await
    }

    async fn mark_step_failed(
        &self,
        step: &mut StepExecution,
        error: &str,
    ) -> Result<(), EngineError> {
        step.status = StepExecutionStatus::Failed;
        step.error = Some(error.to_string());
        step.completed_at = Some(Utc::now());
        self.repository.update_step(step).await?;
        Ok(())
    }

    /// Fail the execution and hand off to compensation when any completed
    /// step is reversible.
    async fn fail(
        &self,
        execution: &mut ChainExecution,
        definition: &ChainDefinition,
        failed_alias: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        transition_execution(execution, ChainExecutionStatus::Failed)?;
        execution.failed_at = Some(Utc::now());
        execution.error = Some(format!("step '{failed_alias}': {error}"));
        self.persist(execution).await?;

        tracing::error!(
            execution_id = %execution.id,
            alias = failed_alias,
            error,
            "chain execution failed"
        );
        self.event_bus.publish(ChainEvent::ChainFailed {
            execution_id: execution.id,
            chain_name: definition.name.clone(),
            failed_step_alias: failed_alias.to_string(),
            error: error.to_string(),
        });

        let steps = self.repository.list_steps(&execution.id).await?;
        let has_compensatable = steps.iter().any(|s| {
            s.status == StepExecutionStatus::Completed
                && definition
                    .step_by_alias(&s.alias)
                    .is_some_and(|d| d.compensatable)
        });
        if has_compensatable {
            self.compensation.compensate(execution.id, definition).await?;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        execution: &mut ChainExecution,
        steps: &[StepExecution],
        definition: &ChainDefinition,
    ) -> Result<ChainExecutionStatus, EngineError> {
        let completed = steps
            .iter()
            .filter(|s| s.status == StepExecutionStatus::Completed)
            .count() as u32;
        let any_skipped = steps
            .iter()
            .any(|s| s.status == StepExecutionStatus::Skipped);
        let status = if any_skipped {
            ChainExecutionStatus::PartiallyCompleted
        } else {
            ChainExecutionStatus::Completed
        };

        transition_execution(execution, status)?;
        execution.completed_at = Some(Utc::now());
        self.persist(execution).await?;

        tracing::info!(
            execution_id = %execution.id,
            chain = %definition.name,
            completed_steps = completed,
            total_steps = steps.len(),
            { chain_attrs::CHAIN_STATUS } = tracing::field::debug(status),
            "chain execution finished"
        );
        self.event_bus.publish(ChainEvent::ChainCompleted {
            execution_id: execution.id,
            chain_name: definition.name.clone(),
            status,
            completed_steps: completed,
            total_steps: steps.len() as u32,
        });
        Ok(status)
    }

    async fn persist(&self, execution: &mut ChainExecution) -> Result<(), EngineError> {
        self.repository
            .update_execution(execution, execution.version)
            .await?;
        execution.version += 1;
        Ok(())
    }
}

impl<R: ChainRepository> std::fmt::Debug for ExecutionCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("active_locks", &self.locks.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
