//! Reverse-order compensation of failed executions.
//!
//! Triggered from the coordinator's fail path only. Walks Completed,
//! compensatable steps in strictly descending `step_order`, invoking each
//! step's compensation handler with the step's recorded output as input.
//! A compensation failure stops the walk and leaves the execution in
//! Compensating for manual resolution; it is never auto-retried.

use std::sync::Arc;

use chainflow_observe::chain_attrs;
use chainflow_types::chain::{ChainDefinition, ChainExecutionStatus, StepExecutionStatus};
use chainflow_types::event::ChainEvent;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::coordinator::{EngineError, transition_execution};
use super::dispatcher::StepDispatcher;
use crate::event::bus::EventBus;
use crate::repository::chain::ChainRepository;

/// Walks back through a failed execution, reversing its completed steps.
pub struct CompensationCoordinator<R: ChainRepository> {
    repository: Arc<R>,
    dispatcher: Arc<StepDispatcher>,
    event_bus: EventBus,
    shutdown: CancellationToken,
}

impl<R: ChainRepository> CompensationCoordinator<R> {
    pub fn new(
        repository: Arc<R>,
        dispatcher: Arc<StepDispatcher>,
        event_bus: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            event_bus,
            shutdown,
        }
    }

    /// Compensate a Failed execution.
    ///
    /// No-op for executions in any other status, so a replayed fail path
    /// cannot double-compensate.
    pub async fn compensate(
        &self,
        execution_id: Uuid,
        definition: &ChainDefinition,
    ) -> Result<(), EngineError> {
        let span = tracing::info_span!(
            "compensation",
            operation = chain_attrs::OP_COMPENSATE_CHAIN,
            { chain_attrs::CHAIN_EXECUTION_ID } = tracing::field::display(execution_id),
            { chain_attrs::CHAIN_NAME } = tracing::field::display(&definition.name),
        );
        self.compensate_inner(execution_id, definition)
            .instrument(span)
            .await
    }

    async fn compensate_inner(
        &self,
        execution_id: Uuid,
        definition: &ChainDefinition,
    ) -> Result<(), EngineError> {
        let mut execution = self
            .repository
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.status != ChainExecutionStatus::Failed {
            return Ok(());
        }

        transition_execution(&mut execution, ChainExecutionStatus::Compensating)?;
        self.persist(&mut execution).await?;
        tracing::info!(
            execution_id = %execution.id,
            chain = %definition.name,
            "starting compensation walk"
        );

        let steps = self.repository.list_steps(&execution_id).await?;
        let mut compensated = 0u32;

        for step in steps.iter().rev() {
            if step.status != StepExecutionStatus::Completed {
                continue;
            }
            let Some(def_step) = definition.step_by_alias(&step.alias) else {
                continue;
            };
            if !def_step.compensatable {
                continue;
            }

            let mut step = step.clone();
            step.status = StepExecutionStatus::Compensating;
            self.repository.update_step(&step).await?;

            let recorded_output = step
                .output
                .clone()
                .unwrap_or(Value::Object(serde_json::Map::new()));
            let result = self
                .dispatcher
                .compensate(def_step, recorded_output, self.shutdown.child_token())
                .await;

            match result {
                Ok(_) => {
                    step.status = StepExecutionStatus::Compensated;
                    step.compensated_at = Some(Utc::now());
                    self.repository.update_step(&step).await?;
                    compensated += 1;
                    tracing::debug!(
                        execution_id = %execution.id,
                        alias = %step.alias,
                        "step compensated"
                    );
                }
                Err(message) => {
                    // Walk stops here; the execution stays Compensating
                    // until an operator resolves it.
                    step.error = Some(message.clone());
                    self.repository.update_step(&step).await?;
                    execution.error = Some(match execution.error.take() {
                        Some(prev) => format!(
                            "{prev}; compensation of '{}' failed: {message}",
                            step.alias
                        ),
                        None => format!("compensation of '{}' failed: {message}", step.alias),
                    });
                    self.persist(&mut execution).await?;
                    tracing::error!(
                        execution_id = %execution.id,
                        alias = %step.alias,
                        error = %message,
                        "compensation failed, execution needs manual resolution"
                    );
                    return Ok(());
                }
            }
        }

        transition_execution(&mut execution, ChainExecutionStatus::Compensated)?;
        self.persist(&mut execution).await?;
        tracing::info!(
            execution_id = %execution.id,
            compensated_steps = compensated,
            "compensation walk finished"
        );
        self.event_bus.publish(ChainEvent::ChainCompensated {
            execution_id: execution.id,
            chain_name: definition.name.clone(),
            compensated_steps: compensated,
        });
        Ok(())
    }

    async fn persist(
        &self,
        execution: &mut chainflow_types::chain::ChainExecution,
    ) -> Result<(), EngineError> {
        self.repository
            .update_execution(execution, execution.version)
            .await?;
        execution.version += 1;
        Ok(())
    }
}

impl<R: ChainRepository> std::fmt::Debug for CompensationCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationCoordinator").finish()
    }
}
