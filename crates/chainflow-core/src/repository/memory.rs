//! In-memory `ChainRepository` backed by a `tokio::sync::Mutex`.
//!
//! Implements the same claim and version-check semantics as the SQLite
//! store, so engine tests exercise the real concurrency contract without a
//! database. Also usable for embedding the engine without persistence.

use std::collections::HashMap;

use chainflow_types::chain::{
    ChainDefinition, ChainEntityMapping, ChainExecution, ChainScheduledJob, StepExecution,
};
use chainflow_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::chain::ChainRepository;

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, ChainDefinition>,
    executions: HashMap<Uuid, ChainExecution>,
    steps: HashMap<Uuid, StepExecution>,
    jobs: HashMap<Uuid, ChainScheduledJob>,
    entities: Vec<ChainEntityMapping>,
}

/// In-memory chain repository.
#[derive(Default)]
pub struct InMemoryChainRepository {
    state: Mutex<State>,
}

impl InMemoryChainRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainRepository for InMemoryChainRepository {
    async fn save_definition(&self, def: &ChainDefinition) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ChainDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.definitions.get(id).cloned())
    }

    async fn list_definitions(
        &self,
        family_id: Option<&Uuid>,
    ) -> Result<Vec<ChainDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        let mut defs: Vec<_> = state
            .definitions
            .values()
            .filter(|d| family_id.is_none_or(|f| d.family_id == *f))
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(defs)
    }

    async fn list_enabled_by_trigger(
        &self,
        event_type: &str,
        module: &str,
        family_id: &Uuid,
    ) -> Result<Vec<ChainDefinition>, RepositoryError> {
        let state = self.state.lock().await;
        let mut defs: Vec<_> = state
            .definitions
            .values()
            .filter(|d| {
                d.enabled
                    && d.family_id == *family_id
                    && d.trigger_event_type == event_type
                    && d.trigger_module == module
            })
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(defs)
    }

    async fn create_execution(&self, execution: &ChainExecution) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ChainExecution>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.executions.get(id).cloned())
    }

    async fn update_execution(
        &self,
        execution: &ChainExecution,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .executions
            .get_mut(&execution.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::Conflict(format!(
                "execution {} is at version {}, expected {}",
                execution.id, stored.version, expected_version
            )));
        }
        let mut updated = execution.clone();
        updated.version = expected_version + 1;
        *stored = updated;
        Ok(())
    }

    async fn list_running_executions(&self) -> Result<Vec<ChainExecution>, RepositoryError> {
        use chainflow_types::chain::ChainExecutionStatus;
        let state = self.state.lock().await;
        let mut executions: Vec<_> = state
            .executions
            .values()
            .filter(|e| {
                matches!(
                    e.status,
                    ChainExecutionStatus::Pending | ChainExecutionStatus::Running
                )
            })
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(executions)
    }

    async fn create_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .steps
            .get_mut(&step.id)
            .ok_or(RepositoryError::NotFound)?;
        *stored = step.clone();
        Ok(())
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<StepExecution>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.steps.get(id).cloned())
    }

    async fn list_steps(&self, execution_id: &Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        let state = self.state.lock().await;
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|s| s.execution_id == *execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn create_job(&self, job: &ChainScheduledJob) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ChainScheduledJob>, RepositoryError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.picked_up_at.is_none() && j.scheduled_at <= now)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn claim_job(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if job.picked_up_at.is_some() {
            return Ok(false);
        }
        job.picked_up_at = Some(now);
        Ok(true)
    }

    async fn complete_job(&self, id: &Uuid, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        job.completed_at = Some(now);
        Ok(())
    }

    async fn fail_job(
        &self,
        id: &Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(id).ok_or(RepositoryError::NotFound)?;
        job.retry_count += 1;
        job.failed_at = Some(now);
        job.error = Some(error.to_string());
        Ok(())
    }

    async fn reset_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for job in state.jobs.values_mut() {
            let stale = job.completed_at.is_none()
                && job.failed_at.is_none()
                && job.picked_up_at.is_some_and(|t| t < older_than);
            if stale {
                job.picked_up_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn record_entity(&self, mapping: &ChainEntityMapping) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        state.entities.push(mapping.clone());
        Ok(())
    }

    async fn list_entities(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ChainEntityMapping>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .iter()
            .filter(|m| m.execution_id == *execution_id)
            .cloned()
            .collect())
    }
}
