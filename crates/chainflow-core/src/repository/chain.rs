//! Chain repository trait definition.
//!
//! Defines the storage interface for chain definitions, executions, step
//! executions, scheduled retry jobs, and entity mappings. The infrastructure
//! layer (chainflow-infra) implements this trait with SQLite persistence.

use chainflow_types::chain::{
    ChainDefinition, ChainEntityMapping, ChainExecution, ChainScheduledJob, StepExecution,
};
use chainflow_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository trait for chain persistence.
///
/// Covers five entity families:
/// - **Definitions:** CRUD for chain definitions (the authoring model).
/// - **Executions:** Create/update/query chain execution instances.
/// - **Steps:** Create/update/query per-step execution records.
/// - **Jobs:** Scheduled retry jobs with atomic claiming.
/// - **Entity mappings:** Append-only records of entities created by steps.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ChainRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a chain definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &ChainDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a chain definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ChainDefinition>, RepositoryError>> + Send;

    /// List chain definitions, optionally filtered by family.
    fn list_definitions(
        &self,
        family_id: Option<&Uuid>,
    ) -> impl std::future::Future<Output = Result<Vec<ChainDefinition>, RepositoryError>> + Send;

    /// List enabled definitions matching a trigger, scoped to a family.
    fn list_enabled_by_trigger(
        &self,
        event_type: &str,
        module: &str,
        family_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ChainDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new chain execution record.
    fn create_execution(
        &self,
        execution: &ChainExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a chain execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ChainExecution>, RepositoryError>> + Send;

    /// Update an execution's mutable fields, guarded by an optimistic
    /// version check.
    ///
    /// The store bumps the row version to `expected_version + 1` on success
    /// and rejects with `RepositoryError::Conflict` when the stored version
    /// no longer equals `expected_version`. A conflicting writer must
    /// re-read and retry.
    fn update_execution(
        &self,
        execution: &ChainExecution,
        expected_version: u32,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List executions left in a non-terminal running state (crash recovery).
    fn list_running_executions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ChainExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Create a new step execution record.
    fn create_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a step execution (full row by ID).
    fn update_step(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a step execution by its UUID.
    fn get_step(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// List all step executions for an execution, ordered by step_order ASC.
    fn list_steps(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Scheduled jobs
    // -----------------------------------------------------------------------

    /// Create a scheduled retry job.
    fn create_job(
        &self,
        job: &ChainScheduledJob,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List unclaimed jobs due at or before `now`, oldest first.
    fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ChainScheduledJob>, RepositoryError>> + Send;

    /// Atomically claim a job by stamping `picked_up_at`.
    ///
    /// Returns `true` iff this caller won the claim. The claim only succeeds
    /// when the job is still unclaimed, so at most one poller wins even with
    /// concurrent scheduler instances.
    fn claim_job(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark a claimed job as successfully dispatched.
    fn complete_job(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record a dispatch failure against a claimed job.
    fn fail_job(
        &self,
        id: &Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Clear the claim on jobs picked up before `older_than` that never
    /// completed. Returns the number of claims reset.
    fn reset_stale_claims(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Entity mappings
    // -----------------------------------------------------------------------

    /// Record an entity created by a step. Append-only.
    fn record_entity(
        &self,
        mapping: &ChainEntityMapping,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List entity mappings for an execution, in creation order.
    fn list_entities(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ChainEntityMapping>, RepositoryError>> + Send;
}
