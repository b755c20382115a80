//! SQLite chain repository implementation.
//!
//! Implements `ChainRepository` from `chainflow-core` using sqlx with split
//! read/write pools. Chain definitions are stored as JSON blobs alongside
//! indexed trigger columns so the router can match events without
//! deserializing every definition. Executions, steps, jobs, and entity
//! mappings are relational rows forming the audit trail.

use chainflow_core::repository::chain::ChainRepository;
use chainflow_types::chain::{
    ChainDefinition, ChainEntityMapping, ChainExecution, ChainExecutionStatus, ChainScheduledJob,
    StepExecution, StepExecutionStatus,
};
use chainflow_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ChainRepository`.
pub struct SqliteChainRepository {
    pool: DatabasePool,
}

impl SqliteChainRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ChainDefRow {
    definition: String,
}

impl ChainDefRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<ChainDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid chain definition JSON: {e}")))
    }
}

struct ExecutionRow {
    id: String,
    chain_definition_id: String,
    family_id: String,
    correlation_id: String,
    status: String,
    trigger_event_type: String,
    trigger_event_id: String,
    trigger_payload: Option<String>,
    context: String,
    current_step_index: i64,
    version: i64,
    started_at: String,
    completed_at: Option<String>,
    failed_at: Option<String>,
    error: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            chain_definition_id: row.try_get("chain_definition_id")?,
            family_id: row.try_get("family_id")?,
            correlation_id: row.try_get("correlation_id")?,
            status: row.try_get("status")?,
            trigger_event_type: row.try_get("trigger_event_type")?,
            trigger_event_id: row.try_get("trigger_event_id")?,
            trigger_payload: row.try_get("trigger_payload")?,
            context: row.try_get("context")?,
            current_step_index: row.try_get("current_step_index")?,
            version: row.try_get("version")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_execution(self) -> Result<ChainExecution, RepositoryError> {
        let status: ChainExecutionStatus =
            serde_json::from_value(serde_json::Value::String(self.status.clone())).map_err(
                |_| RepositoryError::Query(format!("invalid execution status: {}", self.status)),
            )?;

        let trigger_payload = self
            .trigger_payload
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid trigger_payload: {e}")))
            })
            .transpose()?;

        let context: serde_json::Value = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;

        Ok(ChainExecution {
            id: parse_uuid(&self.id)?,
            chain_definition_id: parse_uuid(&self.chain_definition_id)?,
            family_id: parse_uuid(&self.family_id)?,
            correlation_id: parse_uuid(&self.correlation_id)?,
            status,
            trigger_event_type: self.trigger_event_type,
            trigger_event_id: parse_uuid(&self.trigger_event_id)?,
            trigger_payload,
            context,
            current_step_index: self.current_step_index as u32,
            version: self.version as u32,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            failed_at: self.failed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
        })
    }
}

struct StepRow {
    id: String,
    execution_id: String,
    alias: String,
    name: String,
    action_type: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    retry_count: i64,
    max_retries: i64,
    step_order: i64,
    scheduled_at: Option<String>,
    picked_up_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    compensated_at: Option<String>,
    error: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            alias: row.try_get("alias")?,
            name: row.try_get("name")?,
            action_type: row.try_get("action_type")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            step_order: row.try_get("step_order")?,
            scheduled_at: row.try_get("scheduled_at")?,
            picked_up_at: row.try_get("picked_up_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            compensated_at: row.try_get("compensated_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_step(self) -> Result<StepExecution, RepositoryError> {
        let status: StepExecutionStatus =
            serde_json::from_value(serde_json::Value::String(self.status.clone())).map_err(
                |_| RepositoryError::Query(format!("invalid step status: {}", self.status)),
            )?;

        let input = self
            .input
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid step input: {e}")))
            })
            .transpose()?;

        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid step output: {e}")))
            })
            .transpose()?;

        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            alias: self.alias,
            name: self.name,
            action_type: self.action_type,
            status,
            input,
            output,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            step_order: self.step_order as u32,
            scheduled_at: self.scheduled_at.as_deref().map(parse_datetime).transpose()?,
            picked_up_at: self.picked_up_at.as_deref().map(parse_datetime).transpose()?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            compensated_at: self
                .compensated_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            error: self.error,
        })
    }
}

struct JobRow {
    id: String,
    step_execution_id: String,
    execution_id: String,
    scheduled_at: String,
    picked_up_at: Option<String>,
    completed_at: Option<String>,
    failed_at: Option<String>,
    retry_count: i64,
    error: Option<String>,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            step_execution_id: row.try_get("step_execution_id")?,
            execution_id: row.try_get("execution_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            picked_up_at: row.try_get("picked_up_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            retry_count: row.try_get("retry_count")?,
            error: row.try_get("error")?,
        })
    }

    fn into_job(self) -> Result<ChainScheduledJob, RepositoryError> {
        Ok(ChainScheduledJob {
            id: parse_uuid(&self.id)?,
            step_execution_id: parse_uuid(&self.step_execution_id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            scheduled_at: parse_datetime(&self.scheduled_at)?,
            picked_up_at: self.picked_up_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            failed_at: self.failed_at.as_deref().map(parse_datetime).transpose()?,
            retry_count: self.retry_count as u32,
            error: self.error,
        })
    }
}

struct MappingRow {
    id: String,
    execution_id: String,
    step_alias: String,
    entity_type: String,
    entity_id: String,
    module: String,
    created_at: String,
}

impl MappingRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_alias: row.try_get("step_alias")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            module: row.try_get("module")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_mapping(self) -> Result<ChainEntityMapping, RepositoryError> {
        Ok(ChainEntityMapping {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_alias: self.step_alias,
            entity_type: self.entity_type,
            entity_id: parse_uuid(&self.entity_id)?,
            module: self.module,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn status_str<T: serde::Serialize>(status: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(RepositoryError::Query("unserializable status".to_string())),
    }
}

fn json_str(value: &serde_json::Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn opt_json_str(value: Option<&serde_json::Value>) -> Result<Option<String>, RepositoryError> {
    value.map(json_str).transpose()
}

// ---------------------------------------------------------------------------
// ChainRepository impl
// ---------------------------------------------------------------------------

impl ChainRepository for SqliteChainRepository {
    async fn save_definition(&self, def: &ChainDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        sqlx::query(
            r#"INSERT INTO chains
               (id, name, family_id, trigger_event_type, trigger_module, enabled,
                definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 family_id = excluded.family_id,
                 trigger_event_type = excluded.trigger_event_type,
                 trigger_module = excluded.trigger_module,
                 enabled = excluded.enabled,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.family_id.to_string())
        .bind(&def.trigger_event_type)
        .bind(&def.trigger_module)
        .bind(def.enabled)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ChainDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM chains WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ChainDefRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(
        &self,
        family_id: Option<&Uuid>,
    ) -> Result<Vec<ChainDefinition>, RepositoryError> {
        let rows = match family_id {
            Some(f) => {
                sqlx::query(
                    "SELECT definition FROM chains WHERE family_id = ? ORDER BY created_at ASC",
                )
                .bind(f.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT definition FROM chains ORDER BY created_at ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ChainDefRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn list_enabled_by_trigger(
        &self,
        event_type: &str,
        module: &str,
        family_id: &Uuid,
    ) -> Result<Vec<ChainDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT definition FROM chains
               WHERE trigger_event_type = ? AND trigger_module = ?
                 AND family_id = ? AND enabled = 1
               ORDER BY created_at ASC"#,
        )
        .bind(event_type)
        .bind(module)
        .bind(family_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ChainDefRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn create_execution(&self, execution: &ChainExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO chain_executions
               (id, chain_definition_id, family_id, correlation_id, status,
                trigger_event_type, trigger_event_id, trigger_payload, context,
                current_step_index, version, started_at, completed_at, failed_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.chain_definition_id.to_string())
        .bind(execution.family_id.to_string())
        .bind(execution.correlation_id.to_string())
        .bind(status_str(&execution.status)?)
        .bind(&execution.trigger_event_type)
        .bind(execution.trigger_event_id.to_string())
        .bind(opt_json_str(execution.trigger_payload.as_ref())?)
        .bind(json_str(&execution.context)?)
        .bind(execution.current_step_index as i64)
        .bind(execution.version as i64)
        .bind(format_datetime(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.failed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ChainExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM chain_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution(
        &self,
        execution: &ChainExecution,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE chain_executions
               SET status = ?, context = ?, current_step_index = ?,
                   completed_at = ?, failed_at = ?, error = ?,
                   version = version + 1
               WHERE id = ? AND version = ?"#,
        )
        .bind(status_str(&execution.status)?)
        .bind(json_str(&execution.context)?)
        .bind(execution.current_step_index as i64)
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.failed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .bind(execution.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Distinguish a stale version from a missing row.
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM chain_executions WHERE id = ?")
                    .bind(execution.id.to_string())
                    .fetch_optional(&self.pool.reader)
                    .await
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
            return match current {
                Some((version,)) => Err(RepositoryError::Conflict(format!(
                    "execution {} is at version {version}, expected {expected_version}",
                    execution.id
                ))),
                None => Err(RepositoryError::NotFound),
            };
        }

        Ok(())
    }

    async fn list_running_executions(&self) -> Result<Vec<ChainExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM chain_executions
               WHERE status IN ('pending', 'running')
               ORDER BY started_at ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn create_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO chain_step_executions
               (id, execution_id, alias, name, action_type, status, input, output,
                retry_count, max_retries, step_order, scheduled_at, picked_up_at,
                started_at, completed_at, compensated_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.execution_id.to_string())
        .bind(&step.alias)
        .bind(&step.name)
        .bind(&step.action_type)
        .bind(status_str(&step.status)?)
        .bind(opt_json_str(step.input.as_ref())?)
        .bind(opt_json_str(step.output.as_ref())?)
        .bind(step.retry_count as i64)
        .bind(step.max_retries as i64)
        .bind(step.step_order as i64)
        .bind(step.scheduled_at.as_ref().map(format_datetime))
        .bind(step.picked_up_at.as_ref().map(format_datetime))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.compensated_at.as_ref().map(format_datetime))
        .bind(&step.error)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_step(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE chain_step_executions
               SET status = ?, input = ?, output = ?, retry_count = ?,
                   scheduled_at = ?, picked_up_at = ?, started_at = ?,
                   completed_at = ?, compensated_at = ?, error = ?
               WHERE id = ?"#,
        )
        .bind(status_str(&step.status)?)
        .bind(opt_json_str(step.input.as_ref())?)
        .bind(opt_json_str(step.output.as_ref())?)
        .bind(step.retry_count as i64)
        .bind(step.scheduled_at.as_ref().map(format_datetime))
        .bind(step.picked_up_at.as_ref().map(format_datetime))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.compensated_at.as_ref().map(format_datetime))
        .bind(&step.error)
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM chain_step_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r =
                    StepRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn list_steps(&self, execution_id: &Uuid) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM chain_step_executions WHERE execution_id = ? ORDER BY step_order ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    async fn create_job(&self, job: &ChainScheduledJob) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO chain_scheduled_jobs
               (id, step_execution_id, execution_id, scheduled_at, picked_up_at,
                completed_at, failed_at, retry_count, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.step_execution_id.to_string())
        .bind(job.execution_id.to_string())
        .bind(format_datetime(&job.scheduled_at))
        .bind(job.picked_up_at.as_ref().map(format_datetime))
        .bind(job.completed_at.as_ref().map(format_datetime))
        .bind(job.failed_at.as_ref().map(format_datetime))
        .bind(job.retry_count as i64)
        .bind(&job.error)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ChainScheduledJob>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM chain_scheduled_jobs
               WHERE picked_up_at IS NULL AND scheduled_at <= ?
               ORDER BY scheduled_at ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = JobRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }

    async fn claim_job(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        // Conditional update: at most one caller sees rows_affected == 1.
        let result = sqlx::query(
            "UPDATE chain_scheduled_jobs SET picked_up_at = ? WHERE id = ? AND picked_up_at IS NULL",
        )
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(&self, id: &Uuid, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE chain_scheduled_jobs SET completed_at = ? WHERE id = ?")
            .bind(format_datetime(&now))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        id: &Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE chain_scheduled_jobs
               SET failed_at = ?, error = ?, retry_count = retry_count + 1
               WHERE id = ?"#,
        )
        .bind(format_datetime(&now))
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn reset_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE chain_scheduled_jobs
               SET picked_up_at = NULL
               WHERE picked_up_at IS NOT NULL AND picked_up_at < ?
                 AND completed_at IS NULL AND failed_at IS NULL"#,
        )
        .bind(format_datetime(&older_than))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn record_entity(&self, mapping: &ChainEntityMapping) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO chain_entity_mappings
               (id, execution_id, step_alias, entity_type, entity_id, module, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(mapping.id.to_string())
        .bind(mapping.execution_id.to_string())
        .bind(&mapping.step_alias)
        .bind(&mapping.entity_type)
        .bind(mapping.entity_id.to_string())
        .bind(&mapping.module)
        .bind(format_datetime(&mapping.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_entities(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ChainEntityMapping>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM chain_entity_mappings WHERE execution_id = ? ORDER BY created_at ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut mappings = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = MappingRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            mappings.push(r.into_mapping()?);
        }
        Ok(mappings)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chainflow_types::chain::ChainDefinitionStep;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_repo() -> (SqliteChainRepository, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("chain_test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteChainRepository::new(pool), dir)
    }

    fn sample_definition() -> ChainDefinition {
        let mut def = ChainDefinition::new(
            "member-onboarding",
            Uuid::now_v7(),
            "member_joined",
            "profiles",
        );
        def.add_step(
            ChainDefinitionStep::new(
                "create-calendar",
                "Create Calendar",
                "calendar.create",
                "calendar",
                r#"{"member_id": "{= trigger.member_id }"}"#,
            )
            .with_compensation("calendar.delete"),
        )
        .unwrap();
        def.add_step(ChainDefinitionStep::new(
            "send-welcome",
            "Send Welcome",
            "notification.send",
            "notifications",
            r#"{"template": "welcome"}"#,
        ))
        .unwrap();
        def
    }

    #[tokio::test]
    async fn test_save_and_get_definition() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "member-onboarding");
        assert_eq!(loaded.steps().len(), 2);
        assert_eq!(
            loaded.steps()[0].compensation_action_type.as_deref(),
            Some("calendar.delete")
        );
    }

    #[tokio::test]
    async fn test_save_definition_upserts() {
        let (repo, _dir) = test_repo().await;
        let mut def = sample_definition();
        repo.save_definition(&def).await.unwrap();

        def.update_metadata("renamed", Some("edited".to_string()));
        def.disable();
        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "renamed");
        assert!(!loaded.enabled);
        assert_eq!(repo.list_definitions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_definitions_filters_by_family() {
        let (repo, _dir) = test_repo().await;
        let def_a = sample_definition();
        let def_b = sample_definition();
        repo.save_definition(&def_a).await.unwrap();
        repo.save_definition(&def_b).await.unwrap();

        let all = repo.list_definitions(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let family = repo.list_definitions(Some(&def_a.family_id)).await.unwrap();
        assert_eq!(family.len(), 1);
        assert_eq!(family[0].id, def_a.id);
    }

    #[tokio::test]
    async fn test_trigger_listing_filters_disabled_and_other_families() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        let mut disabled = sample_definition();
        disabled.family_id = def.family_id;
        disabled.disable();
        repo.save_definition(&def).await.unwrap();
        repo.save_definition(&disabled).await.unwrap();
        // Same trigger, different family
        repo.save_definition(&sample_definition()).await.unwrap();

        let matched = repo
            .list_enabled_by_trigger("member_joined", "profiles", &def.family_id)
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, def.id);
    }

    #[tokio::test]
    async fn test_execution_roundtrip() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        let execution =
            ChainExecution::new(&def, Uuid::now_v7(), Some(json!({ "member_id": "m-1" })));
        repo.create_execution(&execution).await.unwrap();

        let loaded = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.chain_definition_id, def.id);
        assert_eq!(loaded.status, ChainExecutionStatus::Pending);
        assert_eq!(loaded.trigger_payload, Some(json!({ "member_id": "m-1" })));
        assert_eq!(loaded.version, 1);
        assert!(loaded.context.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_execution_bumps_version() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        let mut execution = ChainExecution::new(&def, Uuid::now_v7(), None);
        repo.create_execution(&execution).await.unwrap();

        execution.status = ChainExecutionStatus::Running;
        execution.context = json!({ "create-calendar": { "calendar_id": "c-1" } });
        execution.current_step_index = 1;
        repo.update_execution(&execution, 1).await.unwrap();

        let loaded = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ChainExecutionStatus::Running);
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.current_step_index, 1);
        assert_eq!(
            loaded.context,
            json!({ "create-calendar": { "calendar_id": "c-1" } })
        );
    }

    #[tokio::test]
    async fn test_update_execution_rejects_stale_version() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        let mut execution = ChainExecution::new(&def, Uuid::now_v7(), None);
        repo.create_execution(&execution).await.unwrap();

        repo.update_execution(&execution, 1).await.unwrap();

        // A second writer still holding version 1 must be rejected.
        execution.context = json!({ "create-calendar": { "ok": true } });
        let err = repo.update_execution(&execution, 1).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_update_missing_execution_is_not_found() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        let execution = ChainExecution::new(&def, Uuid::now_v7(), None);

        let err = repo.update_execution(&execution, 1).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_running_executions() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();

        let running = ChainExecution::new(&def, Uuid::now_v7(), None);
        repo.create_execution(&running).await.unwrap();

        let mut done = ChainExecution::new(&def, Uuid::now_v7(), None);
        repo.create_execution(&done).await.unwrap();
        done.status = ChainExecutionStatus::Running;
        repo.update_execution(&done, 1).await.unwrap();
        // Walk the state machine to a terminal status.
        done.status = ChainExecutionStatus::Completed;
        done.completed_at = Some(Utc::now());
        repo.update_execution(&done, 2).await.unwrap();

        let open = repo.list_running_executions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, running.id);
    }

    #[tokio::test]
    async fn test_step_roundtrip_and_ordering() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        let execution = ChainExecution::new(&def, Uuid::now_v7(), None);
        repo.create_execution(&execution).await.unwrap();

        // Insert out of order; listing must come back in step_order.
        for def_step in def.steps().iter().rev() {
            let step = StepExecution::from_definition_step(execution.id, def_step);
            repo.create_step(&step).await.unwrap();
        }

        let steps = repo.list_steps(&execution.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].alias, "create-calendar");
        assert_eq!(steps[1].alias, "send-welcome");

        let mut step = steps[0].clone();
        step.status = StepExecutionStatus::Running;
        step.input = Some(json!({ "member_id": "m-1" }));
        step.started_at = Some(Utc::now());
        repo.update_step(&step).await.unwrap();

        let loaded = repo.get_step(&step.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, StepExecutionStatus::Running);
        assert_eq!(loaded.input, Some(json!({ "member_id": "m-1" })));
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_job_is_exclusive() {
        let (repo, _dir) = test_repo().await;
        let (_execution, step) = seeded_step(&repo).await;
        let job = ChainScheduledJob::new(step.id, step.execution_id, Utc::now());
        repo.create_job(&job).await.unwrap();

        assert!(repo.claim_job(&job.id, Utc::now()).await.unwrap());
        assert!(!repo.claim_job(&job.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() {
        let (repo, _dir) = test_repo().await;
        let repo = Arc::new(repo);
        let (_execution, step) = seeded_step(&repo).await;

        let mut job_ids = Vec::new();
        for _ in 0..20 {
            let job = ChainScheduledJob::new(step.id, step.execution_id, Utc::now());
            repo.create_job(&job).await.unwrap();
            job_ids.push(job.id);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let repo = Arc::clone(&repo);
            let ids = job_ids.clone();
            handles.push(tokio::spawn(async move {
                let mut won = 0u32;
                for id in ids {
                    if repo.claim_job(&id, Utc::now()).await.unwrap() {
                        won += 1;
                    }
                }
                won
            }));
        }

        let mut total = 0u32;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 20, "every job claimed exactly once across workers");
    }

    #[tokio::test]
    async fn test_due_jobs_exclude_claimed_and_future() {
        let (repo, _dir) = test_repo().await;
        let (_execution, step) = seeded_step(&repo).await;
        let now = Utc::now();

        let due = ChainScheduledJob::new(step.id, step.execution_id, now);
        let future = ChainScheduledJob::new(
            step.id,
            step.execution_id,
            now + chrono::Duration::minutes(5),
        );
        let claimed = ChainScheduledJob::new(step.id, step.execution_id, now);
        repo.create_job(&due).await.unwrap();
        repo.create_job(&future).await.unwrap();
        repo.create_job(&claimed).await.unwrap();
        repo.claim_job(&claimed.id, now).await.unwrap();

        let jobs = repo.list_due_jobs(now, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, due.id);
    }

    #[tokio::test]
    async fn test_stale_claims_are_reset() {
        let (repo, _dir) = test_repo().await;
        let (_execution, step) = seeded_step(&repo).await;
        let job = ChainScheduledJob::new(step.id, step.execution_id, Utc::now());
        repo.create_job(&job).await.unwrap();

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        repo.claim_job(&job.id, long_ago).await.unwrap();

        let reset = repo
            .reset_stale_claims(Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(reset, 1);

        // Reclaimable after reset
        assert!(repo.claim_job(&job.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_completed_job_claim_not_reset() {
        let (repo, _dir) = test_repo().await;
        let (_execution, step) = seeded_step(&repo).await;
        let job = ChainScheduledJob::new(step.id, step.execution_id, Utc::now());
        repo.create_job(&job).await.unwrap();

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        repo.claim_job(&job.id, long_ago).await.unwrap();
        repo.complete_job(&job.id, Utc::now()).await.unwrap();

        let reset = repo
            .reset_stale_claims(Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(reset, 0);
    }

    #[tokio::test]
    async fn test_fail_job_records_error() {
        let (repo, _dir) = test_repo().await;
        let (_execution, step) = seeded_step(&repo).await;
        let job = ChainScheduledJob::new(step.id, step.execution_id, Utc::now());
        repo.create_job(&job).await.unwrap();
        repo.claim_job(&job.id, Utc::now()).await.unwrap();

        repo.fail_job(&job.id, "handler unavailable", Utc::now())
            .await
            .unwrap();

        let jobs = repo.list_due_jobs(Utc::now(), 10).await.unwrap();
        assert!(jobs.is_empty(), "failed job stays claimed");
    }

    #[tokio::test]
    async fn test_entity_mappings_roundtrip() {
        let (repo, _dir) = test_repo().await;
        let def = sample_definition();
        let execution = ChainExecution::new(&def, Uuid::now_v7(), None);
        repo.create_execution(&execution).await.unwrap();

        let entity_id = Uuid::now_v7();
        let mapping = ChainEntityMapping::new(
            execution.id,
            "create-calendar",
            "calendar_entry",
            entity_id,
            "calendar",
        );
        repo.record_entity(&mapping).await.unwrap();

        let mappings = repo.list_entities(&execution.id).await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].step_alias, "create-calendar");
        assert_eq!(mappings[0].entity_type, "calendar_entry");
        assert_eq!(mappings[0].entity_id, entity_id);
    }

    async fn seeded_step(repo: &SqliteChainRepository) -> (ChainExecution, StepExecution) {
        let def = sample_definition();
        let execution = ChainExecution::new(&def, Uuid::now_v7(), None);
        repo.create_execution(&execution).await.unwrap();
        let step = StepExecution::from_definition_step(execution.id, &def.steps()[0]);
        repo.create_step(&step).await.unwrap();
        (execution, step)
    }
}
