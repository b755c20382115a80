//! Chain domain types for Chainflow.
//!
//! Defines the authoring model (`ChainDefinition`, `ChainDefinitionStep`) and
//! the execution tracking model (`ChainExecution`, `StepExecution`,
//! `ChainScheduledJob`, `ChainEntityMapping`). Definitions are immutable
//! descriptions of a workflow; executions are the per-trigger runtime
//! instances that carry the state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DefinitionError;

// ---------------------------------------------------------------------------
// Chain Definition (authoring model)
// ---------------------------------------------------------------------------

/// An ordered, versioned workflow definition triggered by a domain event.
///
/// The step list is owned by the definition and exposed read-only via
/// [`ChainDefinition::steps`]; all mutation goes through [`add_step`] and
/// [`clear_steps`] so the unique-alias invariant cannot be bypassed.
///
/// [`add_step`]: ChainDefinition::add_step
/// [`clear_steps`]: ChainDefinition::clear_steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    /// Human-readable chain name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Owning family (tenant) id.
    pub family_id: Uuid,
    /// Whether new trigger events may start executions of this chain.
    pub enabled: bool,
    /// Domain event type that triggers this chain.
    pub trigger_event_type: String,
    /// Module the trigger event originates from.
    pub trigger_module: String,
    /// Ordered step definitions. Mutated only through owning methods.
    steps: Vec<ChainDefinitionStep>,
    /// Version counter, bumped on every mutation.
    pub version: u32,
    /// Template definitions are copied into family-owned instances.
    pub is_template: bool,
    /// Template name, set when `is_template` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    /// When the definition was created.
    pub created_at: DateTime<Utc>,
    /// When the definition was last modified.
    pub updated_at: DateTime<Utc>,
}

impl ChainDefinition {
    /// Create a new, enabled, empty chain definition.
    pub fn new(
        name: impl Into<String>,
        family_id: Uuid,
        trigger_event_type: impl Into<String>,
        trigger_module: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: None,
            family_id,
            enabled: true,
            trigger_event_type: trigger_event_type.into(),
            trigger_module: trigger_module.into(),
            steps: Vec::new(),
            version: 1,
            is_template: false,
            template_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Read-only view of the ordered step list.
    pub fn steps(&self) -> &[ChainDefinitionStep] {
        &self.steps
    }

    /// Append a step, assigning it the next ordinal position.
    ///
    /// Rejects duplicate aliases with `DefinitionError::DuplicateAlias` and
    /// leaves the step list unchanged in that case.
    pub fn add_step(&mut self, mut step: ChainDefinitionStep) -> Result<(), DefinitionError> {
        if self.steps.iter().any(|s| s.alias == step.alias) {
            return Err(DefinitionError::DuplicateAlias(step.alias));
        }
        step.step_order = self.steps.len() as u32;
        self.steps.push(step);
        self.touch();
        Ok(())
    }

    /// Remove all steps. Used when a definition is edited wholesale.
    pub fn clear_steps(&mut self) {
        self.steps.clear();
        self.touch();
    }

    /// Find a step by its alias.
    pub fn step_by_alias(&self, alias: &str) -> Option<&ChainDefinitionStep> {
        self.steps.iter().find(|s| s.alias == alias)
    }

    /// Allow new trigger events to start executions.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.touch();
    }

    /// Stop new trigger events from starting executions.
    ///
    /// In-flight executions are unaffected; they run to a terminal state.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.touch();
    }

    /// Update name and description.
    pub fn update_metadata(&mut self, name: impl Into<String>, description: Option<String>) {
        self.name = name.into();
        self.description = description;
        self.touch();
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// A single step within a chain definition.
///
/// Immutable once created; editing a definition replaces its steps wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinitionStep {
    /// Unique key within the chain (e.g. "create-calendar-entry").
    pub alias: String,
    /// Human-readable step name.
    pub name: String,
    /// Action type invoked by this step.
    pub action_type: String,
    /// Version of the action contract.
    pub action_version: String,
    /// Module that owns the action.
    pub module: String,
    /// Opaque input-mapping expression, resolved at dispatch time.
    pub input_mapping: String,
    /// Optional guard condition; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Whether this step can be reversed on chain failure.
    pub compensatable: bool,
    /// Compensation action type, set when `compensatable` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_action_type: Option<String>,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Ordinal position within the chain. Assigned by `add_step`.
    pub step_order: u32,
}

impl ChainDefinitionStep {
    /// Create a non-compensatable step with default retry budget.
    pub fn new(
        alias: impl Into<String>,
        name: impl Into<String>,
        action_type: impl Into<String>,
        module: impl Into<String>,
        input_mapping: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            action_type: action_type.into(),
            action_version: "1".to_string(),
            module: module.into(),
            input_mapping: input_mapping.into(),
            condition: None,
            compensatable: false,
            compensation_action_type: None,
            max_retries: DEFAULT_MAX_RETRIES,
            step_order: 0,
        }
    }

    /// Mark the step as compensatable via the given compensation action.
    pub fn with_compensation(mut self, compensation_action_type: impl Into<String>) -> Self {
        self.compensatable = true;
        self.compensation_action_type = Some(compensation_action_type.into());
        self
    }

    /// Set the guard condition expression.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Default retry budget for a step.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Execution status state machines
// ---------------------------------------------------------------------------

/// Overall status of a chain execution.
///
/// Legal transitions:
/// `Pending -> Running -> {Completed, PartiallyCompleted, Failed}`,
/// `Failed -> Compensating -> Compensated`. All transitions are
/// one-directional; Completed, PartiallyCompleted, and Compensated are
/// terminal. An execution stuck in Compensating after a compensation
/// failure is resolved manually, never automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainExecutionStatus {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
    Compensating,
    Compensated,
}

impl ChainExecutionStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ChainExecutionStatus) -> bool {
        use ChainExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, PartiallyCompleted)
                | (Running, Failed)
                | (Failed, Compensating)
                | (Compensating, Compensated)
        )
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChainExecutionStatus::Completed
                | ChainExecutionStatus::PartiallyCompleted
                | ChainExecutionStatus::Compensated
        )
    }
}

/// Status of an individual step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
    Compensating,
    Compensated,
}

impl StepExecutionStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: StepExecutionStatus) -> bool {
        use StepExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Completed, Compensating)
                | (Compensating, Compensated)
        )
    }
}

// ---------------------------------------------------------------------------
// Chain Execution (runtime instance)
// ---------------------------------------------------------------------------

/// One runtime instance of a chain, created per trigger occurrence.
///
/// Never deleted -- the execution row and its step rows form the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    /// The definition being executed.
    pub chain_definition_id: Uuid,
    /// Owning family (tenant) id.
    pub family_id: Uuid,
    /// Correlation id for cross-system tracing.
    pub correlation_id: Uuid,
    /// Current execution status.
    pub status: ChainExecutionStatus,
    /// Trigger event type that started this execution.
    pub trigger_event_type: String,
    /// Id of the triggering domain event.
    pub trigger_event_id: Uuid,
    /// JSON payload of the triggering event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<Value>,
    /// Accumulated context blob: step outputs keyed by alias.
    pub context: Value,
    /// Index of the step currently being (or next to be) dispatched.
    pub current_step_index: u32,
    /// Optimistic-concurrency version; bumped by the store on every write.
    pub version: u32,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution reached Completed or PartiallyCompleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the execution reached Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Error message for audit; plain text, no exception types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainExecution {
    /// Create a Pending execution for a definition and trigger event.
    pub fn new(
        definition: &ChainDefinition,
        trigger_event_id: Uuid,
        trigger_payload: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            chain_definition_id: definition.id,
            family_id: definition.family_id,
            correlation_id: Uuid::now_v7(),
            status: ChainExecutionStatus::Pending,
            trigger_event_type: definition.trigger_event_type.clone(),
            trigger_event_id,
            trigger_payload,
            context: Value::Object(serde_json::Map::new()),
            current_step_index: 0,
            version: 1,
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }
}

/// Execution record for a single step within a chain execution.
///
/// Alias, name, and action type are denormalized from the definition so the
/// audit trail stays stable even if the definition is later edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 step execution id.
    pub id: Uuid,
    /// Owning chain execution id.
    pub execution_id: Uuid,
    /// Step alias matching `ChainDefinitionStep.alias`.
    pub alias: String,
    /// Step name (denormalized for display).
    pub name: String,
    /// Action type (denormalized for audit).
    pub action_type: String,
    /// Current step status.
    pub status: StepExecutionStatus,
    /// JSON input resolved for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// JSON output produced by this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry budget from the definition step.
    pub max_retries: u32,
    /// Ordinal position within the chain.
    pub step_order: u32,
    /// When a retry was scheduled for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When a scheduled retry was picked up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picked_up_at: Option<DateTime<Utc>>,
    /// When step execution last started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When step execution completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the step was compensated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensated_at: Option<DateTime<Utc>>,
    /// Error message if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepExecution {
    /// Materialize a Pending step execution from a definition step.
    pub fn from_definition_step(execution_id: Uuid, step: &ChainDefinitionStep) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            alias: step.alias.clone(),
            name: step.name.clone(),
            action_type: step.action_type.clone(),
            status: StepExecutionStatus::Pending,
            input: None,
            output: None,
            retry_count: 0,
            max_retries: step.max_retries,
            step_order: step.step_order,
            scheduled_at: None,
            picked_up_at: None,
            started_at: None,
            completed_at: None,
            compensated_at: None,
            error: None,
        }
    }

    /// Whether another retry attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Scheduled jobs
// ---------------------------------------------------------------------------

/// A due-date record causing a step to be re-dispatched after a retry delay.
///
/// `picked_up_at == None` means the job is unclaimed. Claiming is a
/// conditional update so at most one poller wins even with concurrent
/// scheduler instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainScheduledJob {
    /// UUIDv7 job id.
    pub id: Uuid,
    /// The step execution to re-dispatch.
    pub step_execution_id: Uuid,
    /// Owning chain execution id.
    pub execution_id: Uuid,
    /// Earliest time the job may be dispatched.
    pub scheduled_at: DateTime<Utc>,
    /// When a poller claimed the job. None = unclaimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picked_up_at: Option<DateTime<Utc>>,
    /// When the dispatch completed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the dispatch failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Dispatch failures recorded against this job.
    pub retry_count: u32,
    /// Error from the last failed dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainScheduledJob {
    /// Create an unclaimed job due at `scheduled_at`.
    pub fn new(step_execution_id: Uuid, execution_id: Uuid, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_execution_id,
            execution_id,
            scheduled_at,
            picked_up_at: None,
            completed_at: None,
            failed_at: None,
            retry_count: 0,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity mappings
// ---------------------------------------------------------------------------

/// Append-only record of a domain entity created by a step.
///
/// Lets later steps and compensations resolve "the entity step X created"
/// without re-querying other modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntityMapping {
    /// UUIDv7 mapping id.
    pub id: Uuid,
    /// Owning chain execution id.
    pub execution_id: Uuid,
    /// Alias of the step that created the entity.
    pub step_alias: String,
    /// Domain entity type (e.g. "calendar_entry").
    pub entity_type: String,
    /// Domain entity id.
    pub entity_id: Uuid,
    /// Module that owns the entity.
    pub module: String,
    /// When the mapping was recorded.
    pub created_at: DateTime<Utc>,
}

impl ChainEntityMapping {
    /// Record an entity created by the given step.
    pub fn new(
        execution_id: Uuid,
        step_alias: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Uuid,
        module: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            step_alias: step_alias.into(),
            entity_type: entity_type.into(),
            entity_id,
            module: module.into(),
            created_at: Utc::now(),
        }
    }
}

/// An entity reported as created by an action handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEntity {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub module: String,
}

// ---------------------------------------------------------------------------
// Trigger feed
// ---------------------------------------------------------------------------

/// A domain event arriving on the trigger feed.
///
/// Matching against `ChainDefinition.trigger_event_type`/`trigger_module`
/// happens in the engine's trigger router; subscription mechanics are
/// external to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Domain event type (e.g. "member_joined").
    pub event_type: String,
    /// Module the event originates from.
    pub module: String,
    /// Id of the domain event.
    pub event_id: Uuid,
    /// Family (tenant) the event belongs to.
    pub family_id: Uuid,
    /// JSON event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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

    // -----------------------------------------------------------------------
    // Unique alias invariant
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_step_rejects_duplicate_alias() {
        let mut def = sample_definition();
        let before = def.steps().len();

        let dup = ChainDefinitionStep::new(
            "create-calendar",
            "Another Calendar",
            "calendar.create",
            "calendar",
            "{}",
        );
        let err = def.add_step(dup).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateAlias(ref a) if a == "create-calendar"));
        assert_eq!(def.steps().len(), before, "step list must be unchanged");
    }

    #[test]
    fn test_add_step_assigns_ordinals() {
        let def = sample_definition();
        assert_eq!(def.steps()[0].step_order, 0);
        assert_eq!(def.steps()[1].step_order, 1);
    }

    #[test]
    fn test_clear_steps_bumps_version() {
        let mut def = sample_definition();
        let v = def.version;
        def.clear_steps();
        assert!(def.steps().is_empty());
        assert_eq!(def.version, v + 1);
    }

    #[test]
    fn test_enable_disable() {
        let mut def = sample_definition();
        assert!(def.enabled);
        def.disable();
        assert!(!def.enabled);
        def.enable();
        assert!(def.enabled);
    }

    // -----------------------------------------------------------------------
    // Status state machines
    // -----------------------------------------------------------------------

    #[test]
    fn test_execution_status_legal_transitions() {
        use ChainExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(PartiallyCompleted));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Compensating));
        assert!(Compensating.can_transition_to(Compensated));
    }

    #[test]
    fn test_execution_status_illegal_transitions() {
        use ChainExecutionStatus::*;
        assert!(!Completed.can_transition_to(Running));
        assert!(!Compensated.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_statuses() {
        use ChainExecutionStatus::*;
        assert!(Completed.is_terminal());
        assert!(PartiallyCompleted.is_terminal());
        assert!(Compensated.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!Failed.is_terminal());
        assert!(!Compensating.is_terminal());
    }

    #[test]
    fn test_step_status_transitions() {
        use StepExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Running));
        assert!(Completed.can_transition_to(Compensating));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
    }

    // -----------------------------------------------------------------------
    // Execution materialization
    // -----------------------------------------------------------------------

    #[test]
    fn test_execution_starts_pending() {
        let def = sample_definition();
        let exec = ChainExecution::new(&def, Uuid::now_v7(), Some(json!({"member_id": "m1"})));
        assert_eq!(exec.status, ChainExecutionStatus::Pending);
        assert_eq!(exec.chain_definition_id, def.id);
        assert_eq!(exec.family_id, def.family_id);
        assert_eq!(exec.current_step_index, 0);
        assert!(exec.context.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_step_execution_from_definition_step() {
        let def = sample_definition();
        let exec_id = Uuid::now_v7();
        let step = StepExecution::from_definition_step(exec_id, &def.steps()[0]);
        assert_eq!(step.alias, "create-calendar");
        assert_eq!(step.status, StepExecutionStatus::Pending);
        assert_eq!(step.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(step.step_order, 0);
        assert!(step.can_retry());
    }

    #[test]
    fn test_can_retry_exhausted() {
        let def = sample_definition();
        let mut step = StepExecution::from_definition_step(Uuid::now_v7(), &def.steps()[0]);
        step.retry_count = step.max_retries;
        assert!(!step.can_retry());
    }

    // -----------------------------------------------------------------------
    // Serde
    // -----------------------------------------------------------------------

    #[test]
    fn test_definition_json_roundtrip_preserves_steps() {
        let def = sample_definition();
        let json_str = serde_json::to_string(&def).unwrap();
        let parsed: ChainDefinition = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.name, def.name);
        assert_eq!(parsed.steps().len(), 2);
        assert_eq!(parsed.steps()[0].alias, "create-calendar");
        assert_eq!(
            parsed.steps()[0].compensation_action_type.as_deref(),
            Some("calendar.delete")
        );
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ChainExecutionStatus::PartiallyCompleted).unwrap();
        assert_eq!(json, "\"partially_completed\"");
        let json = serde_json::to_string(&StepExecutionStatus::Compensating).unwrap();
        assert_eq!(json, "\"compensating\"");
    }

    #[test]
    fn test_random_transition_walks_stay_on_legal_graph() {
        use ChainExecutionStatus::*;
        use rand::prelude::*;

        let all = [
            Pending,
            Running,
            Completed,
            PartiallyCompleted,
            Failed,
            Compensating,
            Compensated,
        ];
        let mut rng = rand::rng();

        for _ in 0..200 {
            let mut status = Pending;
            for _ in 0..20 {
                let candidate = *all.choose(&mut rng).unwrap();
                if status.can_transition_to(candidate) {
                    assert!(!status.is_terminal(), "terminal state permitted an exit");
                    status = candidate;
                }
            }
            // Every reachable end state is a real state, and terminal states
            // admit no further moves.
            if status.is_terminal() {
                for next in all {
                    assert!(!status.can_transition_to(next));
                }
            }
        }
    }

    #[test]
    fn test_scheduled_job_starts_unclaimed() {
        let job = ChainScheduledJob::new(Uuid::now_v7(), Uuid::now_v7(), Utc::now());
        assert!(job.picked_up_at.is_none());
        assert!(job.completed_at.is_none());
        assert_eq!(job.retry_count, 0);
    }
}
