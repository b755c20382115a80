//! Lifecycle notification events emitted by the orchestration engine.
//!
//! Consumers (observability, other chains) subscribe to these on the
//! broadcast bus in `chainflow-core`. Delivery guarantees are the
//! responsibility of the transport, not the engine. Events are drained and
//! published only after the corresponding state write succeeds, so
//! subscribers never observe in-progress state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::ChainExecutionStatus;

/// A lifecycle notification for a chain execution or one of its steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEvent {
    /// An execution was created and began running.
    ChainStarted {
        execution_id: Uuid,
        chain_name: String,
        family_id: Uuid,
        trigger_event_type: String,
    },
    /// An execution reached Completed or PartiallyCompleted.
    ChainCompleted {
        execution_id: Uuid,
        chain_name: String,
        status: ChainExecutionStatus,
        completed_steps: u32,
        total_steps: u32,
    },
    /// An execution reached Failed.
    ChainFailed {
        execution_id: Uuid,
        chain_name: String,
        failed_step_alias: String,
        error: String,
    },
    /// A full reverse compensation walk completed without error.
    ChainCompensated {
        execution_id: Uuid,
        chain_name: String,
        compensated_steps: u32,
    },
    /// A step began executing.
    StepStarted {
        execution_id: Uuid,
        alias: String,
        action_type: String,
    },
    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        alias: String,
        duration_ms: u64,
    },
    /// A step failed; `will_retry` distinguishes transient from terminal.
    StepFailed {
        execution_id: Uuid,
        alias: String,
        error: String,
        will_retry: bool,
    },
    /// A step was skipped because its guard condition evaluated false.
    StepSkipped { execution_id: Uuid, alias: String },
    /// A retry was scheduled for a step.
    StepRetryScheduled {
        execution_id: Uuid,
        alias: String,
        not_before: DateTime<Utc>,
    },
}

impl ChainEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            ChainEvent::ChainStarted { execution_id, .. }
            | ChainEvent::ChainCompleted { execution_id, .. }
            | ChainEvent::ChainFailed { execution_id, .. }
            | ChainEvent::ChainCompensated { execution_id, .. }
            | ChainEvent::StepStarted { execution_id, .. }
            | ChainEvent::StepCompleted { execution_id, .. }
            | ChainEvent::StepFailed { execution_id, .. }
            | ChainEvent::StepSkipped { execution_id, .. }
            | ChainEvent::StepRetryScheduled { execution_id, .. } => *execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tagging() {
        let event = ChainEvent::ChainFailed {
            execution_id: Uuid::now_v7(),
            chain_name: "member-onboarding".to_string(),
            failed_step_alias: "send-welcome".to_string(),
            error: "handler not registered".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"chain_failed\""));
        assert!(json.contains("send-welcome"));

        let parsed: ChainEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ChainEvent::ChainFailed { .. }));
    }

    #[test]
    fn test_execution_id_accessor() {
        let id = Uuid::now_v7();
        let event = ChainEvent::StepSkipped {
            execution_id: id,
            alias: "optional-step".to_string(),
        };
        assert_eq!(event.execution_id(), id);
    }
}
