//! Trigger event routing: domain event in, chain executions out.
//!
//! Matches incoming trigger events against enabled definitions by
//! `(trigger_event_type, trigger_module)` scoped to the event's family and
//! starts one execution per match. Disabling a definition removes it from
//! matching but does not abort in-flight executions.

use std::sync::Arc;

use chainflow_types::chain::TriggerEvent;
use uuid::Uuid;

use super::coordinator::{EngineError, ExecutionCoordinator};
use crate::repository::chain::ChainRepository;

/// Routes trigger events to matching chain definitions.
pub struct TriggerRouter<R: ChainRepository> {
    repository: Arc<R>,
    coordinator: Arc<ExecutionCoordinator<R>>,
}

impl<R: ChainRepository> TriggerRouter<R> {
    pub fn new(repository: Arc<R>, coordinator: Arc<ExecutionCoordinator<R>>) -> Self {
        Self {
            repository,
            coordinator,
        }
    }

    /// Start an execution for every enabled definition matching the event.
    ///
    /// One broken chain must not block the others: start failures are
    /// logged and skipped. Returns the ids of the executions started.
    pub async fn dispatch(&self, event: &TriggerEvent) -> Result<Vec<Uuid>, EngineError> {
        let definitions = self
            .repository
            .list_enabled_by_trigger(&event.event_type, &event.module, &event.family_id)
            .await?;

        if definitions.is_empty() {
            tracing::debug!(
                event_type = %event.event_type,
                module = %event.module,
                "no chains match trigger event"
            );
            return Ok(Vec::new());
        }

        let mut started = Vec::new();
        for definition in definitions {
            match self.coordinator.start(&definition, event).await {
                Ok(execution) => started.push(execution.id),
                Err(e) => {
                    tracing::error!(
                        chain = %definition.name,
                        event_type = %event.event_type,
                        error = %e,
                        "failed to start chain execution for trigger"
                    );
                }
            }
        }
        Ok(started)
    }
}

impl<R: ChainRepository> std::fmt::Debug for TriggerRouter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRouter").finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatcher::StepDispatcher;
    use crate::engine::handler::{ActionHandler, ActionOutcome, HandlerKey, HandlerRegistry};
    use crate::event::bus::EventBus;
    use crate::repository::memory::InMemoryChainRepository;
    use chainflow_types::chain::{ChainDefinition, ChainDefinitionStep, ChainExecutionStatus};
    use chainflow_types::config::EngineConfig;
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;

    struct OkHandler;

    impl ActionHandler for OkHandler {
        async fn execute(&self, _input: Value, _cancel: CancellationToken) -> ActionOutcome {
            ActionOutcome::success(json!({ "ok": true }))
        }
    }

    struct Fixture {
        repo: Arc<InMemoryChainRepository>,
        router: TriggerRouter<InMemoryChainRepository>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryChainRepository::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(HandlerKey::new("act.ok", "calendar", "1"), OkHandler);
        let dispatcher = Arc::new(StepDispatcher::new(
            Arc::clone(&registry),
            &EngineConfig::default(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&repo),
            dispatcher,
            EventBus::new(64),
        ));
        let router = TriggerRouter::new(Arc::clone(&repo), coordinator);
        Fixture { repo, router }
    }

    fn definition(family_id: Uuid) -> ChainDefinition {
        let mut def = ChainDefinition::new("on-join", family_id, "member_joined", "profiles");
        def.add_step(ChainDefinitionStep::new(
            "a",
            "A",
            "act.ok",
            "calendar",
            "{}",
        ))
        .unwrap();
        def
    }

    fn event(family_id: Uuid) -> TriggerEvent {
        TriggerEvent {
            event_type: "member_joined".to_string(),
            module: "profiles".to_string(),
            event_id: Uuid::now_v7(),
            family_id,
            payload: Some(json!({ "member_id": "m-1" })),
        }
    }

    #[tokio::test]
    async fn dispatch_starts_matching_enabled_chains_only() {
        let fx = fixture();
        let family_id = Uuid::now_v7();

        let matching = definition(family_id);
        let mut disabled = definition(family_id);
        disabled.disable();
        let other_family = definition(Uuid::now_v7());
        fx.repo.save_definition(&matching).await.unwrap();
        fx.repo.save_definition(&disabled).await.unwrap();
        fx.repo.save_definition(&other_family).await.unwrap();

        let started = fx.router.dispatch(&event(family_id)).await.unwrap();
        assert_eq!(started.len(), 1);

        let execution = fx.repo.get_execution(&started[0]).await.unwrap().unwrap();
        assert_eq!(execution.chain_definition_id, matching.id);
        assert_eq!(execution.status, ChainExecutionStatus::Completed);
        assert_eq!(execution.family_id, family_id);
    }

    #[tokio::test]
    async fn dispatch_with_no_match_starts_nothing() {
        let fx = fixture();
        let started = fx.router.dispatch(&event(Uuid::now_v7())).await.unwrap();
        assert!(started.is_empty());
        assert!(fx
            .repo
            .list_running_executions()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn broken_chain_does_not_block_others() {
        let fx = fixture();
        let family_id = Uuid::now_v7();

        // One definition with no steps (rejected at start), one healthy.
        let empty = ChainDefinition::new("broken", family_id, "member_joined", "profiles");
        let healthy = definition(family_id);
        fx.repo.save_definition(&empty).await.unwrap();
        fx.repo.save_definition(&healthy).await.unwrap();

        let started = fx.router.dispatch(&event(family_id)).await.unwrap();
        assert_eq!(started.len(), 1);
        let execution = fx.repo.get_execution(&started[0]).await.unwrap().unwrap();
        assert_eq!(execution.chain_definition_id, healthy.id);
    }
}
