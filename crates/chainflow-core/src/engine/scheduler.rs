//! Due-date polling loop for scheduled retry jobs.
//!
//! Each poll resets stale claims, selects due unclaimed jobs, and claims
//! each one via the repository's atomic conditional update -- at most one
//! poller wins a job even with concurrent scheduler instances. A claimed
//! job resumes its execution through the coordinator's normal advance path.

use std::sync::Arc;
use std::time::Duration;

use chainflow_observe::chain_attrs;
use chainflow_types::config::EngineConfig;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::coordinator::{EngineError, ExecutionCoordinator};
use crate::repository::chain::ChainRepository;

/// Jobs processed per poll.
const JOB_BATCH_SIZE: u32 = 32;

/// Polls for due retry jobs and re-drives their executions.
pub struct RetryScheduler<R: ChainRepository> {
    repository: Arc<R>,
    coordinator: Arc<ExecutionCoordinator<R>>,
    poll_interval: Duration,
    stale_claim: chrono::Duration,
}

impl<R: ChainRepository> RetryScheduler<R> {
    pub fn new(
        repository: Arc<R>,
        coordinator: Arc<ExecutionCoordinator<R>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            repository,
            coordinator,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            stale_claim: chrono::Duration::seconds(config.stale_claim_secs as i64),
        }
    }

    /// Run the polling loop until the shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("retry scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let span = tracing::debug_span!(
                        "retry_poll",
                        operation = chain_attrs::OP_POLL_RETRIES,
                    );
                    if let Err(e) = self.poll_once().instrument(span).await {
                        tracing::error!(error = %e, "retry poll failed");
                    }
                }
            }
        }
    }

    /// One poll: reset stale claims, then claim and dispatch due jobs.
    /// Returns the number of jobs dispatched.
    pub async fn poll_once(&self) -> Result<u32, EngineError> {
        let now = Utc::now();
        let reset = self
            .repository
            .reset_stale_claims(now - self.stale_claim)
            .await?;
        if reset > 0 {
            tracing::warn!(reset, "reset stale job claims");
        }

        let due = self.repository.list_due_jobs(now, JOB_BATCH_SIZE).await?;
        let mut dispatched = 0u32;
        for job in due {
            // Another poller may have won the job since the listing.
            if !self.repository.claim_job(&job.id, Utc::now()).await? {
                continue;
            }
            tracing::debug!(
                job_id = %job.id,
                execution_id = %job.execution_id,
                "claimed retry job"
            );
            match self.coordinator.advance(job.execution_id).await {
                Ok(()) => {
                    self.repository.complete_job(&job.id, Utc::now()).await?;
                    dispatched += 1;
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        execution_id = %job.execution_id,
                        error = %e,
                        "retry dispatch failed"
                    );
                    self.repository
                        .fail_job(&job.id, &e.to_string(), Utc::now())
                        .await?;
                }
            }
        }
        Ok(dispatched)
    }
}

impl<R: ChainRepository> std::fmt::Debug for RetryScheduler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::engine::dispatcher::StepDispatcher;
    use crate::engine::handler::{ActionHandler, ActionOutcome, HandlerKey, HandlerRegistry};
    use crate::event::bus::EventBus;
    use crate::repository::memory::InMemoryChainRepository;
    use chainflow_types::chain::{
        ChainDefinition, ChainDefinitionStep, ChainExecutionStatus, StepExecutionStatus,
        TriggerEvent,
    };
    use serde_json::{Value, json};
    use uuid::Uuid;

    struct FailOnce {
        remaining: AtomicU32,
    }

    impl ActionHandler for FailOnce {
        async fn execute(&self, _input: Value, _cancel: CancellationToken) -> ActionOutcome {
            let still_failing = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    (v > 0).then(|| v - 1)
                })
                .is_ok();
            if still_failing {
                ActionOutcome::retryable("temporarily unavailable")
            } else {
                ActionOutcome::success(json!({ "ok": true }))
            }
        }
    }

    struct Fixture {
        repo: Arc<InMemoryChainRepository>,
        scheduler: RetryScheduler<InMemoryChainRepository>,
        coordinator: Arc<ExecutionCoordinator<InMemoryChainRepository>>,
        def: ChainDefinition,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryChainRepository::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            HandlerKey::new("act.flaky", "calendar", "1"),
            FailOnce {
                remaining: AtomicU32::new(1),
            },
        );
        let config = EngineConfig {
            retry_base_delay_secs: 0,
            ..EngineConfig::default()
        };
        let dispatcher = Arc::new(StepDispatcher::new(Arc::clone(&registry), &config));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&repo),
            dispatcher,
            EventBus::new(64),
        ));
        let scheduler =
            RetryScheduler::new(Arc::clone(&repo), Arc::clone(&coordinator), &config);

        let mut def =
            ChainDefinition::new("test-chain", Uuid::now_v7(), "member_joined", "profiles");
        def.add_step(ChainDefinitionStep::new(
            "flaky",
            "Flaky",
            "act.flaky",
            "calendar",
            "{}",
        ))
        .unwrap();
        repo.save_definition(&def).await.unwrap();

        Fixture {
            repo,
            scheduler,
            coordinator,
            def,
        }
    }

    fn trigger_for(def: &ChainDefinition) -> TriggerEvent {
        TriggerEvent {
            event_type: def.trigger_event_type.clone(),
            module: def.trigger_module.clone(),
            event_id: Uuid::now_v7(),
            family_id: def.family_id,
            payload: None,
        }
    }

    #[tokio::test]
    async fn poll_resumes_due_retry_and_completes_job() {
        let fx = fixture().await;
        let execution = fx
            .coordinator
            .start(&fx.def, &trigger_for(&fx.def))
            .await
            .unwrap();
        assert_eq!(execution.status, ChainExecutionStatus::Running);

        let dispatched = fx.scheduler.poll_once().await.unwrap();
        assert_eq!(dispatched, 1);

        let execution = fx
            .repo
            .get_execution(&execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ChainExecutionStatus::Completed);

        let steps = fx.repo.list_steps(&execution.id).await.unwrap();
        assert_eq!(steps[0].status, StepExecutionStatus::Completed);
        assert_eq!(steps[0].retry_count, 1);

        // Nothing left to dispatch
        assert_eq!(fx.scheduler.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_claim_is_reset_and_job_retaken() {
        let fx = fixture().await;
        let execution = fx
            .coordinator
            .start(&fx.def, &trigger_for(&fx.def))
            .await
            .unwrap();

        // Simulate a poller that claimed the job an hour ago and died.
        let jobs = fx.repo.list_due_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        fx.repo
            .claim_job(&jobs[0].id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(fx.repo.list_due_jobs(Utc::now(), 10).await.unwrap().is_empty());

        let dispatched = fx.scheduler.poll_once().await.unwrap();
        assert_eq!(dispatched, 1);

        let execution = fx
            .repo
            .get_execution(&execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ChainExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fx = fixture().await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // Returns immediately instead of looping forever.
        fx.scheduler.run(shutdown).await;
    }
}
