//! Orchestration for a single pipeline step on one work item.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use tracing::{error, info, instrument, warn};

use crate::core::handle::derive_handle;
use crate::core::invariants::check_forward_only;
use crate::core::selector::next_step;
use crate::core::state_update::{
    FailureDisposition, StepEffect, apply_classification, apply_step_failure, apply_step_success,
};
use crate::core::types::{Relation, Session, StepKind, WorkItem};
use crate::error::{ActionError, StepError};
use crate::io::actuator::{Actuator, SurfaceTimeouts, send_via_transient_surface, timed};
use crate::io::broadcast::{Broadcaster, Snapshot};
use crate::io::config::EngineConfig;
use crate::io::generator::{Generation, GenerationParams, GenerationRequest, Generator};
use crate::io::prompt::PromptRenderer;
use crate::io::session_store::SessionStore;

/// Limits and parameters for step execution.
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Failed attempts after which a step is marked `failed`.
    pub max_attempts: u32,
    pub classify_timeout: Duration,
    /// Readiness budget for transient surfaces and the budget for every
    /// other actuator action.
    pub surface: SurfaceTimeouts,
    pub handle_pattern: Regex,
    pub generation: GenerationParams,
}

impl StepConfig {
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        Ok(Self {
            max_attempts: cfg.max_attempts,
            classify_timeout: Duration::from_secs(cfg.classify_timeout_secs),
            surface: SurfaceTimeouts {
                ready: Duration::from_secs(cfg.surface_ready_timeout_secs),
                action: Duration::from_secs(cfg.action_timeout_secs),
            },
            handle_pattern: cfg.handle_regex()?,
            generation: GenerationParams::from(&cfg.generation),
        })
    }
}

/// What one step did to its item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// The relation was recorded. `error` is set when classification failed
    /// and the item fell back to `Unrelated`.
    Classified {
        relation: Relation,
        error: Option<String>,
    },
    Completed,
    /// The generator declined; the step is `done` without acting.
    Skipped,
    /// The action failed. `exhausted` means the step is now `failed`.
    Failed { error: String, exhausted: bool },
}

/// Result of a single step invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub item_id: String,
    pub step: StepKind,
    pub result: StepResult,
}

/// Either a recoverable action failure or a session-level one.
enum Failure {
    Action(ActionError),
    Fatal(StepError),
}

impl From<ActionError> for Failure {
    fn from(err: ActionError) -> Self {
        Failure::Action(err)
    }
}

/// Runs exactly one step per call and persists the transition it causes.
pub struct StepExecutor {
    store: Arc<SessionStore>,
    actuator: Arc<dyn Actuator>,
    generator: Arc<dyn Generator>,
    broadcaster: Arc<Broadcaster>,
    prompts: PromptRenderer,
    config: StepConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<SessionStore>,
        actuator: Arc<dyn Actuator>,
        generator: Arc<dyn Generator>,
        broadcaster: Arc<Broadcaster>,
        prompts: PromptRenderer,
        config: StepConfig,
    ) -> Self {
        Self {
            store,
            actuator,
            generator,
            broadcaster,
            prompts,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Execute the next step of `item_id`.
    ///
    /// Step-level failures are recorded on the item and reported through
    /// [`StepResult::Failed`]; only session-level failures are returned as
    /// errors.
    #[instrument(skip(self))]
    pub async fn run_step(&self, session_id: &str, item_id: &str) -> Result<StepOutcome, StepError> {
        let session = self
            .store
            .load(session_id)?
            .ok_or_else(|| StepError::MissingSessionRecord(session_id.to_string()))?;
        let item = session
            .item(item_id)
            .cloned()
            .ok_or_else(|| StepError::MissingItem {
                session_id: session_id.to_string(),
                item_id: item_id.to_string(),
            })?;
        let step = next_step(&item).ok_or_else(|| {
            StepError::Invariant(format!("item '{item_id}' has no remaining step"))
        })?;

        let result = if step == StepKind::Classify {
            self.classify(session_id, &item).await?
        } else {
            match self.perform(step, &session, &item).await {
                Ok(effect) => {
                    let result = match effect {
                        StepEffect::Skipped => StepResult::Skipped,
                        StepEffect::Completed { .. } => StepResult::Completed,
                    };
                    self.commit(session_id, item_id, |item| {
                        apply_step_success(item, step, effect, Utc::now())
                    })?;
                    result
                }
                Err(Failure::Fatal(err)) => {
                    error!(session_id, item_id, step = %step, "step aborted: {err}");
                    return Err(err);
                }
                Err(Failure::Action(err)) => self.record_failure(session_id, item_id, step, &err)?,
            }
        };

        info!(session_id, item_id, step = %step, result = ?result, "step finished");
        Ok(StepOutcome {
            item_id: item_id.to_string(),
            step,
            result,
        })
    }

    async fn classify(&self, session_id: &str, item: &WorkItem) -> Result<StepResult, StepError> {
        let outcome = timed(
            "classify",
            self.config.classify_timeout,
            self.actuator.classify(session_id, item),
        )
        .await
        .map_err(|err| err.to_string());
        let error = outcome.as_ref().err().cloned();
        if let Some(message) = &error {
            error!(
                session_id,
                item_id = %item.item_id,
                step = %StepKind::Classify,
                "classification failed: {message}"
            );
        }
        let relation = self.commit(session_id, &item.item_id, |item| {
            Ok(apply_classification(item, outcome, Utc::now()))
        })?;
        Ok(StepResult::Classified { relation, error })
    }

    async fn perform(
        &self,
        step: StepKind,
        session: &Session,
        item: &WorkItem,
    ) -> Result<StepEffect, Failure> {
        let action_timeout = self.config.surface.action;
        let session_id = session.session_id.as_str();
        match step {
            StepKind::Classify => Err(Failure::Fatal(StepError::Invariant(
                "classify has no status-bearing action".to_string(),
            ))),
            StepKind::Primary => {
                let bound = timed(
                    "surface check",
                    action_timeout,
                    self.actuator.has_surface(session_id),
                )
                .await?;
                if !bound {
                    return Err(Failure::Fatal(StepError::NoSurface(session_id.to_string())));
                }
                timed(
                    "primary engagement",
                    action_timeout,
                    self.actuator.primary_engage(session_id, item),
                )
                .await?;
                Ok(StepEffect::Completed { generated: None })
            }
            StepKind::Response => {
                let prompt = self.prompts.render_response(session, item).map_err(|err| {
                    ActionError::Structural(format!("render response prompt: {err:#}"))
                })?;
                let text = match self.generate(prompt).await? {
                    Generation::Skip => return Ok(StepEffect::Skipped),
                    Generation::Text(text) => text,
                };
                timed(
                    "submit response",
                    action_timeout,
                    self.actuator.submit_response(session_id, item, &text),
                )
                .await?;
                Ok(StepEffect::Completed {
                    generated: Some(text),
                })
            }
            StepKind::Secondary => {
                let handle = derive_handle(&self.config.handle_pattern, item)
                    .map_err(ActionError::Structural)?;
                let prompt = self
                    .prompts
                    .render_secondary(session, item, &handle)
                    .map_err(|err| {
                        ActionError::Structural(format!("render secondary prompt: {err:#}"))
                    })?;
                let text = match self.generate(prompt).await? {
                    Generation::Skip => return Ok(StepEffect::Skipped),
                    Generation::Text(text) => text,
                };
                send_via_transient_surface(&*self.actuator, &handle, &text, self.config.surface)
                    .await?;
                Ok(StepEffect::Completed {
                    generated: Some(text),
                })
            }
        }
    }

    async fn generate(&self, prompt: String) -> Result<Generation, ActionError> {
        let request = GenerationRequest {
            prompt,
            params: self.config.generation.clone(),
        };
        Ok(self.generator.generate(&request).await?)
    }

    fn record_failure(
        &self,
        session_id: &str,
        item_id: &str,
        step: StepKind,
        err: &ActionError,
    ) -> Result<StepResult, StepError> {
        let message = err.to_string();
        error!(session_id, item_id, step = %step, "step failed: {message}");
        let disposition = self.commit(session_id, item_id, |item| {
            apply_step_failure(
                item,
                step,
                &message,
                self.config.max_attempts,
                err.is_permanent(),
            )
        })?;
        let exhausted = match disposition {
            FailureDisposition::Retry {
                attempts,
                max_attempts,
            } => {
                warn!(session_id, item_id, step = %step, attempts, max_attempts, "step will be retried");
                false
            }
            FailureDisposition::Exhausted { attempts } => {
                warn!(session_id, item_id, step = %step, attempts, "step marked failed");
                true
            }
        };
        Ok(StepResult::Failed {
            error: message,
            exhausted,
        })
    }

    /// Apply a transition to the latest stored copy of the item, check it
    /// only moves forward, persist, and broadcast the new item list.
    fn commit<T>(
        &self,
        session_id: &str,
        item_id: &str,
        apply: impl FnOnce(&mut WorkItem) -> Result<T, String>,
    ) -> Result<T, StepError> {
        let (value, session) = self.store.update(session_id, |session| {
            let prev = session.clone();
            let item = session
                .item_mut(item_id)
                .ok_or_else(|| StepError::MissingItem {
                    session_id: session_id.to_string(),
                    item_id: item_id.to_string(),
                })?;
            let value = apply(item).map_err(StepError::Invariant)?;
            let violations = check_forward_only(&prev, session);
            if !violations.is_empty() {
                return Err(StepError::Invariant(violations.join("; ")));
            }
            Ok(value)
        })?;
        self.broadcaster.publish(Snapshot::items(&session));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_update::SKIPPED_BY_POLICY;
    use crate::core::types::StepStatus;
    use crate::io::generator::GenerationError;
    use std::sync::Arc;

    use tokio::sync::Semaphore;

    use crate::test_support::{
        Harness, LogCapture, ScriptedActuator, ScriptedGenerator, SurfaceBehavior, done_item,
        item, session_with,
    };

    fn primary_done(id: &str, relation: Relation) -> WorkItem {
        let mut it = item(id);
        it.origin_relation = relation;
        it.primary_status = StepStatus::Done;
        it
    }

    /// Verifies classify sets only the relation and broadcasts the new items.
    #[tokio::test]
    async fn classify_sets_relation_and_nothing_else() {
        let harness = Harness::new()
            .with_actuator(ScriptedActuator::new().with_relation("a", Relation::Related));
        harness.seed(session_with(vec![item("a"), item("b")]));
        let before = harness.session("session-1");

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        assert_eq!(outcome.step, StepKind::Classify);
        assert_eq!(
            outcome.result,
            StepResult::Classified {
                relation: Relation::Related,
                error: None
            }
        );
        let after = harness.session("session-1");
        let mut expected = before.items[0].clone();
        expected.origin_relation = Relation::Related;
        expected.timestamps.classified_at = after.items[0].timestamps.classified_at;
        assert_eq!(after.items[0], expected);
        assert_eq!(after.items[1], before.items[1]);
        assert_eq!(harness.actuator.calls(), vec!["classify:a"]);
        assert_eq!(harness.recorder.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn classify_failure_falls_back_to_unrelated() {
        let harness = Harness::new().with_actuator(ScriptedActuator::new().fail("classify", "a", 1));
        harness.seed(session_with(vec![item("a")]));

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        assert!(matches!(
            outcome.result,
            StepResult::Classified {
                relation: Relation::Unrelated,
                error: Some(_)
            }
        ));
        let it = &harness.session("session-1").items[0];
        assert_eq!(it.origin_relation, Relation::Unrelated);
        assert_eq!(it.attempts.classify, 1);
        assert!(it.last_error.is_some());
    }

    #[tokio::test]
    async fn primary_marks_done_when_surface_is_bound() {
        let mut it = item("a");
        it.origin_relation = Relation::Unrelated;
        let harness = Harness::new();
        harness.seed(session_with(vec![it]));

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        assert_eq!(outcome.result, StepResult::Completed);
        let it = &harness.session("session-1").items[0];
        assert_eq!(it.primary_status, StepStatus::Done);
        assert!(it.timestamps.primary_at.is_some());
        assert_eq!(
            harness.actuator.calls(),
            vec!["has_surface:session-1", "primary:a"]
        );
    }

    #[tokio::test]
    async fn missing_surface_is_session_level_and_leaves_item_untouched() {
        let mut it = item("a");
        it.origin_relation = Relation::Unrelated;
        let harness = Harness::new().with_actuator(ScriptedActuator::new().without_surface());
        harness.seed(session_with(vec![it]));
        let before = harness.session("session-1");

        let err = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::NoSurface(_)));
        assert_eq!(harness.session("session-1").items, before.items);
    }

    /// Verifies the skip sentinel completes the response step without acting.
    #[tokio::test]
    async fn skip_sentinel_completes_response_without_submitting() {
        let harness = Harness::new().with_generator(ScriptedGenerator::new(vec![Ok(
            Generation::Skip,
        )]));
        harness.seed(session_with(vec![primary_done("a", Relation::Unrelated)]));

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        assert_eq!(outcome.result, StepResult::Skipped);
        let it = &harness.session("session-1").items[0];
        assert_eq!(it.response_status, StepStatus::Done);
        assert_eq!(it.last_error.as_deref(), Some(SKIPPED_BY_POLICY));
        assert!(harness.actuator.calls().is_empty());
    }

    /// Verifies a generation failure leaves the response pending for retry
    /// and is logged at error level with the item's coordinates.
    #[tokio::test]
    async fn generation_failure_keeps_response_pending() {
        let harness = Harness::new().with_generator(ScriptedGenerator::new(vec![Err(
            GenerationError::MissingCredential,
        )]));
        harness.seed(session_with(vec![primary_done("a", Relation::Unrelated)]));
        let logs = LogCapture::new();
        let guard = logs.install();

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");
        drop(guard);

        let failures = logs.lines_with("step failed: no generation credential configured");
        assert_eq!(failures.len(), 1, "{}", logs.contents());
        let line = &failures[0];
        assert!(line.contains("ERROR"), "{line}");
        assert!(line.contains("session_id=\"session-1\""), "{line}");
        assert!(line.contains("item_id=\"a\""), "{line}");
        assert!(line.contains("step=response"), "{line}");

        assert!(matches!(
            outcome.result,
            StepResult::Failed {
                exhausted: false,
                ..
            }
        ));
        let it = &harness.session("session-1").items[0];
        assert_eq!(it.response_status, StepStatus::Pending);
        assert_eq!(it.attempts.response, 1);
        assert_eq!(
            it.last_error.as_deref(),
            Some("no generation credential configured")
        );
    }

    #[tokio::test]
    async fn repeated_failures_mark_step_failed_after_max_attempts() {
        let harness =
            Harness::new().with_actuator(ScriptedActuator::new().fail("respond", "a", u32::MAX));
        harness.seed(session_with(vec![primary_done("a", Relation::Unrelated)]));
        let executor = harness.executor();

        for expected in 1..=2 {
            let outcome = executor.run_step("session-1", "a").await.expect("step");
            assert!(matches!(
                outcome.result,
                StepResult::Failed {
                    exhausted: false,
                    ..
                }
            ));
            assert_eq!(
                harness.session("session-1").items[0].attempts.response,
                expected
            );
        }

        let outcome = executor.run_step("session-1", "a").await.expect("step");
        assert!(matches!(
            outcome.result,
            StepResult::Failed {
                exhausted: true,
                ..
            }
        ));
        let it = &harness.session("session-1").items[0];
        assert_eq!(it.response_status, StepStatus::Failed);
        assert_eq!(it.attempts.response, 3);
    }

    #[tokio::test]
    async fn response_stores_generated_text() {
        let harness = Harness::new().with_generator(ScriptedGenerator::new(vec![Ok(
            Generation::Text("Great point!".to_string()),
        )]));
        harness.seed(session_with(vec![primary_done("a", Relation::Unrelated)]));

        harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        let it = &harness.session("session-1").items[0];
        assert_eq!(it.response_status, StepStatus::Done);
        assert_eq!(it.generated_response.as_deref(), Some("Great point!"));
        assert_eq!(harness.actuator.calls(), vec!["respond:a:Great point!"]);
        assert!(harness.generator.prompts()[0].contains("a content"));
    }

    #[tokio::test]
    async fn secondary_sends_through_transient_surface() {
        let mut it = done_item("a", Relation::Related);
        it.secondary_status = StepStatus::Pending;
        let harness = Harness::new().with_generator(ScriptedGenerator::new(vec![Ok(
            Generation::Text("Hi!".to_string()),
        )]));
        harness.seed(session_with(vec![it]));

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        assert_eq!(outcome.step, StepKind::Secondary);
        assert_eq!(outcome.result, StepResult::Completed);
        let it = &harness.session("session-1").items[0];
        assert_eq!(it.secondary_status, StepStatus::Done);
        assert_eq!(it.generated_secondary_message.as_deref(), Some("Hi!"));
        assert_eq!(
            harness.actuator.calls(),
            vec!["open:a-handle", "ready:a-handle", "send:a-handle:Hi!", "close:a-handle"]
        );
        assert_eq!(harness.actuator.open_surfaces(), 0);
    }

    #[tokio::test]
    async fn secondary_surface_failure_is_retried_and_surface_released() {
        let mut it = done_item("a", Relation::Related);
        it.secondary_status = StepStatus::Pending;
        let harness =
            Harness::new().with_actuator(ScriptedActuator::new().with_surface(SurfaceBehavior::FailSend));
        harness.seed(session_with(vec![it]));

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        assert!(matches!(
            outcome.result,
            StepResult::Failed {
                exhausted: false,
                ..
            }
        ));
        assert_eq!(harness.actuator.open_surfaces(), 0);
        assert_eq!(
            harness.session("session-1").items[0].secondary_status,
            StepStatus::Pending
        );
    }

    #[tokio::test]
    async fn underivable_handle_fails_secondary_immediately() {
        let mut it = done_item("a", Relation::Related);
        it.secondary_status = StepStatus::Pending;
        it.profile_url = Some("https://example.com/company/acme".to_string());
        let harness = Harness::new();
        harness.seed(session_with(vec![it]));

        let outcome = harness
            .executor()
            .run_step("session-1", "a")
            .await
            .expect("step");

        assert!(matches!(
            outcome.result,
            StepResult::Failed {
                exhausted: true,
                ..
            }
        ));
        let it = &harness.session("session-1").items[0];
        assert_eq!(it.secondary_status, StepStatus::Failed);
        assert!(harness.generator.prompts().is_empty());
        assert!(harness.actuator.calls().is_empty());
    }

    #[tokio::test]
    async fn items_appended_during_a_step_are_preserved() {
        let gate = Arc::new(Semaphore::new(0));
        let mut it = item("a");
        it.origin_relation = Relation::Unrelated;
        let harness = Harness::new()
            .with_actuator(ScriptedActuator::new().with_primary_gate(Arc::clone(&gate)));
        harness.seed(session_with(vec![it]));
        let executor = harness.executor();

        let step = tokio::spawn(async move { executor.run_step("session-1", "a").await });
        while !harness.actuator.calls().contains(&"primary:a".to_string()) {
            tokio::task::yield_now().await;
        }
        harness
            .store
            .update("session-1", |session| {
                session.append_items(vec![item("b")], Utc::now());
                Ok::<_, anyhow::Error>(())
            })
            .expect("append");
        gate.add_permits(1);
        step.await.expect("join").expect("step");

        let session = harness.session("session-1");
        let ids: Vec<&str> = session.items.iter().map(|it| it.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(session.items[0].primary_status, StepStatus::Done);
        assert_eq!(session.items[1].primary_status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_item_and_session_are_session_level_errors() {
        let harness = Harness::new();
        harness.seed(session_with(vec![item("a")]));
        let executor = harness.executor();

        assert!(matches!(
            executor.run_step("session-1", "zzz").await,
            Err(StepError::MissingItem { .. })
        ));
        assert!(matches!(
            executor.run_step("nope", "a").await,
            Err(StepError::MissingSessionRecord(_))
        ));
    }
}
