//! Run control: owns the run state, the active session, and the run-loop task.
//!
//! All control transitions and the run-loop's exit decisions happen under one
//! state mutex. The mutex is never held across an `.await`; the loop only
//! takes it between steps.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::selector::next_actionable;
use crate::core::types::{RunState, Session, WorkItem};
use crate::error::{ControlError, StepError};
use crate::io::broadcast::{Broadcaster, Snapshot};
use crate::io::session_store::SessionStore;
use crate::looping::{self, LoopStop};
use crate::step::StepExecutor;

/// Externally visible controller state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub run_state: RunState,
    pub active_session_id: Option<String>,
}

/// Descriptive fields for a session created by [`RunController::add_items`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSource {
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ControlState {
    pub(crate) run_state: RunState,
    pub(crate) active_session_id: Option<String>,
}

/// Lifecycle of the run-loop task, observed by [`RunController::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopPhase {
    NeverStarted,
    Active,
    Stopped(LoopStop),
}

pub(crate) struct Engine {
    state: Mutex<ControlState>,
    loop_active: AtomicBool,
    phase: watch::Sender<LoopPhase>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) broadcaster: Arc<Broadcaster>,
    pub(crate) executor: StepExecutor,
    pub(crate) step_delay: Duration,
}

/// Drives one session at a time through the pipeline.
pub struct RunController {
    engine: Arc<Engine>,
}

impl RunController {
    pub fn new(executor: StepExecutor, step_delay: Duration) -> Self {
        Self {
            engine: Arc::new(Engine {
                state: Mutex::new(ControlState::default()),
                loop_active: AtomicBool::new(false),
                phase: watch::Sender::new(LoopPhase::NeverStarted),
                store: Arc::clone(executor.store()),
                broadcaster: Arc::clone(executor.broadcaster()),
                executor,
                step_delay,
            }),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.engine.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.engine.broadcaster
    }

    pub fn status(&self) -> RunStatus {
        let state = self.engine.lock_state();
        RunStatus {
            run_state: state.run_state,
            active_session_id: state.active_session_id.clone(),
        }
    }

    /// Begin processing `session_id`. Returns once the run-loop is spawned.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&self, session_id: &str) -> Result<(), ControlError> {
        let mut state = self.engine.lock_state();
        if state.run_state != RunState::Idle {
            return Err(ControlError::AlreadyRunning);
        }
        if self.engine.store.load(session_id)?.is_none() {
            return Err(ControlError::NoSession(session_id.to_string()));
        }
        let session = self.engine.persist_run_state(session_id, RunState::Running)?;

        state.run_state = RunState::Running;
        state.active_session_id = Some(session_id.to_string());
        info!(session_id, "run started");
        self.engine
            .broadcaster
            .publish(Snapshot::full(RunState::Running, &session));
        self.engine.spawn_loop();
        Ok(())
    }

    /// Pause after the in-flight step, if any. Never interrupts a step.
    pub fn stop(&self) -> Result<(), ControlError> {
        let mut state = self.engine.lock_state();
        if state.run_state != RunState::Running {
            return Err(ControlError::NotRunning);
        }
        if let Some(session_id) = &state.active_session_id {
            self.engine
                .persist_run_state_if_present(session_id, RunState::Paused)?;
        }
        state.run_state = RunState::Paused;
        info!(session_id = ?state.active_session_id, "run paused");
        self.engine.broadcaster.publish(Snapshot::run_state(
            RunState::Paused,
            state.active_session_id.as_deref(),
        ));
        Ok(())
    }

    /// Continue a paused run from the scan policy's current position.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn resume(&self) -> Result<(), ControlError> {
        let mut state = self.engine.lock_state();
        if state.run_state != RunState::Paused {
            return Err(ControlError::NotPaused);
        }
        let session_id = state
            .active_session_id
            .clone()
            .ok_or(ControlError::NotPaused)?;
        if self.engine.store.load(&session_id)?.is_none() {
            return Err(ControlError::NoSession(session_id));
        }
        let session = self
            .engine
            .persist_run_state(&session_id, RunState::Running)?;

        state.run_state = RunState::Running;
        info!(session_id = %session_id, "run resumed");
        self.engine
            .broadcaster
            .publish(Snapshot::full(RunState::Running, &session));
        self.engine.spawn_loop();
        Ok(())
    }

    /// Return to `idle` from any state and forget the active session.
    /// Items are left untouched.
    pub fn reset(&self) -> Result<(), ControlError> {
        let mut state = self.engine.lock_state();
        let former = state.active_session_id.take();
        state.run_state = RunState::Idle;
        info!(session_id = ?former, "run reset");
        self.engine
            .broadcaster
            .publish(Snapshot::run_state(RunState::Idle, former.as_deref()));
        if let Some(session_id) = &former {
            self.engine
                .persist_run_state_if_present(session_id, RunState::Idle)?;
        }
        Ok(())
    }

    /// Re-bind a session persisted as `running` or `paused` after a restart.
    ///
    /// The session becomes the active session in `paused` state, so a
    /// following [`RunController::resume`] continues it. Returns its id.
    pub fn restore(&self) -> Result<Option<String>, ControlError> {
        let mut state = self.engine.lock_state();
        if state.run_state != RunState::Idle {
            return Err(ControlError::AlreadyRunning);
        }
        let candidate = self
            .engine
            .store
            .session_ids()
            .into_iter()
            .filter_map(|id| self.engine.store.get(&id))
            .filter(|session| {
                matches!(session.run_state, RunState::Running | RunState::Paused)
            })
            .max_by_key(|session| session.last_updated);
        let Some(session) = candidate else {
            return Ok(None);
        };
        let session_id = session.session_id;
        let session = self
            .engine
            .persist_run_state(&session_id, RunState::Paused)?;

        state.run_state = RunState::Paused;
        state.active_session_id = Some(session_id.clone());
        info!(session_id = %session_id, "interrupted run restored as paused");
        self.engine
            .broadcaster
            .publish(Snapshot::full(RunState::Paused, &session));
        Ok(Some(session_id))
    }

    /// Delete a session record. Rejected while the session is being run.
    pub fn clear_session(&self, session_id: &str) -> Result<(), ControlError> {
        let state = self.engine.lock_state();
        if state.active_session_id.as_deref() == Some(session_id)
            && state.run_state != RunState::Idle
        {
            return Err(ControlError::AlreadyRunning);
        }
        if self.engine.store.load(session_id)?.is_none() {
            return Err(ControlError::NoSession(session_id.to_string()));
        }
        self.engine.store.delete(session_id)?;
        info!(session_id, "session cleared");
        self.engine.broadcaster.publish(Snapshot {
            run_state: None,
            items: Some(Vec::new()),
            session_id: Some(session_id.to_string()),
        });
        Ok(())
    }

    /// Enqueue `items` on `session_id`, creating the session when missing.
    ///
    /// Items whose ids are already present are ignored. Returns how many
    /// were appended.
    pub fn add_items(
        &self,
        session_id: &str,
        items: Vec<WorkItem>,
        source: SessionSource,
    ) -> Result<usize, ControlError> {
        let store = &self.engine.store;
        if store.load(session_id)?.is_none() {
            let mut session = Session::new(session_id);
            store.save(session_id, &mut session)?;
            debug!(session_id, "session created");
        }
        let (added, session) = store.update(session_id, |session| {
            session.source_url = session.source_url.take().or(source.source_url);
            session.title = session.title.take().or(source.title);
            session.context = session.context.take().or(source.context);
            Ok::<_, ControlError>(session.append_items(items, Utc::now()))
        })?;
        info!(session_id, added, total = session.items.len(), "items enqueued");
        if added > 0 {
            self.engine.broadcaster.publish(Snapshot::items(&session));
        }
        Ok(added)
    }

    /// Wait until no run-loop is active and return why the last one stopped.
    ///
    /// Cancel-safe. Returns `None` if no loop was ever spawned.
    pub async fn join(&self) -> Option<LoopStop> {
        let mut rx = self.engine.phase.subscribe();
        let phase = rx
            .wait_for(|phase| *phase != LoopPhase::Active)
            .await
            .map(|phase| (*phase).clone());
        match phase {
            Ok(LoopPhase::Stopped(stop)) => Some(stop),
            Ok(_) => None,
            Err(err) => {
                error!("run-loop phase channel closed: {err}");
                None
            }
        }
    }
}

impl Engine {
    fn lock_state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the run-loop unless one is active. Called with the state lock
    /// held, so it cannot race the loop's own exit.
    fn spawn_loop(self: &Arc<Self>) {
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("run-loop already active");
            return;
        }
        self.phase.send_replace(LoopPhase::Active);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let run = AssertUnwindSafe(looping::run_loop(Arc::clone(&engine))).catch_unwind();
            if let Err(payload) = run.await {
                engine.abort(looping::panic_message(payload.as_ref()));
            }
        });
    }

    fn persist_run_state(
        &self,
        session_id: &str,
        run_state: RunState,
    ) -> Result<Session, ControlError> {
        let ((), session) = self.store.update(session_id, |session| {
            session.run_state = run_state;
            Ok::<_, ControlError>(())
        })?;
        Ok(session)
    }

    fn persist_run_state_if_present(
        &self,
        session_id: &str,
        run_state: RunState,
    ) -> Result<Option<Session>, ControlError> {
        if self.store.get(session_id).is_none() {
            return Ok(None);
        }
        self.persist_run_state(session_id, run_state).map(Some)
    }

    /// Session the loop should work on next, or why it must stop.
    ///
    /// When the loop must stop, the final snapshot is published and the
    /// in-progress flag released before the state lock is dropped.
    pub(crate) fn checkpoint(&self) -> Result<String, LoopStop> {
        let mut state = self.lock_state();
        if state.run_state != RunState::Running {
            let stop = LoopStop::Halted {
                run_state: state.run_state,
            };
            return Err(self.finish(&state, stop));
        }
        match state.active_session_id.clone() {
            Some(session_id) => Ok(session_id),
            None => {
                error!("running without an active session");
                state.run_state = RunState::Error;
                let stop = LoopStop::Failed {
                    session_id: None,
                    error: StepError::NoActiveSession.to_string(),
                };
                Err(self.finish(&state, stop))
            }
        }
    }

    /// Mark the run complete if `session_id` still has nothing to do.
    ///
    /// Returns `None` when new work appeared and the loop should continue.
    pub(crate) fn complete(&self, session_id: &str) -> Option<LoopStop> {
        let mut state = self.lock_state();
        if state.run_state != RunState::Running
            || state.active_session_id.as_deref() != Some(session_id)
        {
            let stop = LoopStop::Halted {
                run_state: state.run_state,
            };
            return Some(self.finish(&state, stop));
        }
        if self
            .store
            .get(session_id)
            .is_some_and(|session| next_actionable(&session).is_some())
        {
            return None;
        }
        state.run_state = RunState::Idle;
        state.active_session_id = None;
        if let Err(err) = self.persist_run_state_if_present(session_id, RunState::Idle) {
            warn!(session_id, "failed to persist completed run state: {err}");
        }
        info!(session_id, "run complete");
        let stop = LoopStop::Complete {
            session_id: session_id.to_string(),
        };
        Some(self.finish_with(RunState::Idle, Some(session_id), stop))
    }

    /// Move the run to `error` after a session-level failure.
    pub(crate) fn fail(&self, session_id: &str, error: String) -> LoopStop {
        let mut state = self.lock_state();
        let current = state.active_session_id.as_deref() == Some(session_id)
            && state.run_state != RunState::Idle;
        if current {
            state.run_state = RunState::Error;
            if let Err(err) = self.persist_run_state_if_present(session_id, RunState::Error) {
                warn!(session_id, "failed to persist error run state: {err}");
            }
        }
        error!(session_id, "run failed: {error}");
        let stop = LoopStop::Failed {
            session_id: Some(session_id.to_string()),
            error,
        };
        self.finish(&state, stop)
    }

    /// Backstop for a run-loop that panicked outside a step. Moves the run
    /// to `error` and releases the in-progress flag.
    fn abort(&self, message: String) -> LoopStop {
        let error = StepError::Panicked(message).to_string();
        let active = self.lock_state().active_session_id.clone();
        if let Some(session_id) = active {
            return self.fail(&session_id, error);
        }
        let mut state = self.lock_state();
        if state.run_state == RunState::Running {
            state.run_state = RunState::Error;
        }
        error!("run-loop aborted: {error}");
        let stop = LoopStop::Failed {
            session_id: None,
            error,
        };
        self.finish(&state, stop)
    }

    fn finish(&self, state: &ControlState, stop: LoopStop) -> LoopStop {
        self.finish_with(state.run_state, state.active_session_id.as_deref(), stop)
    }

    /// Publish the final snapshot and release the in-progress flag.
    fn finish_with(
        &self,
        run_state: RunState,
        session_id: Option<&str>,
        stop: LoopStop,
    ) -> LoopStop {
        let snapshot = match session_id.and_then(|id| self.store.get(id)) {
            Some(session) => Snapshot::full(run_state, &session),
            None => Snapshot::run_state(run_state, session_id),
        };
        self.broadcaster.publish(snapshot);
        self.loop_active.store(false, Ordering::Release);
        self.phase.send_replace(LoopPhase::Stopped(stop.clone()));
        stop
    }
}
