//! The run-loop: scan, step, pause, repeat until the session is exhausted or
//! the controller leaves `running`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info};

use crate::controller::Engine;
use crate::core::selector::next_actionable;
use crate::core::types::RunState;
use crate::error::StepError;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No actionable item remained; the run is `idle` again.
    Complete { session_id: String },
    /// The controller left `running` (stop or reset).
    Halted { run_state: RunState },
    /// A session-level failure moved the run to `error`.
    Failed {
        session_id: Option<String>,
        error: String,
    },
}

/// Drive the active session until the loop must stop.
///
/// Every exit goes through the controller, which publishes the final
/// snapshot and releases the in-progress flag under its state lock.
pub(crate) async fn run_loop(engine: Arc<Engine>) -> LoopStop {
    info!("run-loop started");
    let mut steps = 0u64;
    let stop = loop {
        let session_id = match engine.checkpoint() {
            Ok(session_id) => session_id,
            Err(stop) => break stop,
        };
        let Some(session) = engine.store.get(&session_id) else {
            let err = StepError::MissingSessionRecord(session_id.clone());
            break engine.fail(&session_id, err.to_string());
        };
        let Some(item) = next_actionable(&session) else {
            match engine.complete(&session_id) {
                Some(stop) => break stop,
                None => continue,
            }
        };
        let item_id = item.item_id.clone();

        let step = AssertUnwindSafe(engine.executor.run_step(&session_id, &item_id));
        match step.catch_unwind().await {
            Ok(Ok(outcome)) => {
                steps += 1;
                debug!(
                    session_id = %session_id,
                    item_id = %outcome.item_id,
                    step = %outcome.step,
                    "loop step done"
                );
            }
            Ok(Err(err)) => break engine.fail(&session_id, err.to_string()),
            Err(payload) => {
                let err = StepError::Panicked(panic_message(payload.as_ref()));
                break engine.fail(&session_id, err.to_string());
            }
        }

        if !engine.step_delay.is_zero() {
            tokio::time::sleep(engine.step_delay).await;
        }
    };
    info!(steps, stop = ?stop, "run-loop finished");
    stop
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
