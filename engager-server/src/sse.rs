//! Server-Sent Events stream of engine snapshots.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use engager::controller::RunController;
use engager::io::broadcast::Snapshot;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

/// SSE endpoint handler.
///
/// Every client first receives the current state in full, then the sparse
/// snapshots published by the engine. A lagging client is resynchronized
/// with a full snapshot instead of replaying what it missed.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.controller.broadcaster().subscribe();
    let controller = state.controller;

    let stream = async_stream::stream! {
        yield Ok(snapshot_event(&current_snapshot(&controller)));

        loop {
            match rx.recv().await {
                Ok(snapshot) => yield Ok(snapshot_event(&snapshot)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, resending full state");
                    yield Ok(snapshot_event(&current_snapshot(&controller)));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("snapshot channel closed");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Full view of the controller: run state plus the active session's items.
fn current_snapshot(controller: &RunController) -> Snapshot {
    let status = controller.status();
    match status
        .active_session_id
        .as_deref()
        .and_then(|id| controller.store().get(id))
    {
        Some(session) => Snapshot::full(status.run_state, &session),
        None => Snapshot::run_state(status.run_state, None),
    }
}

fn snapshot_event(snapshot: &Snapshot) -> Event {
    match serde_json::to_string(snapshot) {
        Ok(json) => Event::default().event("snapshot").data(json),
        Err(err) => {
            warn!(error = %err, "failed to serialize snapshot");
            Event::default().event("snapshot").data("{}")
        }
    }
}
