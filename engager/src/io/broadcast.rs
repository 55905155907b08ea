//! Best-effort fan-out of state snapshots to observers.
//!
//! Snapshots go to an in-process broadcast channel (consumed by the SSE
//! endpoint) and to every registered [`Subscriber`]. Delivery never blocks
//! the run-loop and a failing subscriber never prevents delivery to the rest.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::types::{RunState, Session, WorkItem};

/// Partial state update. Absent fields are unchanged; consumers merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_state: Option<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<WorkItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Snapshot {
    pub fn run_state(run_state: RunState, session_id: Option<&str>) -> Self {
        Self {
            run_state: Some(run_state),
            items: None,
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn items(session: &Session) -> Self {
        Self {
            run_state: None,
            items: Some(session.items.clone()),
            session_id: Some(session.session_id.clone()),
        }
    }

    pub fn full(run_state: RunState, session: &Session) -> Self {
        Self {
            run_state: Some(run_state),
            ..Self::items(session)
        }
    }

    /// Apply `update` on top of `self`, the way observers are expected to.
    pub fn merge(&mut self, update: Snapshot) {
        if update.run_state.is_some() {
            self.run_state = update.run_state;
        }
        if update.items.is_some() {
            self.items = update.items;
        }
        if update.session_id.is_some() {
            self.session_id = update.session_id;
        }
    }
}

/// An observer that wants every snapshot pushed to it.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, snapshot: &Snapshot) -> Result<()>;
}

pub struct Broadcaster {
    tx: broadcast::Sender<Snapshot>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Push `snapshot` to every observer. Never fails.
    pub fn publish(&self, snapshot: Snapshot) {
        let subscribers: Vec<Arc<dyn Subscriber>> = match self.subscribers.read() {
            Ok(subscribers) => subscribers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for subscriber in &subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber.deliver(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(subscriber = subscriber.name(), "snapshot delivery failed: {err:#}");
                }
                Err(_) => {
                    warn!(subscriber = subscriber.name(), "snapshot delivery panicked");
                }
            }
        }
        // No receivers is not an error.
        if self.tx.send(snapshot).is_err() {
            debug!("no live snapshot receivers");
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
