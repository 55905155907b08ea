//! Actuator abstraction for effectful actions on the live surface.
//!
//! The [`Actuator`] trait decouples step orchestration from whatever drives the
//! external surface (currently an external command, see
//! [`crate::io::command_actuator`]). Tests use scripted actuators that record
//! calls without touching anything.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::types::{Relation, WorkItem};
use crate::error::ActionError;

/// An ephemeral external context opened for the duration of one step.
#[async_trait]
pub trait Surface: Send {
    /// Resolve once the surface can accept actions.
    async fn wait_ready(&mut self) -> Result<()>;
    async fn send_message(&mut self, text: &str) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Actuator: Send + Sync {
    /// Determine whether the item's counterparty is already connected.
    async fn classify(&self, session_id: &str, item: &WorkItem) -> Result<Relation>;

    /// Whether an actuation surface is currently bound to the session.
    async fn has_surface(&self, session_id: &str) -> Result<bool>;

    async fn primary_engage(&self, session_id: &str, item: &WorkItem) -> Result<()>;

    async fn submit_response(&self, session_id: &str, item: &WorkItem, text: &str) -> Result<()>;

    /// Open a new transient surface addressed at `handle`.
    async fn open_surface(&self, handle: &str) -> Result<Box<dyn Surface>>;
}

/// Run `action` under `limit`, mapping expiry to a typed timeout and actuator
/// failures to [`ActionError::Actuator`].
pub async fn timed<T, F>(what: &'static str, limit: Duration, action: F) -> Result<T, ActionError>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, action).await {
        Ok(result) => result.map_err(ActionError::actuator),
        Err(_) => Err(ActionError::Timeout { what, after: limit }),
    }
}

/// Scoped hold on a transient surface.
///
/// [`SurfaceLease::release`] closes the surface. If the lease is dropped
/// without being released (the step future was cancelled or panicked), the
/// surface is closed on a background task. Either way the close is bounded
/// by the limit the lease was acquired with.
pub struct SurfaceLease {
    handle: String,
    surface: Option<Box<dyn Surface>>,
    close_limit: Duration,
}

impl SurfaceLease {
    pub async fn acquire(
        actuator: &dyn Actuator,
        handle: &str,
        limit: Duration,
    ) -> Result<Self, ActionError> {
        let surface = timed("open surface", limit, actuator.open_surface(handle)).await?;
        debug!(handle, "transient surface opened");
        Ok(Self {
            handle: handle.to_string(),
            surface: Some(surface),
            close_limit: limit,
        })
    }

    fn surface(&mut self) -> Result<&mut Box<dyn Surface>, ActionError> {
        self.surface
            .as_mut()
            .ok_or_else(|| ActionError::Structural("surface already released".to_string()))
    }

    pub async fn release(mut self) {
        if let Some(mut surface) = self.surface.take() {
            match timed("close surface", self.close_limit, surface.close()).await {
                Ok(()) => debug!(handle = %self.handle, "transient surface closed"),
                Err(err) => {
                    warn!(handle = %self.handle, "failed to close transient surface: {err}");
                }
            }
        }
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        let Some(mut surface) = self.surface.take() else {
            return;
        };
        let handle = std::mem::take(&mut self.handle);
        let limit = self.close_limit;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = timed("close surface", limit, surface.close()).await {
                        warn!(handle = %handle, "failed to close abandoned surface: {err}");
                    }
                });
            }
            Err(_) => warn!(handle = %handle, "surface abandoned outside a runtime"),
        }
    }
}

/// Timeouts for one transient-surface send.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceTimeouts {
    pub ready: Duration,
    pub action: Duration,
}

/// Open a transient surface for `handle`, wait for it, send `text`, and
/// close it on every exit path.
pub async fn send_via_transient_surface(
    actuator: &dyn Actuator,
    handle: &str,
    text: &str,
    timeouts: SurfaceTimeouts,
) -> Result<(), ActionError> {
    let mut lease = SurfaceLease::acquire(actuator, handle, timeouts.action).await?;
    let result = deliver(&mut lease, text, timeouts).await;
    lease.release().await;
    result
}

async fn deliver(
    lease: &mut SurfaceLease,
    text: &str,
    timeouts: SurfaceTimeouts,
) -> Result<(), ActionError> {
    let surface = lease.surface()?;
    timed("surface readiness", timeouts.ready, surface.wait_ready()).await?;
    timed("send message", timeouts.action, surface.send_message(text)).await
}
