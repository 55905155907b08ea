//! Shared application state for the control server.

use std::sync::Arc;

use engager::controller::RunController;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The single controller driving runs for this project.
    pub controller: Arc<RunController>,
}

impl AppState {
    pub fn new(controller: RunController) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }
}
