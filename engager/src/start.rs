//! Wiring a [`RunController`] for a project root.
//!
//! The CLI and the HTTP server both build their controller here: the config
//! and session directory come from `.engager/`, the session cache is primed
//! from disk, and the production adapters are chosen from config.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::controller::RunController;
use crate::io::actuator::Actuator;
use crate::io::broadcast::Broadcaster;
use crate::io::command_actuator::CommandActuator;
use crate::io::config::{EngineConfig, load_config};
use crate::io::generator::{Generator, OpenAiGenerator};
use crate::io::init::EngagerPaths;
use crate::io::session_store::SessionStore;
use crate::step::{StepConfig, StepExecutor};

/// Load config for `root` and build a controller with the configured
/// command actuator and OpenAI-compatible generator.
pub fn open_controller(root: &Path) -> Result<RunController> {
    let paths = EngagerPaths::new(root);
    let cfg = load_config(&paths.config_path)
        .with_context(|| format!("load {}", paths.config_path.display()))?;
    let actuator: Arc<dyn Actuator> = Arc::new(CommandActuator::new(
        cfg.actuator.command.clone(),
        Duration::from_secs(cfg.action_timeout_secs),
    ));
    let generator: Arc<dyn Generator> = Arc::new(
        OpenAiGenerator::from_config(&cfg.generation).context("build generation client")?,
    );
    build_controller(&paths, &cfg, actuator, generator)
}

/// Build a controller over the session directory of `paths`.
///
/// The session cache is primed before returning; interrupted runs are not
/// restored (see [`RunController::restore`]).
pub fn build_controller(
    paths: &EngagerPaths,
    cfg: &EngineConfig,
    actuator: Arc<dyn Actuator>,
    generator: Arc<dyn Generator>,
) -> Result<RunController> {
    let store = Arc::new(SessionStore::open(&paths.sessions_dir)?);
    let loaded = store
        .load_all()
        .with_context(|| format!("load sessions from {}", paths.sessions_dir.display()))?;
    debug!(loaded, "session store ready");

    let executor = StepExecutor::new(
        store,
        actuator,
        generator,
        Arc::new(Broadcaster::default()),
        cfg.prompt_renderer()?,
        StepConfig::from_config(cfg)?,
    );
    info!(
        root = %paths.root.display(),
        step_delay_ms = cfg.step_delay_ms,
        max_attempts = cfg.max_attempts,
        "engine ready"
    );
    Ok(RunController::new(executor, cfg.step_delay()))
}
