//! Initialization helpers for `.engager/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{EngineConfig, write_config};

/// All canonical paths within `.engager/` for a project root.
#[derive(Debug, Clone)]
pub struct EngagerPaths {
    pub root: PathBuf,
    pub engager_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl EngagerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let engager_dir = root.join(".engager");
        Self {
            root: root.clone(),
            sessions_dir: engager_dir.join("sessions"),
            config_path: engager_dir.join("config.toml"),
            gitignore_path: engager_dir.join(".gitignore"),
            engager_dir,
        }
    }
}

/// Options for `init_engager`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the existing config with defaults.
    pub force: bool,
}

/// Create `.engager/` scaffolding in `root`.
///
/// Fails if `.engager/` already exists unless `options.force` is set.
/// Session records are never touched.
pub fn init_engager(root: &Path, options: &InitOptions) -> Result<EngagerPaths> {
    let paths = EngagerPaths::new(root);
    if paths.engager_dir.exists() && !options.force {
        return Err(anyhow!(
            "engager init: .engager already exists (use --force to overwrite)"
        ));
    }
    if paths.engager_dir.exists() && !paths.engager_dir.is_dir() {
        return Err(anyhow!(
            "engager init: .engager exists but is not a directory"
        ));
    }

    create_dir(&paths.engager_dir)?;
    create_dir(&paths.sessions_dir)?;
    write_file(&paths.gitignore_path, ENGAGER_GITIGNORE)?;
    write_config(&paths.config_path, &EngineConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

/// Session records hold third-party content; keep them out of version control.
const ENGAGER_GITIGNORE: &str = "sessions/\n";
