//! Engine configuration stored under `.engager/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::handle::DEFAULT_HANDLE_PATTERN;
use crate::io::prompt::PromptRenderer;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that keep the external surface comfortably below rate limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause between two steps of the run-loop, in milliseconds.
    pub step_delay_ms: u64,

    /// Failed attempts after which a step is marked `failed`.
    pub max_attempts: u32,

    pub classify_timeout_secs: u64,

    /// How long a transient surface may take to become ready.
    pub surface_ready_timeout_secs: u64,

    /// Budget for every other single actuator action.
    pub action_timeout_secs: u64,

    /// Regex whose first capture group extracts the target handle from a
    /// profile link.
    pub handle_pattern: String,

    /// Rendered prompts above this size are re-rendered without the
    /// session context.
    pub prompt_budget_bytes: usize,

    pub generation: GenerationConfig,
    pub prompts: PromptConfig,
    pub actuator: ActuatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    pub model: String,
    /// Inline credential. Prefer `api_key_env`.
    pub api_key: String,
    /// Environment variable read when `api_key` is empty.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

/// Prompt template overrides. `None` uses the built-in templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub response: Option<String>,
    pub secondary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Command invoked for every action (e.g. `["engager-actuator"]`).
    pub command: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: 3_000,
            max_attempts: 3,
            classify_timeout_secs: 30,
            surface_ready_timeout_secs: 20,
            action_timeout_secs: 60,
            handle_pattern: DEFAULT_HANDLE_PATTERN.to_string(),
            prompt_budget_bytes: 16_000,
            generation: GenerationConfig::default(),
            prompts: PromptConfig::default(),
            actuator: ActuatorConfig::default(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.7,
            max_tokens: 300,
            request_timeout_secs: 60,
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            command: vec!["engager-actuator".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.classify_timeout_secs == 0 {
            return Err(anyhow!("classify_timeout_secs must be > 0"));
        }
        if self.surface_ready_timeout_secs == 0 {
            return Err(anyhow!("surface_ready_timeout_secs must be > 0"));
        }
        if self.action_timeout_secs == 0 {
            return Err(anyhow!("action_timeout_secs must be > 0"));
        }
        let pattern = self.handle_regex()?;
        if pattern.captures_len() < 2 {
            return Err(anyhow!("handle_pattern must contain a capture group"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.generation.base_url.trim().is_empty() {
            return Err(anyhow!("generation.base_url must be non-empty"));
        }
        if self.generation.model.trim().is_empty() {
            return Err(anyhow!("generation.model must be non-empty"));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(anyhow!("generation.temperature must be within 0.0..=2.0"));
        }
        if self.generation.request_timeout_secs == 0 {
            return Err(anyhow!("generation.request_timeout_secs must be > 0"));
        }
        if self.actuator.command.is_empty() || self.actuator.command[0].trim().is_empty() {
            return Err(anyhow!("actuator.command must be a non-empty array"));
        }
        PromptRenderer::from_config(&self.prompts).context("prompts")?;
        Ok(())
    }

    pub fn handle_regex(&self) -> Result<Regex> {
        Regex::new(&self.handle_pattern)
            .with_context(|| format!("invalid handle_pattern '{}'", self.handle_pattern))
    }

    pub fn prompt_renderer(&self) -> Result<PromptRenderer> {
        Ok(PromptRenderer::from_config(&self.prompts)?.with_budget(self.prompt_budget_bytes))
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
