//! Session record persistence with an in-memory read cache.
//!
//! The cache is the source of truth while the engine runs; the directory of
//! JSON files is consulted only on a cache miss and when priming at startup.
//! Every record read from disk is checked against the embedded JSON Schema
//! and the semantic invariants.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::invariants::validate_session;
use crate::core::types::Session;

const SESSION_SCHEMA: &str = include_str!("../../schemas/session.v1.schema.json");

pub struct SessionStore {
    dir: Option<PathBuf>,
    validator: Option<Validator>,
    cache: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Store backed by one JSON file per session under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        let schema: Value = serde_json::from_str(SESSION_SCHEMA).context("parse session schema")?;
        let validator =
            validator_for(&schema).map_err(|err| anyhow!("invalid session schema: {}", err))?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            validator: Some(validator),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Cache-only store; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            validator: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached record for `session_id`, without touching disk.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Cached record, falling back to disk on a miss.
    pub fn load(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.get(session_id) {
            return Ok(Some(session));
        }
        let Some(session) = self.read_disk(session_id)? else {
            return Ok(None);
        };
        self.cache_insert(session.clone());
        Ok(Some(session))
    }

    /// Persist `session`, refreshing `last_updated` first.
    pub fn save(&self, session_id: &str, session: &mut Session) -> Result<()> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        self.persist(session_id, session)?;
        cache.insert(session_id.to_string(), session.clone());
        Ok(())
    }

    /// Read-modify-write of one record under the cache lock.
    ///
    /// `apply` sees the latest record; nothing is written when it fails.
    /// Returns the value produced by `apply` and the record as saved.
    pub fn update<T, E, F>(&self, session_id: &str, apply: F) -> Result<(T, Session), E>
    where
        F: FnOnce(&mut Session) -> Result<T, E>,
        E: From<anyhow::Error>,
    {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let mut session = match cache.get(session_id) {
            Some(session) => session.clone(),
            None => self
                .read_disk(session_id)?
                .ok_or_else(|| anyhow!("session '{session_id}' not found"))?,
        };
        let value = apply(&mut session)?;
        self.persist(session_id, &mut session)?;
        cache.insert(session_id.to_string(), session.clone());
        Ok((value, session))
    }

    pub fn delete(&self, session_id: &str) -> Result<()> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if let Some(path) = self.path_for(session_id) {
            if path.exists() {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            }
        }
        debug!(session_id, "session deleted");
        Ok(())
    }

    /// Prime the cache with every record on disk. Returns how many were read.
    pub fn load_all(&self) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let session = self.read_file(&path)?;
            self.cache_insert(session);
            loaded += 1;
        }
        debug!(loaded, dir = %dir.display(), "session cache primed");
        Ok(loaded)
    }

    /// Ids of all cached sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn cache_insert(&self, session: Session) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.session_id.clone(), session);
    }

    fn path_for(&self, session_id: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", file_stem(session_id))))
    }

    fn read_disk(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(path) = self.path_for(session_id) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let session = self.read_file(&path)?;
        if session.session_id != session_id {
            return Err(anyhow!(
                "{} holds session '{}' instead of '{}'",
                path.display(),
                session.session_id,
                session_id
            ));
        }
        Ok(Some(session))
    }

    fn persist(&self, session_id: &str, session: &mut Session) -> Result<()> {
        if session.session_id != session_id {
            return Err(anyhow!(
                "cannot save session '{}' under key '{}'",
                session.session_id,
                session_id
            ));
        }
        session.last_updated = Some(Utc::now());
        if let Some(path) = self.path_for(session_id) {
            debug!(session_id, path = %path.display(), "writing session");
            let mut buf = serde_json::to_string_pretty(session)?;
            buf.push('\n');
            write_atomic(&path, &buf)?;
        }
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Session> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse session {}", path.display()))?;
        if let Some(validator) = &self.validator {
            if !validator.is_valid(&value) {
                let messages = validator
                    .iter_errors(&value)
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>();
                return Err(anyhow!(
                    "session schema validation failed for {}: {}",
                    path.display(),
                    messages.join("; ")
                ));
            }
        }
        let session: Session = serde_json::from_value(value)
            .with_context(|| format!("deserialize session {}", path.display()))?;
        let errors = validate_session(&session);
        if !errors.is_empty() {
            return Err(anyhow!(
                "session invariants failed for {}: {}",
                path.display(),
                errors.join("; ")
            ));
        }
        Ok(session)
    }
}

/// Stable file name for a session id (ids are often URLs).
fn file_stem(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}
