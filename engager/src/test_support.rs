//! Test-only builders and scripted adapters.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::controller::RunController;
use crate::core::types::{Relation, Session, StepStatus, WorkItem};
use crate::io::actuator::{Actuator, Surface, SurfaceTimeouts};
use crate::io::broadcast::{Broadcaster, Snapshot, Subscriber};
use crate::io::config::EngineConfig;
use crate::io::generator::{Generation, GenerationError, GenerationRequest, Generator};
use crate::io::prompt::PromptRenderer;
use crate::io::session_store::SessionStore;
use crate::step::{StepConfig, StepExecutor};

/// Create a fresh item with every step pending and a derivable handle.
pub fn item(id: &str) -> WorkItem {
    WorkItem {
        author: Some(format!("{id} author")),
        profile_url: Some(format!("https://example.com/in/{id}-handle")),
        ..WorkItem::new(id, format!("{id} content"))
    }
}

/// Create an item with every applicable step `done`.
pub fn done_item(id: &str, relation: Relation) -> WorkItem {
    let mut it = item(id);
    it.origin_relation = relation;
    it.primary_status = StepStatus::Done;
    it.response_status = StepStatus::Done;
    if relation == Relation::Related {
        it.secondary_status = StepStatus::Done;
    }
    it
}

/// Session `session-1` holding `items`.
pub fn session_with(items: Vec<WorkItem>) -> Session {
    Session {
        items,
        ..Session::new("session-1")
    }
}

pub fn temp_root() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// Step limits small enough for tests.
pub fn step_config() -> StepConfig {
    let mut cfg = StepConfig::from_config(&EngineConfig::default()).expect("step config");
    cfg.classify_timeout = Duration::from_millis(500);
    cfg.surface = SurfaceTimeouts {
        ready: Duration::from_millis(100),
        action: Duration::from_millis(500),
    };
    cfg
}

/// How transient surfaces opened by [`ScriptedActuator`] behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SurfaceBehavior {
    #[default]
    Ok,
    FailSend,
    NeverReady,
    NeverCloses,
}

#[derive(Debug, Default)]
struct ActuatorLog {
    calls: Vec<String>,
    open_surfaces: usize,
    /// Remaining scripted failures keyed by `(action, item_id or handle)`.
    failures: HashMap<(String, String), u32>,
    /// Remaining scripted panics, keyed like `failures`.
    panics: HashMap<(String, String), u32>,
}

impl ActuatorLog {
    fn take_failure(&mut self, action: &str, key: &str) -> bool {
        take(&mut self.failures, action, key)
    }

    fn take_panic(&mut self, action: &str, key: &str) -> bool {
        take(&mut self.panics, action, key)
    }
}

fn take(script: &mut HashMap<(String, String), u32>, action: &str, key: &str) -> bool {
    match script.get_mut(&(action.to_string(), key.to_string())) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn lock(log: &Mutex<ActuatorLog>) -> MutexGuard<'_, ActuatorLog> {
    log.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Actuator that records every call and follows a script.
///
/// Failures are scripted per action name: `classify`, `primary`, `respond`,
/// `send` (the last keyed by handle, the others by item id).
#[derive(Debug, Clone, Default)]
pub struct ScriptedActuator {
    log: Arc<Mutex<ActuatorLog>>,
    relations: HashMap<String, Relation>,
    unbound: bool,
    surface: SurfaceBehavior,
    primary_gate: Option<Arc<Semaphore>>,
}

impl ScriptedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relation reported for `item_id` (default: unrelated).
    pub fn with_relation(mut self, item_id: &str, relation: Relation) -> Self {
        self.relations.insert(item_id.to_string(), relation);
        self
    }

    pub fn fail(self, action: &str, key: &str, times: u32) -> Self {
        lock(&self.log)
            .failures
            .insert((action.to_string(), key.to_string()), times);
        self
    }

    /// Panic instead of answering the next `times` calls.
    pub fn panic_on(self, action: &str, key: &str, times: u32) -> Self {
        lock(&self.log)
            .panics
            .insert((action.to_string(), key.to_string()), times);
        self
    }

    pub fn without_surface(mut self) -> Self {
        self.unbound = true;
        self
    }

    pub fn with_surface(mut self, behavior: SurfaceBehavior) -> Self {
        self.surface = behavior;
        self
    }

    /// Each primary engagement waits for one permit of `gate`.
    pub fn with_primary_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.primary_gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.log).calls.clone()
    }

    pub fn open_surfaces(&self) -> usize {
        lock(&self.log).open_surfaces
    }

    fn record(&self, call: String, action: &str, key: &str) -> Result<()> {
        let mut log = lock(&self.log);
        log.calls.push(call);
        if log.take_panic(action, key) {
            drop(log);
            panic!("scripted {action} panic for {key}");
        }
        if log.take_failure(action, key) {
            return Err(anyhow!("scripted {action} failure for {key}"));
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn classify(&self, _session_id: &str, item: &WorkItem) -> Result<Relation> {
        self.record(format!("classify:{}", item.item_id), "classify", &item.item_id)?;
        Ok(self
            .relations
            .get(&item.item_id)
            .copied()
            .unwrap_or(Relation::Unrelated))
    }

    async fn has_surface(&self, session_id: &str) -> Result<bool> {
        lock(&self.log).calls.push(format!("has_surface:{session_id}"));
        Ok(!self.unbound)
    }

    async fn primary_engage(&self, _session_id: &str, item: &WorkItem) -> Result<()> {
        self.record(format!("primary:{}", item.item_id), "primary", &item.item_id)?;
        if let Some(gate) = &self.primary_gate {
            gate.acquire().await?.forget();
        }
        Ok(())
    }

    async fn submit_response(&self, _session_id: &str, item: &WorkItem, text: &str) -> Result<()> {
        self.record(
            format!("respond:{}:{text}", item.item_id),
            "respond",
            &item.item_id,
        )
    }

    async fn open_surface(&self, handle: &str) -> Result<Box<dyn Surface>> {
        let mut log = lock(&self.log);
        log.calls.push(format!("open:{handle}"));
        log.open_surfaces += 1;
        Ok(Box::new(ScriptedSurface {
            log: Arc::clone(&self.log),
            handle: handle.to_string(),
            behavior: self.surface,
        }))
    }
}

struct ScriptedSurface {
    log: Arc<Mutex<ActuatorLog>>,
    handle: String,
    behavior: SurfaceBehavior,
}

#[async_trait]
impl Surface for ScriptedSurface {
    async fn wait_ready(&mut self) -> Result<()> {
        lock(&self.log).calls.push(format!("ready:{}", self.handle));
        if self.behavior == SurfaceBehavior::NeverReady {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn send_message(&mut self, text: &str) -> Result<()> {
        let mut log = lock(&self.log);
        log.calls.push(format!("send:{}:{text}", self.handle));
        if self.behavior == SurfaceBehavior::FailSend || log.take_failure("send", &self.handle) {
            return Err(anyhow!("message box not found"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        lock(&self.log).calls.push(format!("close:{}", self.handle));
        if self.behavior == SurfaceBehavior::NeverCloses {
            std::future::pending::<()>().await;
        }
        let mut log = lock(&self.log);
        log.open_surfaces = log.open_surfaces.saturating_sub(1);
        Ok(())
    }
}

/// Generator that replays scripted results, then answers with a fixed reply.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Generation, GenerationError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub const DEFAULT_REPLY: &'static str = "Thanks for sharing!";

    pub fn new(script: Vec<Result<Generation, GenerationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Ok(Generation::Text(Self::DEFAULT_REPLY.to_string())))
    }
}

/// Subscriber that keeps every snapshot it receives.
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    snapshots: Mutex<Vec<Snapshot>>,
}

impl RecordingSubscriber {
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().expect("snapshots lock").clone()
    }
}

impl Subscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        "recording"
    }

    fn deliver(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots
            .lock()
            .expect("snapshots lock")
            .push(snapshot.clone());
        Ok(())
    }
}

/// Store, scripted adapters, and a recording broadcaster wired together.
pub struct Harness {
    pub store: Arc<SessionStore>,
    pub actuator: Arc<ScriptedActuator>,
    pub generator: Arc<ScriptedGenerator>,
    pub broadcaster: Arc<Broadcaster>,
    pub recorder: Arc<RecordingSubscriber>,
    pub step_config: StepConfig,
}

impl Harness {
    /// Harness over an in-memory store.
    pub fn new() -> Self {
        Self::with_store(SessionStore::in_memory())
    }

    /// Harness over a store persisted under `dir`, primed from disk.
    pub fn at(dir: &Path) -> Self {
        let store = SessionStore::open(dir).expect("open store");
        store.load_all().expect("load sessions");
        Self::with_store(store)
    }

    fn with_store(store: SessionStore) -> Self {
        let broadcaster = Arc::new(Broadcaster::default());
        let recorder = Arc::new(RecordingSubscriber::default());
        broadcaster.add_subscriber(recorder.clone());
        Self {
            store: Arc::new(store),
            actuator: Arc::new(ScriptedActuator::new()),
            generator: Arc::new(ScriptedGenerator::default()),
            broadcaster,
            recorder,
            step_config: step_config(),
        }
    }

    pub fn with_actuator(mut self, actuator: ScriptedActuator) -> Self {
        self.actuator = Arc::new(actuator);
        self
    }

    pub fn with_generator(mut self, generator: ScriptedGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.step_config.max_attempts = max_attempts;
        self
    }

    /// Persist `session` as-is and return the stored copy.
    pub fn seed(&self, mut session: Session) -> Session {
        let id = session.session_id.clone();
        self.store.save(&id, &mut session).expect("seed session");
        session
    }

    /// Current cached record for `session_id`.
    pub fn session(&self, session_id: &str) -> Session {
        self.store
            .get(session_id)
            .unwrap_or_else(|| panic!("session '{session_id}' not in store"))
    }

    pub fn executor(&self) -> StepExecutor {
        let actuator: Arc<dyn Actuator> = self.actuator.clone();
        let generator: Arc<dyn Generator> = self.generator.clone();
        StepExecutor::new(
            Arc::clone(&self.store),
            actuator,
            generator,
            Arc::clone(&self.broadcaster),
            PromptRenderer::from_config(&Default::default()).expect("prompts"),
            self.step_config.clone(),
        )
    }

    /// Controller with no pause between steps.
    pub fn controller(&self) -> RunController {
        RunController::new(self.executor(), Duration::ZERO)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory log sink for asserting on emitted events.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route this thread's events into the capture until the guard drops.
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Captured lines containing `needle`.
    pub fn lines_with(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

pub struct LogCaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}

impl io::Write for LogCaptureWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| io::Error::other("log capture mutex poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
