//! Engager CLI.
//!
//! Manages sessions under `<root>/.engager/` and drives the run-loop in the
//! foreground. `run` and `resume` pause the run on Ctrl-C; the next `resume`
//! continues where it stopped.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use engager::controller::{RunController, SessionSource};
use engager::core::selector::{QueueSummary, summarize};
use engager::core::types::{RunState, Session, WorkItem, session_id_for_url};
use engager::exit_codes;
use engager::io::init::{EngagerPaths, InitOptions, init_engager};
use engager::io::session_store::SessionStore;
use engager::logging;
use engager::looping::LoopStop;
use engager::select::{SelectOutcome, select_from_root};
use engager::start::open_controller;

#[derive(Parser)]
#[command(
    name = "engager",
    version,
    about = "Resumable engagement orchestration engine"
)]
struct Cli {
    /// Project directory (contains .engager/).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Log progress to stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.engager/config.toml` and the sessions directory.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Enqueue work items discovered on `url` (session id derived from it).
    Add {
        url: String,
        /// JSON file holding an array of work items.
        #[arg(long)]
        items: PathBuf,
        #[arg(long)]
        title: Option<String>,
        /// Text of the source, offered to prompt templates.
        #[arg(long)]
        context: Option<String>,
    },
    /// Print queue summaries as JSON (every session when none is given).
    Status { session: Option<String> },
    /// Print the next item and step; exits 2 when nothing is left.
    Select { session: String },
    /// Run a session in the foreground until it completes or Ctrl-C.
    Run { session: String },
    /// Continue the most recent interrupted run.
    Resume,
    /// Delete a session record.
    Clear { session: String },
    /// Print the full session record as JSON.
    Export { session: String },
}

#[derive(Serialize)]
struct SessionStatus<'a> {
    session_id: &'a str,
    run_state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    summary: QueueSummary,
}

impl<'a> SessionStatus<'a> {
    fn of(session: &'a Session) -> Self {
        Self {
            session_id: &session.session_id,
            run_state: session.run_state,
            title: session.title.as_deref(),
            summary: summarize(session),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Add {
            url,
            items,
            title,
            context,
        } => cmd_add(root, &url, &items, title, context),
        Command::Status { session } => {
            let session = session.as_deref().map(session_id_for_url);
            cmd_status(root, session.as_deref())
        }
        Command::Select { session } => cmd_select(root, &session_id_for_url(&session)),
        Command::Run { session } => cmd_run(root, &session_id_for_url(&session)).await,
        Command::Resume => cmd_resume(root).await,
        Command::Clear { session } => cmd_clear(root, &session_id_for_url(&session)),
        Command::Export { session } => cmd_export(root, &session_id_for_url(&session)),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_engager(root, &InitOptions { force })?;
    println!("{}", paths.engager_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_add(
    root: &Path,
    url: &str,
    items_path: &Path,
    title: Option<String>,
    context: Option<String>,
) -> Result<i32> {
    let items = read_items(items_path)?;
    let session_id = session_id_for_url(url);
    if session_id.is_empty() {
        bail!("cannot derive a session id from '{url}'");
    }
    let controller = open_controller(root)?;
    let source = SessionSource {
        source_url: Some(url.trim().to_string()),
        title,
        context,
    };
    let added = controller.add_items(&session_id, items, source)?;
    println!("{session_id}\t{added}");
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, session_id: Option<&str>) -> Result<i32> {
    let store = open_store(root)?;
    let payload = match session_id {
        Some(session_id) => {
            let session = require_session(&store, session_id)?;
            serde_json::to_string_pretty(&SessionStatus::of(&session))
        }
        None => {
            let sessions = store
                .session_ids()
                .iter()
                .filter_map(|id| store.get(id))
                .collect::<Vec<_>>();
            let statuses: Vec<SessionStatus<'_>> = sessions.iter().map(SessionStatus::of).collect();
            serde_json::to_string_pretty(&statuses)
        }
    }
    .context("serialize status")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

fn cmd_select(root: &Path, session_id: &str) -> Result<i32> {
    match select_from_root(root, session_id)? {
        SelectOutcome::Complete => Ok(exit_codes::COMPLETE),
        SelectOutcome::Open(selected) => {
            println!(
                "{}\t{}\t{}",
                selected.item_id,
                selected.step.as_str(),
                selected.attempts
            );
            Ok(exit_codes::OK)
        }
    }
}

async fn cmd_run(root: &Path, session_id: &str) -> Result<i32> {
    let controller = open_controller(root)?;
    controller.start(session_id)?;
    drive(&controller).await
}

async fn cmd_resume(root: &Path) -> Result<i32> {
    let controller = open_controller(root)?;
    let Some(session_id) = controller.restore()? else {
        bail!("no interrupted run to resume");
    };
    info!(session_id, "resuming");
    controller.resume()?;
    drive(&controller).await
}

fn cmd_clear(root: &Path, session_id: &str) -> Result<i32> {
    let controller = open_controller(root)?;
    controller.clear_session(session_id)?;
    Ok(exit_codes::OK)
}

fn cmd_export(root: &Path, session_id: &str) -> Result<i32> {
    let store = open_store(root)?;
    let session = require_session(&store, session_id)?;
    let payload = serde_json::to_string_pretty(&session).context("serialize session")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

/// Wait for the run-loop; Ctrl-C pauses the run and waits for the in-flight
/// step to settle.
async fn drive(controller: &RunController) -> Result<i32> {
    let stop = tokio::select! {
        stop = controller.join() => stop,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            warn!("interrupt received, pausing after the current step");
            if let Err(err) = controller.stop() {
                warn!("stop after interrupt: {err}");
            }
            controller.join().await
        }
    };
    match stop {
        Some(LoopStop::Complete { session_id }) => {
            let session = require_session(controller.store(), &session_id)?;
            let payload = serde_json::to_string_pretty(&SessionStatus::of(&session))
                .context("serialize status")?;
            println!("{payload}");
            Ok(exit_codes::OK)
        }
        Some(LoopStop::Halted { run_state }) => {
            eprintln!("run {}", run_state.as_str());
            Ok(exit_codes::OK)
        }
        Some(LoopStop::Failed { session_id, error }) => {
            eprintln!(
                "run failed for {}: {error}",
                session_id.as_deref().unwrap_or("<no session>")
            );
            Ok(exit_codes::INVALID)
        }
        None => Err(anyhow!("run-loop was never started")),
    }
}

fn open_store(root: &Path) -> Result<SessionStore> {
    let paths = EngagerPaths::new(root);
    let store = SessionStore::open(&paths.sessions_dir)?;
    store.load_all()?;
    Ok(store)
}

fn require_session(store: &SessionStore, session_id: &str) -> Result<Session> {
    store
        .load(session_id)?
        .ok_or_else(|| anyhow!("no session record for '{session_id}'"))
}

fn read_items(path: &Path) -> Result<Vec<WorkItem>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let items: Vec<WorkItem> =
        serde_json::from_str(&raw).with_context(|| format!("parse items {}", path.display()))?;
    if let Some(item) = items.iter().find(|item| item.item_id.trim().is_empty()) {
        bail!("item with empty item_id (content: {:?})", item.content);
    }
    Ok(items)
}
