//! Actuator adapter that delegates every action to an external command.
//!
//! The command is invoked as `<command...> <action> <session_id>` with a JSON
//! request on stdin and must print one JSON reply on stdout:
//! `{"ok": true, "relation": "related", "surface_id": "..."}` (fields beyond
//! `ok` depend on the action; `error` explains a failure).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::core::types::{Relation, WorkItem};
use crate::io::actuator::{Actuator, Surface};

/// Bytes of stderr kept in error messages.
const STDERR_LIMIT_BYTES: usize = 2_000;

/// Reply printed by the actuator command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Reply {
    ok: bool,
    error: Option<String>,
    relation: Option<Relation>,
    surface_id: Option<String>,
    bound: Option<bool>,
}

#[derive(Debug)]
struct CommandRunner {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    #[instrument(skip(self, request), fields(timeout_secs = self.timeout.as_secs()))]
    async fn invoke(&self, action: &str, session_id: &str, request: Value) -> Result<Reply> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("actuator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(action)
            .arg(session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %program, "spawning actuator command");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn actuator command {program}"))?;

        let mut payload = serde_json::to_vec(&request).context("serialize actuator request")?;
        payload.push(b'\n');
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        stdin.write_all(&payload).await.context("write stdin")?;
        drop(stdin);

        // Dropping the in-flight future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("actuator '{action}' timed out after {:?}", self.timeout))?
            .context("wait for actuator command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.chars().take(STDERR_LIMIT_BYTES).collect();
            warn!(exit_code = ?output.status.code(), "actuator command failed");
            return Err(anyhow!(
                "actuator '{action}' exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| anyhow!("actuator '{action}' printed no reply"))?;
        let reply: Reply = serde_json::from_str(line)
            .with_context(|| format!("parse actuator '{action}' reply"))?;
        if !reply.ok {
            return Err(anyhow!(
                "{}",
                reply
                    .error
                    .unwrap_or_else(|| format!("actuator '{action}' reported failure"))
            ));
        }
        Ok(reply)
    }
}

/// Actuator that shells out to a configured command.
pub struct CommandActuator {
    runner: Arc<CommandRunner>,
}

impl CommandActuator {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            runner: Arc::new(CommandRunner { command, timeout }),
        }
    }
}

#[async_trait]
impl Actuator for CommandActuator {
    async fn classify(&self, session_id: &str, item: &WorkItem) -> Result<Relation> {
        let reply = self
            .runner
            .invoke("classify", session_id, json!({ "item": item }))
            .await?;
        match reply.relation {
            Some(Relation::Unknown) | None => Err(anyhow!("classify reply carried no relation")),
            Some(relation) => Ok(relation),
        }
    }

    async fn has_surface(&self, session_id: &str) -> Result<bool> {
        let reply = self.runner.invoke("has-surface", session_id, json!({})).await?;
        Ok(reply.bound.unwrap_or(true))
    }

    async fn primary_engage(&self, session_id: &str, item: &WorkItem) -> Result<()> {
        self.runner
            .invoke("primary", session_id, json!({ "item": item }))
            .await?;
        Ok(())
    }

    async fn submit_response(&self, session_id: &str, item: &WorkItem, text: &str) -> Result<()> {
        self.runner
            .invoke("respond", session_id, json!({ "item": item, "text": text }))
            .await?;
        Ok(())
    }

    async fn open_surface(&self, handle: &str) -> Result<Box<dyn Surface>> {
        let reply = self
            .runner
            .invoke("open-surface", "-", json!({ "handle": handle }))
            .await?;
        let surface_id = reply
            .surface_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow!("open-surface reply carried no surface_id"))?;
        Ok(Box::new(CommandSurface {
            runner: Arc::clone(&self.runner),
            surface_id,
            handle: handle.to_string(),
        }))
    }
}

struct CommandSurface {
    runner: Arc<CommandRunner>,
    surface_id: String,
    handle: String,
}

impl CommandSurface {
    async fn invoke(&self, action: &str, extra: Value) -> Result<Reply> {
        let mut request = json!({ "surface_id": self.surface_id, "handle": self.handle });
        if let (Some(target), Value::Object(fields)) = (request.as_object_mut(), extra) {
            target.extend(fields);
        }
        self.runner.invoke(action, "-", request).await
    }
}

#[async_trait]
impl Surface for CommandSurface {
    async fn wait_ready(&mut self) -> Result<()> {
        self.invoke("surface-ready", json!({})).await?;
        Ok(())
    }

    async fn send_message(&mut self, text: &str) -> Result<()> {
        self.invoke("surface-send", json!({ "text": text })).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.invoke("close-surface", json!({})).await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::item;

    const SCRIPT: &str = r#"
cat > /dev/null
case "$1" in
  classify) echo '{"ok":true,"relation":"related"}' ;;
  has-surface) echo '{"ok":true,"bound":false}' ;;
  open-surface) echo '{"ok":true,"surface_id":"tab-7"}' ;;
  respond) echo '{"ok":false,"error":"comment box missing"}' ;;
  slow) sleep 5 ;;
  crash) echo "boom" >&2; exit 3 ;;
  *) echo '{"ok":true}' ;;
esac
"#;

    fn actuator(timeout: Duration) -> CommandActuator {
        CommandActuator::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                SCRIPT.to_string(),
                "actuator".to_string(),
            ],
            timeout,
        )
    }

    #[tokio::test]
    async fn replies_map_to_actuator_results() {
        let actuator = actuator(Duration::from_secs(5));
        let it = item("a");

        assert_eq!(
            actuator.classify("s", &it).await.expect("classify"),
            Relation::Related
        );
        assert!(!actuator.has_surface("s").await.expect("has-surface"));
        actuator.primary_engage("s", &it).await.expect("primary");

        let err = actuator.submit_response("s", &it, "hi").await.unwrap_err();
        assert!(err.to_string().contains("comment box missing"));
    }

    #[tokio::test]
    async fn surface_actions_round_trip_through_command() {
        let actuator = actuator(Duration::from_secs(5));
        let mut surface = actuator.open_surface("jane").await.expect("open");
        surface.wait_ready().await.expect("ready");
        surface.send_message("hello").await.expect("send");
        surface.close().await.expect("close");
    }

    #[tokio::test]
    async fn failures_and_timeouts_are_errors() {
        let actuator = actuator(Duration::from_millis(200));
        let err = actuator
            .runner
            .invoke("crash", "s", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("status Some(3)"));
        assert!(err.to_string().contains("boom"));

        let err = actuator
            .runner
            .invoke("slow", "s", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
