//! External agent invocation. The LLM agent is an opaque collaborator: the
//! gateway hands it one inbound message at a time and publishes whatever it
//! prints back as the reply.

use crate::bus::InboundMessage;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const AGENT_BINARY: &str = "picoclaw-agent";
const AGENT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AgentHandler {
    binary: PathBuf,
    model: String,
}

impl AgentHandler {
    pub fn new(model: String) -> Self {
        Self {
            binary: locate_agent_binary(),
            model,
        }
    }

    #[cfg(test)]
    fn with_binary(binary: PathBuf, model: String) -> Self {
        Self { binary, model }
    }

    /// Run one agent turn for an inbound message. The agent's stdout is the
    /// reply; a non-zero exit or timeout is an error and no reply is sent.
    pub async fn reply(&self, msg: &InboundMessage) -> Result<String> {
        self.run(&[
            ("--channel", msg.channel.as_str()),
            ("--sender", msg.sender.canonical_id.as_str()),
            ("--message", msg.content.as_str()),
        ])
        .await
    }

    /// Run a one-shot agent turn from the CLI.
    pub async fn run_once(&self, message: &str) -> Result<String> {
        self.run(&[("--channel", "cli"), ("--message", message)]).await
    }

    async fn run(&self, args: &[(&str, &str)]) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        for (flag, value) in args {
            cmd.arg(flag).arg(value);
        }
        if !self.model.is_empty() {
            cmd.arg("--model").arg(&self.model);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(AGENT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("agent timed out after {AGENT_TIMEOUT:?}"))?
            .with_context(|| format!("failed to run agent binary {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "agent exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Locate the agent binary: prefer a sibling of the current executable, fall
/// back to `$PATH`.
fn locate_agent_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let mut candidate = dir.join(AGENT_BINARY);
            if cfg!(windows) {
                candidate.set_extension("exe");
            }
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(AGENT_BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Peer, SenderInfo};
    use std::collections::HashMap;

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            message_id: "m1".into(),
            sender: SenderInfo::new("telegram", "42"),
            peer: Peer::direct("42"),
            content: content.into(),
            media_paths: vec![],
            metadata: HashMap::new(),
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let handler = AgentHandler::with_binary(
            PathBuf::from("/nonexistent/picoclaw-agent"),
            String::new(),
        );
        assert!(handler.reply(&inbound("hi")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_becomes_the_reply() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("picoclaw-agent");
        std::fs::write(&script, "#!/bin/sh\necho \"pong\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let handler = AgentHandler::with_binary(script, "claude".into());
        let reply = handler.reply(&inbound("ping")).await.unwrap();
        assert_eq!(reply, "pong");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("picoclaw-agent");
        std::fs::write(&script, "#!/bin/sh\necho \"boom\" >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let handler = AgentHandler::with_binary(script, String::new());
        let err = handler.run_once("hi").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
