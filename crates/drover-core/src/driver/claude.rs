//! Claude Code driver.
//!
//! Spawns `claude -p --output-format stream-json` and parses its JSONL
//! stdout into [`AgentMessage`] values. The stream terminates as soon as
//! the result message is seen, even if the process keeps writing or exits
//! with a non-zero code afterwards.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::warn;

use super::{AgentDriver, AgentInvocation, AgentMessage, AgentMessageStream, AgentResult};

/// Driver for the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeDriver {
    /// Path to the `claude` binary. Defaults to `"claude"` (via `$PATH`).
    binary_path: String,
}

impl ClaudeCodeDriver {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
        }
    }

    /// Use a specific binary path. Tests point this at fake shell scripts.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for ClaudeCodeDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one JSONL line into a message, or `None` for event types the
/// orchestrator does not consume. `Err` means the line was not valid JSON;
/// callers log and continue.
fn parse_stream_line(line: &str) -> Result<Option<AgentMessage>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in agent stream")?;

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "result" => {
            let subtype = v
                .get("subtype")
                .and_then(|s| s.as_str())
                .unwrap_or("unknown")
                .to_string();
            let errors = v
                .get("errors")
                .and_then(|e| e.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|item| item.as_str())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default();
            let total_cost_usd = v.get("total_cost_usd").and_then(|c| c.as_f64());
            let text = v
                .get("result")
                .and_then(|r| r.as_str())
                .map(|s| s.to_string());

            Ok(Some(AgentMessage::Result(AgentResult {
                subtype,
                errors,
                total_cost_usd,
                text,
            })))
        }

        "assistant" => {
            let text: String = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();

            if text.is_empty() {
                Ok(None)
            } else {
                Ok(Some(AgentMessage::Assistant { text }))
            }
        }

        _ => Ok(None),
    }
}

#[async_trait]
impl AgentDriver for ClaudeCodeDriver {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn start(&self, invocation: &AgentInvocation) -> Result<AgentMessageStream> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(invocation.max_turns.to_string())
            .arg("--max-budget-usd")
            .arg(invocation.max_budget_usd.to_string())
            .arg("--allowedTools")
            .arg(invocation.allowed_tools.join(","))
            .arg("--append-system-prompt")
            .arg(&invocation.system_prompt);

        cmd.current_dir(&invocation.working_dir);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        // The prompt goes in on stdin, which is then closed so the agent
        // starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(invocation.prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
        }

        let stdout = child
            .stdout
            .take()
            .context("agent process has no stdout pipe")?;

        let stream = async_stream::stream! {
            // Keep the child handle alive for the duration of the stream;
            // dropping it early would kill the process on some platforms.
            let _child = child;
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_stream_line(trimmed) {
                            Ok(Some(message)) => {
                                let is_result = matches!(message, AgentMessage::Result(_));
                                yield Ok(message);
                                if is_result {
                                    // Terminal message: stop reading. The
                                    // exit code is deliberately ignored.
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed agent output line");
                            }
                        }
                    }
                    Ok(None) => {
                        // EOF before a result message; the runner treats
                        // this as a crashed run.
                        return;
                    }
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("error reading agent stdout"));
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::path::Path;

    fn invocation(working_dir: &Path) -> AgentInvocation {
        AgentInvocation {
            prompt: "do the task".to_string(),
            system_prompt: "you are working on HQ-42".to_string(),
            allowed_tools: vec!["Read".to_string(), "Grep".to_string()],
            max_turns: 10,
            max_budget_usd: 1.0,
            working_dir: working_dir.to_path_buf(),
            env: HashMap::new(),
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().to_string()
    }

    async fn collect(driver: &ClaudeCodeDriver, inv: &AgentInvocation) -> Vec<AgentMessage> {
        let stream = driver.start(inv).await.unwrap();
        stream
            .map(|item| item.expect("stream item should be Ok"))
            .collect()
            .await
    }

    // -- parsing ------------------------------------------------------------

    #[test]
    fn parse_success_result() {
        let line = r#"{"type":"result","subtype":"success","result":"Done.","total_cost_usd":0.42}"#;
        let message = parse_stream_line(line).unwrap().unwrap();
        let AgentMessage::Result(result) = message else {
            panic!("expected result message");
        };
        assert!(result.is_success());
        assert_eq!(result.total_cost_usd, Some(0.42));
        assert_eq!(result.text.as_deref(), Some("Done."));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn parse_failure_result_with_errors() {
        let line = r#"{"type":"result","subtype":"error_max_turns","errors":["turn limit hit"]}"#;
        let message = parse_stream_line(line).unwrap().unwrap();
        let AgentMessage::Result(result) = message else {
            panic!("expected result message");
        };
        assert_eq!(result.subtype, "error_max_turns");
        assert_eq!(result.errors, vec!["turn limit hit".to_string()]);
        assert!(result.total_cost_usd.is_none());
    }

    #[test]
    fn parse_assistant_text_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"}]}}"#;
        assert_eq!(
            parse_stream_line(line).unwrap().unwrap(),
            AgentMessage::Assistant {
                text: "thinking".to_string()
            }
        );
    }

    #[test]
    fn parse_ignores_uninteresting_types() {
        assert!(parse_stream_line(r#"{"type":"system","data":"warmup"}"#)
            .unwrap()
            .is_none());
        assert!(parse_stream_line(r#"{"type":"tool_use","name":"Bash"}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(parse_stream_line("definitely not json").is_err());
    }

    // -- subprocess ---------------------------------------------------------

    #[tokio::test]
    async fn streams_messages_until_result() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_agent.sh",
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working\"}]}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"All done\",\"total_cost_usd\":0.3}'\n",
        );

        let driver = ClaudeCodeDriver::with_binary(&script);
        let messages = collect(&driver, &invocation(tmp.path())).await;

        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0],
            AgentMessage::Assistant {
                text: "working".to_string()
            }
        );
        assert!(matches!(
            &messages[1],
            AgentMessage::Result(r) if r.is_success() && r.total_cost_usd == Some(0.3)
        ));
    }

    #[tokio::test]
    async fn stops_at_result_even_if_process_keeps_writing_and_exits_nonzero() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "noisy_agent.sh",
            "echo '{\"type\":\"result\",\"subtype\":\"success\"}'\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"late\"}]}}'\n\
             exit 3\n",
        );

        let driver = ClaudeCodeDriver::with_binary(&script);
        let messages = collect(&driver, &invocation(tmp.path())).await;

        // Only the result; nothing after it is read.
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], AgentMessage::Result(_)));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "garbled_agent.sh",
            "echo 'not json at all'\n\
             echo ''\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\"}'\n",
        );

        let driver = ClaudeCodeDriver::with_binary(&script);
        let messages = collect(&driver, &invocation(tmp.path())).await;
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn eof_without_result_ends_stream_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "dead_agent.sh", "exit 1\n");

        let driver = ClaudeCodeDriver::with_binary(&script);
        let messages = collect(&driver, &invocation(tmp.path())).await;
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_error() {
        let driver = ClaudeCodeDriver::with_binary("/nonexistent/agent");
        let err = match driver.start(&invocation(Path::new("/tmp"))).await {
            Ok(_) => panic!("expected start to fail"),
            Err(e) => e,
        };
        assert!(format!("{err:#}").contains("failed to spawn agent binary"));
    }

    #[tokio::test]
    async fn prompt_is_delivered_on_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        // Echo the prompt back inside the result text.
        let script = write_script(
            tmp.path(),
            "echo_agent.sh",
            "PROMPT=$(cat)\n\
             echo \"{\\\"type\\\":\\\"result\\\",\\\"subtype\\\":\\\"success\\\",\\\"result\\\":\\\"$PROMPT\\\"}\"\n",
        );

        let driver = ClaudeCodeDriver::with_binary(&script);
        let messages = collect(&driver, &invocation(tmp.path())).await;

        let AgentMessage::Result(result) = &messages[0] else {
            panic!("expected result");
        };
        assert_eq!(result.text.as_deref(), Some("do the task"));
    }

    #[tokio::test]
    async fn env_vars_reach_the_subprocess() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "env_agent.sh",
            "cat > /dev/null\n\
             echo \"{\\\"type\\\":\\\"result\\\",\\\"subtype\\\":\\\"success\\\",\\\"result\\\":\\\"$DROVER_TEST_VAR\\\"}\"\n",
        );

        let driver = ClaudeCodeDriver::with_binary(&script);
        let mut inv = invocation(tmp.path());
        inv.env
            .insert("DROVER_TEST_VAR".to_string(), "present".to_string());
        let messages = collect(&driver, &inv).await;

        let AgentMessage::Result(result) = &messages[0] else {
            panic!("expected result");
        };
        assert_eq!(result.text.as_deref(), Some("present"));
    }
}
