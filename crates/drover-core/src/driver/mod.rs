//! The agent subprocess adapter interface.
//!
//! The orchestrator treats the LLM agent as an opaque task runner that
//! emits a lazy sequence of messages. Only the distinguished *result*
//! message matters for scheduling; everything else is forwarded for
//! logging. Drivers never rely on the process exit code -- the subprocess
//! may exit non-zero after emitting its result.

mod claude;

pub use claude::ClaudeCodeDriver;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

/// Everything needed to launch one agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInvocation {
    /// The user prompt, written to the agent's stdin.
    pub prompt: String,
    /// Appended to the agent's system prompt.
    pub system_prompt: String,
    /// Tool allow-list for this phase.
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub working_dir: PathBuf,
    /// Extra environment variables; the parent environment is inherited.
    pub env: HashMap<String, String>,
}

/// The terminal message of an agent run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentResult {
    /// `"success"` or a failure subtype string.
    pub subtype: String,
    /// Error descriptions, when the agent reported any.
    pub errors: Vec<String>,
    pub total_cost_usd: Option<f64>,
    /// Final result text, when present.
    pub text: Option<String>,
}

impl AgentResult {
    pub fn is_success(&self) -> bool {
        self.subtype == "success"
    }
}

/// A message from a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Assistant output text; informational only.
    Assistant { text: String },
    /// The terminal result. Drivers stop streaming after yielding this.
    Result(AgentResult),
}

/// Stream of agent messages. An `Err` item means the transport broke
/// (treated as a crash by the runner); end-of-stream without a
/// [`AgentMessage::Result`] means the process died before finishing.
pub type AgentMessageStream = Pin<Box<dyn Stream<Item = Result<AgentMessage>> + Send>>;

/// Adapter for a concrete agent CLI.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Name of the underlying agent runtime (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Launch the agent and return its message stream.
    async fn start(&self, invocation: &AgentInvocation) -> Result<AgentMessageStream>;
}

// Compile-time assertion: AgentDriver must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentDriver) {}
};
