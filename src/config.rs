//! Configuration for the engine, the orchestrator, and registered agents.
//!
//! ```toml
//! [engine]
//! max_retries = 2
//! invoke_timeout_secs = 120
//!
//! [orchestrator]
//! max_depth = 4
//! planner_agent = "planner"
//!
//! [[agents]]
//! id = "summarizer"
//! description = "Summarizes text"
//! kind = "command"
//! command = "llm-cli"
//! args = ["--model", "small"]
//!
//! [[agents]]
//! id = "web-search"
//! description = "Searches the web"
//! kind = "mcp_tool"
//! command = "web-search-mcp"
//! tool = "search"
//! argument = "query"
//! secret_ref = "web-search"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::workflow::Aggregation;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl AppConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_parallel == 0 {
            return Err(Error::Config("engine.max_parallel must be >= 1".into()));
        }
        if self.orchestrator.max_depth == 0 || self.orchestrator.max_parallel == 0 {
            return Err(Error::Config(
                "orchestrator.max_depth and orchestrator.max_parallel must be >= 1".into(),
            ));
        }
        if self.orchestrator.max_same_agent_calls == 0 {
            return Err(Error::Config("orchestrator.max_same_agent_calls must be >= 1".into()));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::Config(format!("duplicate agent id `{}`", agent.id)));
            }
        }
        for (field, id) in [
            ("planner_agent", &self.orchestrator.planner_agent),
            ("synthesizer_agent", &self.orchestrator.synthesizer_agent),
        ] {
            if let Some(id) = id {
                if !seen.contains(id.as_str()) {
                    return Err(Error::Config(format!(
                        "orchestrator.{} `{}` is not a configured agent",
                        field, id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Extra attempts for steps with `on_error = "retry"`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before retry `n` is `n * retry_backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Concurrent branches per parallel step.
    #[serde(default = "default_engine_max_parallel")]
    pub max_parallel: usize,
    /// Default per-invocation timeout.
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
}

impl EngineConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_parallel: default_engine_max_parallel(),
            invoke_timeout_secs: default_invoke_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_engine_max_parallel() -> usize {
    5
}
fn default_invoke_timeout_secs() -> u64 {
    120
}

/// LLM-driven orchestrator settings. Request-level overrides may lower these
/// bounds but never raise them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Rounds of delegation.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Concurrent sub-agent calls per round.
    #[serde(default = "default_orchestrator_max_parallel")]
    pub max_parallel: usize,
    /// Consecutive calls to one agent before delegation to it is halted.
    #[serde(default = "default_max_same_agent_calls")]
    pub max_same_agent_calls: u32,
    /// How sub-agent results become the final answer.
    #[serde(default)]
    pub aggregation: Aggregation,
    /// Agent acting as the decision layer.
    #[serde(default)]
    pub planner_agent: Option<String>,
    /// Agent that composes the final answer from sub-agent results.
    #[serde(default)]
    pub synthesizer_agent: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_parallel: default_orchestrator_max_parallel(),
            max_same_agent_calls: default_max_same_agent_calls(),
            aggregation: Aggregation::default(),
            planner_agent: None,
            synthesizer_agent: None,
        }
    }
}

fn default_max_depth() -> u32 {
    3
}
fn default_orchestrator_max_parallel() -> usize {
    3
}
fn default_max_same_agent_calls() -> u32 {
    3
}

/// One configured agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: AgentKindConfig,
    /// Secret reference resolved before each call.
    #[serde(default)]
    pub secret_ref: Option<String>,
    /// Per-agent timeout override.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Agent backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentKindConfig {
    /// A subprocess reading input on stdin and answering on stdout.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A single tool on an MCP server spoken to over stdio.
    McpTool {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        tool: String,
        #[serde(default = "default_tool_argument")]
        argument: String,
    },
}

fn default_tool_argument() -> String {
    "input".to_string()
}

/// Environment-backed secret store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
        }
    }
}

fn default_env_prefix() -> String {
    "AGENT_SECRET_".to_string()
}
