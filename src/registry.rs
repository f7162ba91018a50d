//! Agent registry with per-agent health and usage tracking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::{CommandAgent, McpToolAgent};
use crate::config::{AgentConfig, AgentKindConfig};
use crate::error::{Error, Result};
use crate::secrets::Credentials;
use crate::types::AvailableAgent;

/// An invocable agent: an LLM-backed actor, a tool, or anything else that
/// turns an input string into an output string.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry id.
    fn id(&self) -> &str;

    /// Natural-language description, shown to the orchestrator's planner.
    fn description(&self) -> &str;

    /// Run once. `Err` means the agent executed and failed.
    async fn run(&self, input: &str, credentials: &Credentials) -> Result<String>;
}

/// A registered agent plus its invocation settings.
#[derive(Clone)]
pub struct RegisteredAgent {
    pub agent: Arc<dyn Agent>,
    /// Secret reference resolved before every call.
    pub secret_ref: Option<String>,
    /// Overrides the invoker's default timeout.
    pub timeout: Option<Duration>,
}

/// Immutable set of agents known to an invoker.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration.
    pub fn from_config(configs: &[AgentConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let agent: Arc<dyn Agent> = match &config.kind {
                AgentKindConfig::Command { command, args } => Arc::new(CommandAgent::new(
                    &config.id,
                    &config.description,
                    command,
                    args.clone(),
                )),
                AgentKindConfig::McpTool {
                    command,
                    args,
                    tool,
                    argument,
                } => Arc::new(
                    McpToolAgent::new(&config.id, &config.description, command, tool)
                        .with_args(args.clone())
                        .with_argument(argument),
                ),
            };
            registry.register_with(
                agent,
                config.secret_ref.clone(),
                config.timeout_secs.map(Duration::from_secs),
            )?;
        }
        Ok(registry)
    }

    /// Register an agent with default settings.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        self.register_with(agent, None, None)
    }

    /// Register an agent with a secret reference and/or timeout override.
    pub fn register_with(
        &mut self,
        agent: Arc<dyn Agent>,
        secret_ref: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let id = agent.id().to_string();
        if self.agents.contains_key(&id) {
            return Err(Error::Config(format!("agent `{}` registered twice", id)));
        }
        self.agents.insert(
            id,
            RegisteredAgent {
                agent,
                secret_ref,
                timeout,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredAgent> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Id and description of every agent, sorted by id.
    pub fn descriptors(&self) -> Vec<AvailableAgent> {
        self.agents
            .values()
            .map(|r| AvailableAgent::new(r.agent.id(), r.agent.description()))
            .collect()
    }
}

/// Failures in a row after which an agent counts as unhealthy.
pub const UNHEALTHY_STREAK: u32 = 3;

/// How long a failure streak keeps an agent unhealthy without new failures.
pub const HEALTH_WINDOW: Duration = Duration::from_secs(300);

/// Rolling health of one agent, derived from its recent outcomes.
#[derive(Debug, Clone, Default)]
pub struct AgentHealth {
    /// Failures (timeouts included) since the last success.
    pub failure_streak: u32,
    pub last_failure: Option<Instant>,
    /// Summed latency of successful calls, for the mean.
    success_latency: Duration,
    successes: u32,
}

impl AgentHealth {
    pub fn is_healthy(&self) -> bool {
        let recent = self.last_failure.is_some_and(|at| at.elapsed() < HEALTH_WINDOW);
        !(recent && self.failure_streak >= UNHEALTHY_STREAK)
    }

    /// Mean latency over successful calls.
    pub fn mean_latency(&self) -> Option<Duration> {
        (self.successes > 0).then(|| self.success_latency / self.successes)
    }

    fn observe(&mut self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success(latency) => {
                self.failure_streak = 0;
                self.success_latency += latency;
                self.successes = self.successes.saturating_add(1);
            }
            CallOutcome::Failure | CallOutcome::Timeout => {
                self.failure_streak += 1;
                self.last_failure = Some(Instant::now());
            }
        }
    }
}

/// Usage counters for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timeouts: u64,
}

/// Snapshot of one agent's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub description: String,
    pub healthy: bool,
    /// Failures since the last success.
    #[serde(default)]
    pub failure_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<u64>,
    pub stats: AgentStats,
}

/// Outcome classes recorded by [`UsageTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success(Duration),
    Failure,
    Timeout,
}

/// Health and usage bookkeeping across invocations.
#[derive(Debug, Default)]
pub struct UsageTracker {
    health: HashMap<String, AgentHealth>,
    stats: HashMap<String, AgentStats>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, agent_id: &str, outcome: CallOutcome) {
        self.health.entry(agent_id.to_string()).or_default().observe(outcome);
        let stats = self.stats.entry(agent_id.to_string()).or_default();
        stats.total_calls += 1;
        match outcome {
            CallOutcome::Success(_) => stats.successful_calls += 1,
            CallOutcome::Failure => stats.failed_calls += 1,
            CallOutcome::Timeout => {
                stats.failed_calls += 1;
                stats.timeouts += 1;
            }
        }
    }

    pub fn is_healthy(&self, agent_id: &str) -> bool {
        self.health.get(agent_id).map_or(true, AgentHealth::is_healthy)
    }

    pub fn failure_streak(&self, agent_id: &str) -> u32 {
        self.health.get(agent_id).map_or(0, |h| h.failure_streak)
    }

    pub fn stats(&self, agent_id: &str) -> AgentStats {
        self.stats.get(agent_id).cloned().unwrap_or_default()
    }

    /// Status of every agent in `registry`.
    pub fn snapshot(&self, registry: &AgentRegistry) -> Vec<AgentStatus> {
        registry
            .descriptors()
            .into_iter()
            .map(|a| AgentStatus {
                healthy: self.is_healthy(&a.agent_id),
                failure_streak: self.failure_streak(&a.agent_id),
                avg_latency_ms: self
                    .health
                    .get(&a.agent_id)
                    .and_then(AgentHealth::mean_latency)
                    .map(|d| d.as_millis() as u64),
                stats: self.stats(&a.agent_id),
                agent_id: a.agent_id,
                description: a.description,
            })
            .collect()
    }
}
