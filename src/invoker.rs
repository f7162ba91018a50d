//! Uniform invocation of agents and tools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::StepResult;
use crate::error::{Error, Result};
use crate::registry::{AgentRegistry, AgentStatus, CallOutcome, UsageTracker};
use crate::secrets::{Credentials, MemorySecretStore, SecretStore};
use crate::types::AvailableAgent;

/// Executes one unit of work by target id.
///
/// `Err` is reserved for definition errors: a `target_id` that does not
/// exist ([`Error::AgentNotFound`]). A target that ran and failed, timed out,
/// or could not obtain its credentials yields `Ok` with `success == false`.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Whether `target_id` can be invoked.
    fn contains(&self, target_id: &str) -> bool;

    /// Every invocable target.
    fn agents(&self) -> Vec<AvailableAgent>;

    /// Invoke `target_id` with an already-resolved input.
    async fn invoke(&self, target_id: &str, input: &str) -> Result<StepResult>;

    /// Health and usage per target, if tracked.
    async fn status(&self) -> Vec<AgentStatus> {
        Vec::new()
    }
}

/// [`Invoker`] backed by an [`AgentRegistry`].
pub struct RegistryInvoker {
    registry: Arc<AgentRegistry>,
    secrets: Arc<dyn SecretStore>,
    usage: Arc<RwLock<UsageTracker>>,
    default_timeout: Duration,
}

impl RegistryInvoker {
    /// Create an invoker with no secret store.
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            secrets: Arc::new(MemorySecretStore::new()),
            usage: Arc::new(RwLock::new(UsageTracker::new())),
            default_timeout: Duration::from_secs(EngineConfig::default().invoke_timeout_secs),
        }
    }

    /// Create an invoker using the engine's timeout and a secret store.
    pub fn with_config(registry: AgentRegistry, secrets: Arc<dyn SecretStore>, config: &EngineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            secrets,
            usage: Arc::new(RwLock::new(UsageTracker::new())),
            default_timeout: config.invoke_timeout(),
        }
    }

    /// Override the default per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    async fn credentials(&self, secret_ref: Option<&str>) -> Result<Credentials> {
        match secret_ref {
            Some(secret_ref) => self.secrets.retrieve(secret_ref).await,
            None => Ok(Credentials::default()),
        }
    }
}

#[async_trait]
impl Invoker for RegistryInvoker {
    fn contains(&self, target_id: &str) -> bool {
        self.registry.contains(target_id)
    }

    fn agents(&self) -> Vec<AvailableAgent> {
        self.registry.descriptors()
    }

    async fn invoke(&self, target_id: &str, input: &str) -> Result<StepResult> {
        let registered = self
            .registry
            .get(target_id)
            .ok_or_else(|| Error::AgentNotFound(target_id.to_string()))?;

        let credentials = match self.credentials(registered.secret_ref.as_deref()).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(agent_id = %target_id, "Credential lookup failed: {}", e);
                self.usage.write().await.record(target_id, CallOutcome::Failure);
                return Ok(StepResult::failure(e.to_string()));
            }
        };

        {
            let usage = self.usage.read().await;
            if !usage.is_healthy(target_id) {
                warn!(
                    agent_id = %target_id,
                    failure_streak = usage.failure_streak(target_id),
                    "Invoking an agent marked unhealthy"
                );
            }
        }

        let timeout = registered.timeout.unwrap_or(self.default_timeout);
        debug!(agent_id = %target_id, input_len = input.len(), "Invoking agent");

        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, registered.agent.run(input, &credentials)).await;
        let elapsed = start.elapsed();

        let (result, call) = match outcome {
            Ok(Ok(output)) => (StepResult::success(output), CallOutcome::Success(elapsed)),
            Ok(Err(e)) => {
                warn!(agent_id = %target_id, "Agent failed: {}", e);
                (StepResult::failure(e.to_string()), CallOutcome::Failure)
            }
            Err(_) => {
                let e = Error::Timeout {
                    target: target_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                };
                warn!(agent_id = %target_id, "{}", e);
                (StepResult::failure(e.to_string()), CallOutcome::Timeout)
            }
        };

        self.usage.write().await.record(target_id, call);
        Ok(result.with_duration(elapsed))
    }

    async fn status(&self) -> Vec<AgentStatus> {
        self.usage.read().await.snapshot(&self.registry)
    }
}
