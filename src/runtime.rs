//! Request dispatch: one entry point for workflows, orchestration sessions
//! and plain agent calls.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, OrchestratorConfig};
use crate::context::InvocationRecord;
use crate::engine::WorkflowEngine;
use crate::invoker::Invoker;
use crate::orchestrator::{AgentPlanner, OrchestratorAgent, Planner};
use crate::types::{AgentType, AgentWorkflowInput, AgentWorkflowOutput, OutputMetadata};

/// Routes each [`AgentWorkflowInput`] to the engine, the orchestrator, or
/// a single invocation. Always returns a well-formed output.
pub struct AgentRuntime {
    invoker: Arc<dyn Invoker>,
    engine: WorkflowEngine,
    orchestrator_config: OrchestratorConfig,
    planner: Option<Arc<dyn Planner>>,
}

impl AgentRuntime {
    /// Build a runtime. An [`AgentPlanner`] is installed when
    /// `orchestrator.planner_agent` is configured.
    pub fn new(invoker: Arc<dyn Invoker>, config: &AppConfig) -> Self {
        let planner = config.orchestrator.planner_agent.as_ref().map(|id| {
            Arc::new(AgentPlanner::new(Arc::clone(&invoker), id.clone())) as Arc<dyn Planner>
        });
        Self {
            engine: WorkflowEngine::new(Arc::clone(&invoker), config.engine.clone()),
            invoker,
            orchestrator_config: config.orchestrator.clone(),
            planner,
        }
    }

    /// Replace the decision layer.
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    /// Execute a request.
    pub async fn run(&self, input: &AgentWorkflowInput) -> AgentWorkflowOutput {
        info!(
            agent_id = %input.agent_id,
            agent_type = ?input.agent_type,
            user_id = input.user_id.as_deref().unwrap_or("-"),
            has_workflow = input.workflow_definition.is_some(),
            "Request received"
        );

        if let Some(definition) = &input.workflow_definition {
            return self.engine.execute(definition, &input.user_input).await;
        }

        match input.agent_type {
            AgentType::Orchestrator => match &self.planner {
                Some(planner) => {
                    OrchestratorAgent::new(
                        Arc::clone(&self.invoker),
                        Arc::clone(planner),
                        self.orchestrator_config.clone(),
                    )
                    .run(input)
                    .await
                }
                None => AgentWorkflowOutput::failure(
                    "orchestrator requested but no planner agent is configured",
                    new_metadata(),
                ),
            },
            AgentType::Workflow => AgentWorkflowOutput::failure(
                "agent_type `workflow` requires a workflow_definition",
                new_metadata(),
            ),
            AgentType::Standard => self.run_single(input).await,
        }
    }

    async fn run_single(&self, input: &AgentWorkflowInput) -> AgentWorkflowOutput {
        let mut metadata = new_metadata();
        let result = match self.invoker.invoke(&input.agent_id, &input.user_input).await {
            Ok(result) => result,
            Err(e) => {
                warn!(agent_id = %input.agent_id, "Request rejected: {}", e);
                metadata.finished_at = Some(Utc::now());
                return AgentWorkflowOutput::failure(e.to_string(), metadata);
            }
        };

        metadata.iterations = 1;
        metadata
            .tool_calls
            .push(InvocationRecord::new(&input.agent_id, &input.agent_id, 1, &result));
        metadata.finished_at = Some(Utc::now());

        AgentWorkflowOutput {
            success: result.success,
            error: result.error,
            content: result.output,
            metadata,
            ..Default::default()
        }
    }
}

fn new_metadata() -> OutputMetadata {
    OutputMetadata {
        run_id: Uuid::new_v4().to_string(),
        started_at: Some(Utc::now()),
        ..Default::default()
    }
}
