//! Boundary types: what callers submit and what they get back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{InvocationRecord, StepResult};
use crate::workflow::{Aggregation, WorkflowDefinition};

/// How a request is executed when it carries no workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// A single agent call.
    #[default]
    Standard,
    /// LLM-driven delegation to sub-agents.
    Orchestrator,
    /// A declarative workflow (requires `workflow_definition`).
    Workflow,
}

/// An agent the orchestrator may delegate to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableAgent {
    pub agent_id: String,
    #[serde(default)]
    pub description: String,
}

impl AvailableAgent {
    pub fn new(agent_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            description: description.into(),
        }
    }
}

/// A request to run an agent, a workflow, or an orchestration session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentWorkflowInput {
    pub agent_id: String,
    #[serde(default)]
    pub agent_type: AgentType,
    pub user_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_definition: Option<WorkflowDefinition>,
    /// Agents the orchestrator may use. Empty means every registered agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orchestrator_available_agents: Vec<AvailableAgent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_max_same_agent_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_aggregation: Option<Aggregation>,
}

impl AgentWorkflowInput {
    /// A standard single-agent request.
    pub fn new(agent_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_input: user_input.into(),
            ..Default::default()
        }
    }

    /// Attach a workflow definition.
    pub fn with_workflow(mut self, definition: WorkflowDefinition) -> Self {
        self.agent_type = AgentType::Workflow;
        self.workflow_definition = Some(definition);
        self
    }

    /// Switch to orchestrator mode.
    pub fn orchestrated(mut self) -> Self {
        self.agent_type = AgentType::Orchestrator;
        self
    }
}

/// One sub-agent call made by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub input: String,
    pub output: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 1-based delegation round.
    pub round: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Execution trace attached to every output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputMetadata {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Top-level step ids in the order they ran.
    #[serde(default)]
    pub steps_executed: Vec<String>,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    /// Walk steps (workflows) or delegation rounds (orchestrator).
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub tool_calls: Vec<InvocationRecord>,
    #[serde(default)]
    pub agent_results: Vec<AgentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Structured result returned for every request, including failed ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentWorkflowOutput {
    pub content: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: OutputMetadata,
    #[serde(default)]
    pub requires_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clarification_options: Vec<String>,
}

impl AgentWorkflowOutput {
    /// A failed output carrying only an error and the given trace.
    pub fn failure(error: impl Into<String>, metadata: OutputMetadata) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            metadata,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_defaults() {
        let input: AgentWorkflowInput =
            serde_json::from_str(r#"{"agent_id": "a", "user_input": "hi"}"#).unwrap();
        assert_eq!(input.agent_type, AgentType::Standard);
        assert!(input.workflow_definition.is_none());
        assert!(input.orchestrator_available_agents.is_empty());
    }

    #[test]
    fn test_orchestrator_overrides_parse() {
        let input: AgentWorkflowInput = serde_json::from_str(
            r#"{
                "agent_id": "boss",
                "agent_type": "orchestrator",
                "user_input": "plan a trip",
                "orchestrator_available_agents": [{"agent_id": "search", "description": "web"}],
                "orchestrator_max_depth": 2,
                "orchestrator_aggregation": "any"
            }"#,
        )
        .unwrap();
        assert_eq!(input.agent_type, AgentType::Orchestrator);
        assert_eq!(input.orchestrator_max_depth, Some(2));
        assert_eq!(input.orchestrator_aggregation, Some(Aggregation::Any));
        assert_eq!(input.orchestrator_available_agents[0].agent_id, "search");
    }

    #[test]
    fn test_failure_output_is_well_formed() {
        let output = AgentWorkflowOutput::failure("boom", OutputMetadata::default());
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
        assert_eq!(value["requires_clarification"], false);
        assert!(value["metadata"]["steps_executed"].as_array().unwrap().is_empty());
    }
}
