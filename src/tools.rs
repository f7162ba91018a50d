//! MCP tools exposed by the server.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::runtime::AgentRuntime;
use crate::types::{AgentType, AgentWorkflowInput, AgentWorkflowOutput, AvailableAgent};
use crate::workflow::{Aggregation, WorkflowDefinition};

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value, context: &ToolContext) -> Result<ToolCallResult>;
}

/// Context passed to tools during execution.
pub struct ToolContext {
    pub runtime: Arc<AgentRuntime>,
}

impl ToolContext {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Create a registry with the default tools.
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        let mut registry = Self {
            tools: BTreeMap::new(),
            context: Arc::new(ToolContext::new(runtime)),
        };
        registry.register(Arc::new(WorkflowRunTool));
        registry.register(Arc::new(WorkflowValidateTool));
        registry.register(Arc::new(AgentRunTool));
        registry.register(Arc::new(OrchestrateTool));
        registry.register(Arc::new(AgentListTool));
        registry.register(Arc::new(AgentStatusTool));
        registry
    }

    /// Register a tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    /// Get all tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::InvalidParams(format!("unknown tool: {}", name)))?;

        tool.execute(arguments, &self.context).await
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: serde_json::Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

/// Render a run output; failed runs are tool-level errors.
fn output_result(output: &AgentWorkflowOutput) -> Result<ToolCallResult> {
    let text = serde_json::to_string_pretty(output)?;
    Ok(if output.success {
        ToolCallResult::success(text)
    } else {
        ToolCallResult::error(text)
    })
}

/// Runs a workflow definition.
pub struct WorkflowRunTool;

#[derive(Debug, Deserialize)]
struct WorkflowRunArgs {
    workflow: WorkflowDefinition,
    user_input: String,
}

#[async_trait::async_trait]
impl Tool for WorkflowRunTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "workflow_run".into(),
            description: "Run a declarative workflow (agent, parallel, conditional and loop steps) and return its output and execution trace.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "workflow": {
                        "type": "object",
                        "description": "Workflow definition: {id, name, steps, entry_step}"
                    },
                    "user_input": {
                        "type": "string",
                        "description": "Input available to templates as ${user_input}"
                    }
                },
                "required": ["workflow", "user_input"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: WorkflowRunArgs = parse_args(arguments)?;
        let output = context
            .runtime
            .engine()
            .execute(&args.workflow, &args.user_input)
            .await;
        output_result(&output)
    }
}

/// Validates a workflow definition without running it.
pub struct WorkflowValidateTool;

#[derive(Debug, Deserialize)]
struct WorkflowValidateArgs {
    workflow: WorkflowDefinition,
}

#[async_trait::async_trait]
impl Tool for WorkflowValidateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "workflow_validate".into(),
            description: "Check a workflow definition for structural errors, unknown agents and cycles.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "workflow": {
                        "type": "object",
                        "description": "Workflow definition to check"
                    }
                },
                "required": ["workflow"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: WorkflowValidateArgs = parse_args(arguments)?;
        Ok(match context.runtime.engine().validate(&args.workflow) {
            Ok(()) => ToolCallResult::success(format!(
                "Workflow `{}` is valid ({} top-level steps).",
                args.workflow.id,
                args.workflow.steps.len()
            )),
            Err(e) => ToolCallResult::error(e.to_string()),
        })
    }
}

/// Submits a full request.
pub struct AgentRunTool;

#[async_trait::async_trait]
impl Tool for AgentRunTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "agent_run".into(),
            description: "Submit a request: a single agent call, a workflow (with workflow_definition) or an orchestrator session.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_id": { "type": "string" },
                    "agent_type": {
                        "type": "string",
                        "enum": ["standard", "orchestrator", "workflow"]
                    },
                    "user_input": { "type": "string" },
                    "user_id": { "type": "string" },
                    "workflow_definition": { "type": "object" },
                    "orchestrator_available_agents": { "type": "array" },
                    "orchestrator_max_depth": { "type": "integer", "minimum": 1 },
                    "orchestrator_max_parallel": { "type": "integer", "minimum": 1 },
                    "orchestrator_max_same_agent_calls": { "type": "integer", "minimum": 1 },
                    "orchestrator_aggregation": {
                        "type": "string",
                        "enum": ["all", "first", "any"]
                    }
                },
                "required": ["agent_id", "user_input"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, context: &ToolContext) -> Result<ToolCallResult> {
        let input: AgentWorkflowInput = parse_args(arguments)?;
        output_result(&context.runtime.run(&input).await)
    }
}

/// Starts an orchestrator session.
pub struct OrchestrateTool;

#[derive(Debug, Deserialize)]
struct OrchestrateArgs {
    user_input: String,
    #[serde(default)]
    agents: Vec<String>,
    max_depth: Option<u32>,
    max_parallel: Option<usize>,
    aggregation: Option<Aggregation>,
}

#[async_trait::async_trait]
impl Tool for OrchestrateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "orchestrate".into(),
            description: "Let the planner agent delegate the request to sub-agents and combine their answers.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "user_input": {
                        "type": "string",
                        "description": "The request to work on"
                    },
                    "agents": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Optional: restrict delegation to these agent ids"
                    },
                    "max_depth": { "type": "integer", "minimum": 1 },
                    "max_parallel": { "type": "integer", "minimum": 1 },
                    "aggregation": {
                        "type": "string",
                        "enum": ["all", "first", "any"]
                    }
                },
                "required": ["user_input"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: OrchestrateArgs = parse_args(arguments)?;
        let known = context.runtime.invoker().agents();
        let mut available = Vec::new();
        for id in &args.agents {
            let agent = known
                .iter()
                .find(|a| &a.agent_id == id)
                .cloned()
                .ok_or_else(|| Error::InvalidParams(format!("unknown agent: {}", id)))?;
            available.push(agent);
        }

        let input = AgentWorkflowInput {
            agent_id: "orchestrator".into(),
            agent_type: AgentType::Orchestrator,
            user_input: args.user_input,
            orchestrator_available_agents: available,
            orchestrator_max_depth: args.max_depth,
            orchestrator_max_parallel: args.max_parallel,
            orchestrator_aggregation: args.aggregation,
            ..Default::default()
        };
        output_result(&context.runtime.run(&input).await)
    }
}

/// Lists registered agents.
pub struct AgentListTool;

#[async_trait::async_trait]
impl Tool for AgentListTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "agent_list".into(),
            description: "List registered agents and their descriptions.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn execute(&self, _arguments: serde_json::Value, context: &ToolContext) -> Result<ToolCallResult> {
        let agents: Vec<AvailableAgent> = context.runtime.invoker().agents();
        if agents.is_empty() {
            return Ok(ToolCallResult::success("No agents registered."));
        }
        let text = agents
            .iter()
            .map(|a| format!("- `{}`: {}", a.agent_id, a.description))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolCallResult::success(format!("# Agents\n\n{}", text)))
    }
}

/// Reports per-agent health and usage.
pub struct AgentStatusTool;

#[async_trait::async_trait]
impl Tool for AgentStatusTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "agent_status".into(),
            description: "Get health and call statistics for every agent.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn execute(&self, _arguments: serde_json::Value, context: &ToolContext) -> Result<ToolCallResult> {
        let status = context.runtime.invoker().status().await;
        if status.is_empty() {
            return Ok(ToolCallResult::success("No agent statistics available."));
        }
        let text = status
            .iter()
            .map(|s| {
                format!(
                    "- **{}** ({}): {} total, {} success, {} failed, {} timeouts{}",
                    s.agent_id,
                    if s.healthy {
                        "healthy".to_string()
                    } else {
                        format!("unhealthy, {} failures in a row", s.failure_streak)
                    },
                    s.stats.total_calls,
                    s.stats.successful_calls,
                    s.stats.failed_calls,
                    s.stats.timeouts,
                    s.avg_latency_ms
                        .map(|ms| format!(", ~{}ms", ms))
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolCallResult::success(format!("# Agent Status\n\n{}", text)))
    }
}
