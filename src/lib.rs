//! Multi-Agent Workflow Orchestration
//!
//! This crate runs LLM-backed agents and MCP tools, and coordinates them in
//! two ways:
//!
//! - **Declarative workflows**: a JSON step graph (`agent`, `parallel`,
//!   `conditional`, `loop` steps) walked by the [`WorkflowEngine`], with
//!   `${...}` templates threading results between steps and a per-step
//!   `on_error` policy (`fail`, `skip`, `retry`).
//! - **LLM-driven orchestration**: the [`OrchestratorAgent`] lets a planner
//!   choose sub-agents round by round, inside hard bounds on depth,
//!   parallelism and repeated delegation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            MCP client (stdio)  /  agent-workflow CLI             │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ AgentWorkflowInput
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         AgentRuntime                             │
//! │  ┌──────────────────────────┐   ┌──────────────────────────┐    │
//! │  │ WorkflowEngine           │   │ OrchestratorAgent        │    │
//! │  │  └ StepExecutor          │   │  └ Planner               │    │
//! │  │     └ template resolver  │   │                          │    │
//! │  └─────────────┬────────────┘   └─────────────┬────────────┘    │
//! │                └──────────────┬───────────────┘                 │
//! │                               ▼                                 │
//! │                Invoker (timeouts, credentials, stats)           │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                 ┌───────────────┴───────────────┐
//!                 ▼                               ▼
//!         ┌───────────────┐               ┌───────────────┐
//!         │ CommandAgent  │               │ McpToolAgent  │
//!         │ (subprocess)  │               │ (MCP server)  │
//!         └───────────────┘               └───────────────┘
//! ```
//!
//! # MCP Tools
//!
//! | Tool | Description |
//! |------|-------------|
//! | `workflow_run` | Run a workflow definition |
//! | `workflow_validate` | Check a definition without running it |
//! | `agent_run` | Submit a full `AgentWorkflowInput` |
//! | `orchestrate` | Start an LLM-driven delegation session |
//! | `agent_list` | List registered agents |
//! | `agent_status` | Per-agent health and call statistics |

pub mod agents;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod invoker;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod secrets;
pub mod server;
pub mod template;
pub mod tools;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use context::{InvocationRecord, RunContext, StepResult};
pub use engine::{WorkflowEngine, WorkflowRun};
pub use error::{Error, ErrorKind, Result};
pub use executor::{StepExecutor, StepOutcome};
pub use invoker::{Invoker, RegistryInvoker};
pub use orchestrator::{AgentPlanner, Decision, Delegation, OrchestratorAgent, Planner, PlanningRequest};
pub use protocol::{McpRequest, McpResponse};
pub use registry::{Agent, AgentRegistry};
pub use runtime::AgentRuntime;
pub use secrets::{Credentials, EnvSecretStore, MemorySecretStore, SecretStore};
pub use server::WorkflowMcpServer;
pub use types::{AgentType, AgentWorkflowInput, AgentWorkflowOutput, AvailableAgent, OutputMetadata};
pub use workflow::{Aggregation, OnError, ParallelBranch, Step, StepKind, WorkflowDefinition};
