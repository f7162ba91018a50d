//! Workflow engine: walks the step graph from `entry_step` to completion.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::executor::StepExecutor;
use crate::invoker::Invoker;
use crate::types::{AgentWorkflowOutput, OutputMetadata};
use crate::workflow::{WorkflowDefinition, END_STEP};

/// A finished (or aborted) workflow execution.
#[derive(Debug)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    /// Output of the last non-conditional step that ran.
    pub content: String,
    /// Terminal error, if the run did not complete.
    pub error: Option<Error>,
    /// Final context snapshot, partial when `error` is set.
    pub context: RunContext,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into the boundary output type.
    pub fn into_output(self) -> AgentWorkflowOutput {
        let success = self.success();
        let error = self.error.map(|e| e.to_string());
        let (steps_executed, step_results, tool_calls) = self.context.into_parts();
        AgentWorkflowOutput {
            content: if success { self.content } else { String::new() },
            success,
            error,
            metadata: OutputMetadata {
                run_id: self.run_id,
                workflow_id: Some(self.workflow_id),
                iterations: steps_executed.len() as u32,
                steps_executed,
                step_results,
                tool_calls,
                agent_results: Vec::new(),
                started_at: Some(self.started_at),
                finished_at: Some(self.finished_at),
            },
            ..Default::default()
        }
    }
}

/// Drives workflow definitions through a [`StepExecutor`].
#[derive(Clone)]
pub struct WorkflowEngine {
    executor: StepExecutor,
    invoker: Arc<dyn Invoker>,
}

impl WorkflowEngine {
    pub fn new(invoker: Arc<dyn Invoker>, config: EngineConfig) -> Self {
        Self {
            executor: StepExecutor::new(Arc::clone(&invoker), config),
            invoker,
        }
    }

    /// Structural validation plus a check that every agent exists.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        definition.validate_targets(|id| self.invoker.contains(id))
    }

    /// Run a definition and return the full run record.
    pub async fn run(&self, definition: &WorkflowDefinition, user_input: &str) -> WorkflowRun {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(workflow_id = %definition.id, run_id = %run_id, "Workflow started");

        let mut ctx = RunContext::new(user_input);
        let outcome = match self.validate(definition) {
            Ok(()) => self.walk(definition, &mut ctx).await,
            Err(e) => Err(e),
        };

        let (content, error) = match outcome {
            Ok(content) => {
                info!(
                    workflow_id = %definition.id,
                    run_id = %run_id,
                    steps = ctx.steps_executed().len(),
                    "Workflow completed"
                );
                (content, None)
            }
            Err(e) => {
                error!(workflow_id = %definition.id, run_id = %run_id, kind = ?e.kind(), "Workflow failed: {}", e);
                (String::new(), Some(e))
            }
        };

        WorkflowRun {
            run_id,
            workflow_id: definition.id.clone(),
            content,
            error,
            context: ctx,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Run a definition and return the boundary output.
    pub async fn execute(&self, definition: &WorkflowDefinition, user_input: &str) -> AgentWorkflowOutput {
        self.run(definition, user_input).await.into_output()
    }

    async fn walk(&self, definition: &WorkflowDefinition, ctx: &mut RunContext) -> Result<String> {
        let mut visited = HashSet::new();
        let mut content = String::new();
        let mut current = Some(definition.entry_step.clone());

        while let Some(step_id) = current.take() {
            if step_id == END_STEP {
                break;
            }
            let (index, step) = definition
                .find(&step_id)
                .ok_or_else(|| Error::Definition(format!("step `{}` does not exist", step_id)))?;
            if !visited.insert(step_id.clone()) {
                return Err(Error::Definition(format!(
                    "step `{}` reached twice; repetition requires a loop step",
                    step_id
                )));
            }

            ctx.mark_executed(step.id.clone());
            let outcome = self.executor.execute(step, ctx).await?;
            if !step.is_conditional() {
                content = outcome.result.output;
            }

            current = match outcome.route {
                Some(target) => Some(target),
                None => definition.successor(index),
            };
        }

        Ok(content)
    }
}
