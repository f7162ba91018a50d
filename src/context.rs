//! Per-execution run state threaded through every step.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of one step, branch, or invocation. Never mutated once recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    /// Output text.
    pub output: String,
    /// Whether the step succeeded.
    pub success: bool,
    /// Error message, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step id a conditional routed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
    /// Iterations a loop ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations_completed: Option<u32>,
    /// Per-branch results of a parallel step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_results: Option<BTreeMap<String, StepResult>>,
    /// Wall-clock time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Attempts made (retries included).
    #[serde(default = "one")]
    pub attempts: u32,
}

fn one() -> u32 {
    1
}

impl StepResult {
    /// A successful result.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            attempts: 1,
            ..Default::default()
        }
    }

    /// A failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_selected_branch(mut self, target: impl Into<String>) -> Self {
        self.selected_branch = Some(target.into());
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations_completed = Some(iterations);
        self
    }

    pub fn with_branch_results(mut self, results: BTreeMap<String, StepResult>) -> Self {
        self.branch_results = Some(results);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Error message, or a generic one for failures that carried none.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "step reported failure without an error message".to_string())
    }
}

/// One entry of the invocation trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRecord {
    /// Step (or branch, or orchestrator round) that issued the call.
    pub step_id: String,
    /// Agent or tool invoked.
    pub target_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall-clock time in milliseconds.
    pub duration_ms: u64,
    /// Error message, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationRecord {
    /// Record an invocation result.
    pub fn new(step_id: &str, target_id: &str, attempt: u32, result: &StepResult) -> Self {
        Self {
            step_id: step_id.to_string(),
            target_id: target_id.to_string(),
            attempt,
            success: result.success,
            duration_ms: result.duration_ms,
            error: result.error.clone(),
        }
    }
}

/// Mutable state of one workflow execution.
///
/// Results are keyed by step id and only ever inserted or replaced (loop
/// bodies replace theirs each iteration); nothing is removed.
#[derive(Debug, Clone)]
pub struct RunContext {
    user_input: String,
    steps: BTreeMap<String, StepResult>,
    loop_iteration: Option<u32>,
    steps_executed: Vec<String>,
    invocations: Vec<InvocationRecord>,
}

impl RunContext {
    /// Create a context for a new run.
    pub fn new(user_input: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            steps: BTreeMap::new(),
            loop_iteration: None,
            steps_executed: Vec::new(),
            invocations: Vec::new(),
        }
    }

    /// The original input.
    pub fn user_input(&self) -> &str {
        &self.user_input
    }

    /// Result recorded for a step, if it has run.
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.get(id)
    }

    /// All recorded results.
    pub fn steps(&self) -> &BTreeMap<String, StepResult> {
        &self.steps
    }

    /// Record (or replace) the result of a step.
    pub fn record(&mut self, id: impl Into<String>, result: StepResult) {
        self.steps.insert(id.into(), result);
    }

    /// Current loop counter, if inside a loop.
    pub fn loop_iteration(&self) -> Option<u32> {
        self.loop_iteration
    }

    /// Enter a loop scope. Returns the enclosing counter for [`exit_loop`](Self::exit_loop).
    pub fn enter_loop(&mut self) -> Option<u32> {
        let outer = self.loop_iteration;
        self.loop_iteration = Some(0);
        outer
    }

    pub fn set_loop_iteration(&mut self, iteration: u32) {
        self.loop_iteration = Some(iteration);
    }

    /// Leave a loop scope, restoring the enclosing counter.
    pub fn exit_loop(&mut self, outer: Option<u32>) {
        self.loop_iteration = outer;
    }

    /// Append a step id to the walk trace.
    pub fn mark_executed(&mut self, id: impl Into<String>) {
        self.steps_executed.push(id.into());
    }

    pub fn steps_executed(&self) -> &[String] {
        &self.steps_executed
    }

    pub fn record_invocation(&mut self, record: InvocationRecord) {
        self.invocations.push(record);
    }

    pub fn invocations(&self) -> &[InvocationRecord] {
        &self.invocations
    }

    /// Consume the context into its trace parts.
    pub fn into_parts(self) -> (Vec<String>, BTreeMap<String, StepResult>, Vec<InvocationRecord>) {
        (self.steps_executed, self.steps, self.invocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_replaces_result() {
        let mut ctx = RunContext::new("hi");
        ctx.record("a", StepResult::success("one"));
        ctx.record("a", StepResult::success("two"));
        assert_eq!(ctx.step("a").unwrap().output, "two");
        assert_eq!(ctx.steps().len(), 1);
    }

    #[test]
    fn test_nested_loop_scope_restored() {
        let mut ctx = RunContext::new("hi");
        assert_eq!(ctx.loop_iteration(), None);
        let outer = ctx.enter_loop();
        ctx.set_loop_iteration(2);
        let inner = ctx.enter_loop();
        assert_eq!(ctx.loop_iteration(), Some(0));
        ctx.exit_loop(inner);
        assert_eq!(ctx.loop_iteration(), Some(2));
        ctx.exit_loop(outer);
        assert_eq!(ctx.loop_iteration(), None);
    }

    #[test]
    fn test_step_result_serialization_omits_empty_extras() {
        let value = serde_json::to_value(StepResult::success("ok")).unwrap();
        assert_eq!(value["output"], "ok");
        assert_eq!(value["success"], true);
        assert!(value.get("selected_branch").is_none());
        assert!(value.get("branch_results").is_none());
    }
}
