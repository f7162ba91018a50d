//! Step execution: one state machine per step kind, plus the `on_error` policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{InvocationRecord, RunContext, StepResult};
use crate::error::{Error, ErrorKind, Result};
use crate::invoker::Invoker;
use crate::template::{resolve, Condition};
use crate::workflow::{Aggregation, OnError, ParallelBranch, Step, StepKind};

/// Result of executing a step, plus where a conditional routed the walk.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    /// Target chosen by a conditional step; `None` for every other kind.
    pub route: Option<String>,
}

/// Executes single steps against a [`RunContext`].
///
/// `execute` returns:
/// - `Ok` when the step succeeded, or failed under `skip`;
/// - `Err(Error::StepFailed)` when it failed under `fail` (or ran out of retries);
/// - any other `Err` for definition and scope errors, which are never retried.
///
/// In every runtime case the step's result is recorded in the context first.
#[derive(Clone)]
pub struct StepExecutor {
    invoker: Arc<dyn Invoker>,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(invoker: Arc<dyn Invoker>, config: EngineConfig) -> Self {
        Self { invoker, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `step`, applying its error policy.
    pub fn execute<'a>(&'a self, step: &'a Step, ctx: &'a mut RunContext) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let start = Instant::now();
            let max_attempts = attempts_for(step.on_error, &self.config);
            debug!(step_id = %step.id, kind = kind_name(&step.kind), "Executing step");

            let mut attempt = 0;
            let (result, route) = loop {
                attempt += 1;
                let (result, route) = self.run_kind(step, ctx, attempt).await?;
                if result.success || attempt >= max_attempts {
                    break (result, route);
                }
                warn!(
                    step_id = %step.id,
                    attempt,
                    max_attempts,
                    "Step failed, retrying: {}",
                    result.error_message()
                );
                tokio::time::sleep(self.config.retry_backoff(attempt)).await;
            };

            let result = result.with_attempts(attempt).with_duration(start.elapsed());
            ctx.record(step.id.clone(), result.clone());

            if !result.success {
                if step.on_error == OnError::Skip {
                    warn!(step_id = %step.id, "Step failed, skipping: {}", result.error_message());
                } else {
                    return Err(Error::StepFailed {
                        step_id: step.id.clone(),
                        message: result.error_message(),
                    });
                }
            } else {
                info!(step_id = %step.id, attempts = attempt, "Step completed");
            }

            Ok(StepOutcome { result, route })
        })
    }

    async fn run_kind(
        &self,
        step: &Step,
        ctx: &mut RunContext,
        attempt: u32,
    ) -> Result<(StepResult, Option<String>)> {
        match &step.kind {
            StepKind::Agent { agent_id, input } => {
                let input = resolve(input, ctx)?;
                let result = runtime_failure(self.invoker.invoke(agent_id, &input).await)?;
                ctx.record_invocation(InvocationRecord::new(&step.id, agent_id, attempt, &result));
                Ok((result, None))
            }
            StepKind::Parallel { branches, aggregation } => {
                let result = self.run_parallel(&step.id, branches, *aggregation, ctx).await?;
                Ok((result, None))
            }
            StepKind::Conditional {
                condition_source,
                branches,
                default,
            } => {
                let value = resolve(condition_source, ctx)?;
                let target = branches
                    .get(&value)
                    .or_else(|| branches.get(value.trim()))
                    .or(default.as_ref())
                    .ok_or_else(|| {
                        Error::Definition(format!(
                            "conditional `{}`: value `{}` matches no branch and there is no default",
                            step.id,
                            preview(&value)
                        ))
                    })?;
                info!(step_id = %step.id, target = %target, "Conditional routed");
                Ok((StepResult::success("").with_selected_branch(target), Some(target.clone())))
            }
            StepKind::Loop {
                max_iterations,
                exit_condition,
                steps,
            } => {
                let outer = ctx.enter_loop();
                let result = self
                    .run_loop(&step.id, *max_iterations, exit_condition.as_deref(), steps, ctx)
                    .await;
                ctx.exit_loop(outer);
                Ok((result?, None))
            }
        }
    }

    async fn run_parallel(
        &self,
        step_id: &str,
        branches: &[ParallelBranch],
        aggregation: Aggregation,
        ctx: &mut RunContext,
    ) -> Result<StepResult> {
        // Inputs only see results recorded before the step started.
        let inputs = branches
            .iter()
            .map(|b| resolve(&b.input, ctx))
            .collect::<Result<Vec<_>>>()?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut set = JoinSet::new();
        for (index, (branch, input)) in branches.iter().zip(inputs).enumerate() {
            let invoker = Arc::clone(&self.invoker);
            let semaphore = Arc::clone(&semaphore);
            let config = self.config.clone();
            let branch = branch.clone();
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("branch semaphore closed".into()))?;
                let (result, records) = run_branch(invoker.as_ref(), &config, &branch, &input).await?;
                Ok::<_, Error>((index, result, records))
            });
        }

        let mut slots: Vec<Option<(StepResult, Vec<InvocationRecord>)>> =
            branches.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (index, result, records) = match joined {
                Ok(Ok(done)) => done,
                Ok(Err(e)) => {
                    set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    set.abort_all();
                    return Err(Error::Internal(format!("branch task of `{}` failed: {}", step_id, e)));
                }
            };
            let won = result.success;
            slots[index] = Some((result, records));
            if aggregation == Aggregation::First && won {
                debug!(step_id = %step_id, branch = %branches[index].id, "First branch succeeded, abandoning the rest");
                set.abort_all();
                break;
            }
        }
        // Dropping the set aborts anything still running; nothing it yields is read.
        drop(set);

        let mut branch_results = BTreeMap::new();
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut winner = None;
        for (branch, slot) in branches.iter().zip(slots) {
            let Some((result, records)) = slot else {
                continue;
            };
            for record in records {
                ctx.record_invocation(record);
            }
            if result.success {
                if winner.is_none() {
                    winner = Some(result.output.clone());
                }
                succeeded.push((branch.id.as_str(), result.output.clone()));
            } else {
                failed.push((branch, result.error_message()));
            }
            ctx.record(branch.id.clone(), result.clone());
            branch_results.insert(branch.id.clone(), result);
        }

        let success = match aggregation {
            Aggregation::All => {
                !succeeded.is_empty() && failed.iter().all(|(b, _)| b.on_error == OnError::Skip)
            }
            Aggregation::First | Aggregation::Any => !succeeded.is_empty(),
        };

        let result = if success {
            let output = match aggregation {
                Aggregation::First => winner.unwrap_or_default(),
                Aggregation::All | Aggregation::Any => combine(&succeeded),
            };
            StepResult::success(output)
        } else {
            let detail = failed
                .iter()
                .map(|(b, e)| format!("{}: {}", b.id, e))
                .collect::<Vec<_>>()
                .join("; ");
            StepResult::failure(format!("parallel step `{}` failed ({})", step_id, detail))
        };
        Ok(result.with_branch_results(branch_results))
    }

    async fn run_loop(
        &self,
        step_id: &str,
        max_iterations: u32,
        exit_condition: Option<&str>,
        steps: &[Step],
        ctx: &mut RunContext,
    ) -> Result<StepResult> {
        let exit = exit_condition.map(Condition::parse).transpose()?;
        let mut completed = 0;
        let mut output = String::new();

        for iteration in 0..max_iterations {
            ctx.set_loop_iteration(iteration);
            for sub in steps {
                match self.execute(sub, ctx).await {
                    Ok(outcome) => {
                        if outcome.result.success {
                            output = outcome.result.output;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Runtime => {
                        return Ok(StepResult::failure(format!("iteration {}: {}", iteration, e))
                            .with_iterations(completed));
                    }
                    Err(e) => return Err(e),
                }
            }
            completed = iteration + 1;

            if let Some(exit) = &exit {
                if exit.evaluate(ctx)? {
                    debug!(step_id = %step_id, iteration, "Loop exit condition met");
                    break;
                }
            }
        }

        info!(step_id = %step_id, iterations = completed, "Loop finished");
        Ok(StepResult::success(output).with_iterations(completed))
    }
}

/// Run one parallel branch with its own retry policy.
async fn run_branch(
    invoker: &dyn Invoker,
    config: &EngineConfig,
    branch: &ParallelBranch,
    input: &str,
) -> Result<(StepResult, Vec<InvocationRecord>)> {
    let max_attempts = attempts_for(branch.on_error, config);
    let mut records = Vec::new();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = runtime_failure(invoker.invoke(&branch.agent_id, input).await)?;
        records.push(InvocationRecord::new(&branch.id, &branch.agent_id, attempt, &result));
        if result.success || attempt >= max_attempts {
            return Ok((result.with_attempts(attempt), records));
        }
        debug!(branch = %branch.id, attempt, "Branch failed, retrying");
        tokio::time::sleep(config.retry_backoff(attempt)).await;
    }
}

/// Runtime errors from an invoker become a failed result so the step's
/// error policy applies; definition and scope errors propagate.
fn runtime_failure(outcome: Result<StepResult>) -> Result<StepResult> {
    match outcome {
        Err(e) if e.is_retryable() => Ok(StepResult::failure(e.to_string())),
        other => other,
    }
}

fn attempts_for(policy: OnError, config: &EngineConfig) -> u32 {
    match policy {
        OnError::Retry => 1 + config.max_retries,
        OnError::Fail | OnError::Skip => 1,
    }
}

/// Join successful branch outputs as `**id**:` sections.
pub(crate) fn combine(outputs: &[(&str, String)]) -> String {
    outputs
        .iter()
        .map(|(id, output)| format!("**{}**:\n{}", id, output))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn kind_name(kind: &StepKind) -> &'static str {
    match kind {
        StepKind::Agent { .. } => "agent",
        StepKind::Parallel { .. } => "parallel",
        StepKind::Conditional { .. } => "conditional",
        StepKind::Loop { .. } => "loop",
    }
}

fn preview(value: &str) -> String {
    const MAX: usize = 80;
    match value.char_indices().nth(MAX) {
        Some((end, _)) => format!("{}...", &value[..end]),
        None => value.to_string(),
    }
}
