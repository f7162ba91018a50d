//! LLM-driven orchestration: a planner proposes delegations, the
//! orchestrator enforces the bounds and runs them.
//!
//! Each round the [`Planner`] sees the request, the available agents and
//! every result so far, and answers with a [`Decision`]. Bounds that the
//! planner cannot override:
//!
//! - `max_depth` rounds of delegation;
//! - `max_parallel` concurrent calls per round (extra delegations are refused);
//! - `max_same_agent_calls` consecutive rounds selecting one agent, after
//!   which that agent is blocked for the rest of the session.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::context::{InvocationRecord, StepResult};
use crate::error::{Error, Result};
use crate::executor::combine;
use crate::invoker::Invoker;
use crate::types::{AgentResult, AgentWorkflowInput, AgentWorkflowOutput, AvailableAgent, OutputMetadata};
use crate::workflow::Aggregation;

/// One proposed sub-agent call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub agent_id: String,
    pub input: String,
}

impl Delegation {
    pub fn new(agent_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            input: input.into(),
        }
    }
}

/// What the planner wants to do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// Call these agents (concurrently) this round.
    Delegate {
        #[serde(default)]
        delegations: Vec<Delegation>,
    },
    /// Stop. Without a final answer the results are aggregated.
    Complete {
        #[serde(default)]
        final_answer: Option<String>,
    },
    /// Ask the user before going further.
    Clarify {
        question: String,
        #[serde(default)]
        options: Vec<String>,
    },
}

/// Everything the planner sees when deciding a round.
#[derive(Debug, Clone)]
pub struct PlanningRequest<'a> {
    pub user_input: &'a str,
    /// 1-based round about to run.
    pub round: u32,
    pub max_depth: u32,
    pub available_agents: &'a [AvailableAgent],
    pub results: &'a [AgentResult],
    /// Agents no longer accepted this session.
    pub blocked: Vec<String>,
}

/// The decision layer.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn decide(&self, request: &PlanningRequest<'_>) -> Result<Decision>;
}

/// [`Planner`] backed by an agent that answers with a JSON decision.
pub struct AgentPlanner {
    invoker: Arc<dyn Invoker>,
    planner_agent: String,
}

impl AgentPlanner {
    pub fn new(invoker: Arc<dyn Invoker>, planner_agent: impl Into<String>) -> Self {
        Self {
            invoker,
            planner_agent: planner_agent.into(),
        }
    }

    /// Render the planning prompt.
    pub fn prompt(request: &PlanningRequest<'_>) -> String {
        let mut prompt = String::from(
            "You coordinate specialist agents to answer a user request.\n\n",
        );
        prompt.push_str(&format!("User request:\n{}\n\n", request.user_input));

        prompt.push_str("Available agents:\n");
        for agent in request.available_agents {
            prompt.push_str(&format!("- {}: {}\n", agent.agent_id, agent.description));
        }
        if !request.blocked.is_empty() {
            prompt.push_str(&format!("Blocked agents (do not select): {}\n", request.blocked.join(", ")));
        }

        if !request.results.is_empty() {
            prompt.push_str("\nResults so far:\n");
            for result in request.results {
                let body = if result.success {
                    result.output.clone()
                } else {
                    format!("FAILED: {}", result.error.as_deref().unwrap_or("unknown error"))
                };
                prompt.push_str(&format!("[round {}] {}: {}\n", result.round, result.agent_id, body));
            }
        }

        prompt.push_str(&format!(
            "\nThis is round {} of at most {}. Reply with one JSON object only:\n\
             {{\"action\": \"delegate\", \"delegations\": [{{\"agent_id\": \"...\", \"input\": \"...\"}}]}}\n\
             {{\"action\": \"complete\", \"final_answer\": \"...\"}}\n\
             {{\"action\": \"clarify\", \"question\": \"...\", \"options\": [\"...\"]}}\n",
            request.round, request.max_depth
        ));
        prompt
    }
}

/// Parse a decision from model output, tolerating prose or code fences
/// around the JSON object.
pub fn parse_decision(text: &str) -> Result<Decision> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|e| Error::Protocol(format!("unparsable planner decision: {}", e))),
        _ => Err(Error::Protocol("planner reply contains no JSON object".into())),
    }
}

#[async_trait]
impl Planner for AgentPlanner {
    async fn decide(&self, request: &PlanningRequest<'_>) -> Result<Decision> {
        let reply = self
            .invoker
            .invoke(&self.planner_agent, &Self::prompt(request))
            .await?;
        if !reply.success {
            return Err(Error::Invocation {
                target: self.planner_agent.clone(),
                message: reply.error_message(),
            });
        }
        parse_decision(&reply.output)
    }
}

/// Effective bounds for one session: request overrides clamped to config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorLimits {
    pub max_depth: u32,
    pub max_parallel: usize,
    pub max_same_agent_calls: u32,
    pub aggregation: Aggregation,
}

impl OrchestratorLimits {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_parallel: config.max_parallel,
            max_same_agent_calls: config.max_same_agent_calls,
            aggregation: config.aggregation,
        }
    }

    /// Apply request overrides. They may lower a bound, never raise it.
    pub fn for_request(config: &OrchestratorConfig, input: &AgentWorkflowInput) -> Self {
        let base = Self::from_config(config);
        Self {
            max_depth: clamp(input.orchestrator_max_depth, base.max_depth),
            max_parallel: clamp(input.orchestrator_max_parallel, base.max_parallel),
            max_same_agent_calls: clamp(input.orchestrator_max_same_agent_calls, base.max_same_agent_calls),
            aggregation: input.orchestrator_aggregation.unwrap_or(base.aggregation),
        }
    }
}

fn clamp<T: Ord + From<u8>>(requested: Option<T>, ceiling: T) -> T {
    match requested {
        Some(value) => value.max(T::from(1)).min(ceiling),
        None => ceiling,
    }
}

/// Runs LLM-driven delegation sessions.
pub struct OrchestratorAgent {
    invoker: Arc<dyn Invoker>,
    planner: Arc<dyn Planner>,
    config: OrchestratorConfig,
}

impl OrchestratorAgent {
    pub fn new(invoker: Arc<dyn Invoker>, planner: Arc<dyn Planner>, config: OrchestratorConfig) -> Self {
        Self {
            invoker,
            planner,
            config,
        }
    }

    /// Agents a session may use: the request's list, or every registered
    /// agent except the planner and synthesizer.
    fn available_agents(&self, input: &AgentWorkflowInput) -> Vec<AvailableAgent> {
        if !input.orchestrator_available_agents.is_empty() {
            return input.orchestrator_available_agents.clone();
        }
        let reserved = [&self.config.planner_agent, &self.config.synthesizer_agent];
        self.invoker
            .agents()
            .into_iter()
            .filter(|a| !reserved.iter().any(|r| r.as_deref() == Some(a.agent_id.as_str())))
            .collect()
    }

    /// Run one session to completion.
    pub async fn run(&self, input: &AgentWorkflowInput) -> AgentWorkflowOutput {
        let limits = OrchestratorLimits::for_request(&self.config, input);
        let available = self.available_agents(input);
        let mut session = Session::new(limits);
        info!(
            run_id = %session.metadata.run_id,
            agent_id = %input.agent_id,
            max_depth = limits.max_depth,
            agents = available.len(),
            "Orchestration started"
        );

        let mut final_answer = None;
        let mut planner_error = None;

        for round in 1..=limits.max_depth {
            let request = PlanningRequest {
                user_input: &input.user_input,
                round,
                max_depth: limits.max_depth,
                available_agents: &available,
                results: &session.metadata.agent_results,
                blocked: session.blocked.iter().cloned().collect(),
            };
            let decision = match self.planner.decide(&request).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(round, "Planner failed, ending session: {}", e);
                    planner_error = Some(e.to_string());
                    break;
                }
            };
            debug!(round, ?decision, "Planner decided");

            match decision {
                Decision::Complete { final_answer: answer } => {
                    final_answer = answer.filter(|a| !a.trim().is_empty());
                    break;
                }
                Decision::Clarify { question, options } => {
                    info!(round, "Planner requested clarification");
                    return session.clarification(question, options);
                }
                Decision::Delegate { delegations } => {
                    let runnable = session.admit(round, delegations, &available);
                    if runnable.is_empty() {
                        info!(round, "No runnable delegation, ending session");
                        break;
                    }
                    session.metadata.iterations = round;
                    self.dispatch(&mut session, round, runnable).await;
                }
            }
        }

        let content = match final_answer {
            Some(answer) => Some(answer),
            None => self.synthesize(input, &session).await,
        };
        session.finish(content, planner_error)
    }

    /// Run one round's delegations concurrently, recording results in call order.
    async fn dispatch(&self, session: &mut Session, round: u32, runnable: Vec<Delegation>) {
        let calls = runnable.iter().map(|d| async move {
            let start = Instant::now();
            let result = match self.invoker.invoke(&d.agent_id, &d.input).await {
                Ok(result) => result,
                Err(e) => StepResult::failure(e.to_string()),
            };
            (result, start.elapsed())
        });
        let outcomes = join_all(calls).await;

        let step_id = format!("round-{}", round);
        for (delegation, (result, elapsed)) in runnable.into_iter().zip(outcomes) {
            session
                .metadata
                .tool_calls
                .push(InvocationRecord::new(&step_id, &delegation.agent_id, 1, &result));
            session.metadata.agent_results.push(AgentResult {
                agent_id: delegation.agent_id,
                input: delegation.input,
                output: result.output,
                success: result.success,
                error: result.error,
                round,
                duration_ms: elapsed.as_millis() as u64,
            });
        }
    }

    /// Compose the final answer from sub-agent results: through the
    /// synthesizer agent when configured, otherwise by aggregation.
    async fn synthesize(&self, input: &AgentWorkflowInput, session: &Session) -> Option<String> {
        let aggregated = session.aggregate()?;
        let Some(synthesizer) = &self.config.synthesizer_agent else {
            return Some(aggregated);
        };

        let prompt = format!(
            "User request:\n{}\n\nSub-agent results:\n\n{}\n\nWrite the final answer for the user.",
            input.user_input, aggregated
        );
        match self.invoker.invoke(synthesizer, &prompt).await {
            Ok(result) if result.success => Some(result.output),
            Ok(result) => {
                warn!(agent_id = %synthesizer, "Synthesizer failed: {}", result.error_message());
                Some(aggregated)
            }
            Err(e) => {
                warn!(agent_id = %synthesizer, "Synthesizer unavailable: {}", e);
                Some(aggregated)
            }
        }
    }
}

/// Mutable state of one orchestration session.
struct Session {
    limits: OrchestratorLimits,
    consecutive: HashMap<String, u32>,
    blocked: BTreeSet<String>,
    metadata: OutputMetadata,
}

impl Session {
    fn new(limits: OrchestratorLimits) -> Self {
        Self {
            limits,
            consecutive: HashMap::new(),
            blocked: BTreeSet::new(),
            metadata: OutputMetadata {
                run_id: Uuid::new_v4().to_string(),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    /// Apply the guards to a round's proposals. Refused delegations are
    /// recorded as failed results; the rest are returned for dispatch.
    fn admit(&mut self, round: u32, delegations: Vec<Delegation>, available: &[AvailableAgent]) -> Vec<Delegation> {
        let mut runnable = Vec::new();
        let mut selected = HashSet::new();

        for delegation in delegations {
            let id = delegation.agent_id.clone();
            if !available.iter().any(|a| a.agent_id == id) {
                self.refuse(round, delegation, format!("agent `{}` is not available to this orchestrator", id));
                continue;
            }
            if self.blocked.contains(&id) {
                let e = Error::SafetyLimit(format!("agent `{}` is blocked for this session", id));
                self.refuse(round, delegation, e.to_string());
                continue;
            }
            if runnable.len() >= self.limits.max_parallel {
                let e = Error::SafetyLimit(format!(
                    "max_parallel of {} reached in round {}",
                    self.limits.max_parallel, round
                ));
                self.refuse(round, delegation, e.to_string());
                continue;
            }

            selected.insert(id.clone());
            let count = self.consecutive.entry(id.clone()).or_insert(0);
            *count += 1;
            if *count > self.limits.max_same_agent_calls {
                let e = Error::SafetyLimit(format!(
                    "agent `{}` selected {} consecutive times (limit {})",
                    id, count, self.limits.max_same_agent_calls
                ));
                warn!(agent_id = %id, round, "{}", e);
                self.blocked.insert(id);
                self.refuse(round, delegation, e.to_string());
                continue;
            }
            runnable.push(delegation);
        }

        // A round without an agent breaks its streak.
        self.consecutive.retain(|id, _| selected.contains(id));
        runnable
    }

    fn refuse(&mut self, round: u32, delegation: Delegation, error: String) {
        self.metadata.agent_results.push(AgentResult {
            agent_id: delegation.agent_id,
            input: delegation.input,
            output: String::new(),
            success: false,
            error: Some(error),
            round,
            duration_ms: 0,
        });
    }

    /// Combine results per the aggregation policy; `None` when nothing succeeded.
    fn aggregate(&self) -> Option<String> {
        let results = &self.metadata.agent_results;
        let successes: Vec<(&str, String)> = results
            .iter()
            .filter(|r| r.success)
            .map(|r| (r.agent_id.as_str(), r.output.clone()))
            .collect();
        if successes.is_empty() {
            return None;
        }
        Some(match self.limits.aggregation {
            Aggregation::First => successes[0].1.clone(),
            Aggregation::Any => combine(&successes),
            Aggregation::All => {
                let sections: Vec<(&str, String)> = results
                    .iter()
                    .map(|r| {
                        let body = if r.success {
                            r.output.clone()
                        } else {
                            format!("(failed: {})", r.error.as_deref().unwrap_or("unknown error"))
                        };
                        (r.agent_id.as_str(), body)
                    })
                    .collect();
                combine(&sections)
            }
        })
    }

    fn clarification(mut self, question: String, options: Vec<String>) -> AgentWorkflowOutput {
        self.metadata.finished_at = Some(Utc::now());
        AgentWorkflowOutput {
            content: question.clone(),
            success: true,
            error: None,
            metadata: self.metadata,
            requires_clarification: true,
            clarification_question: Some(question),
            clarification_options: options,
        }
    }

    fn finish(mut self, content: Option<String>, planner_error: Option<String>) -> AgentWorkflowOutput {
        self.metadata.finished_at = Some(Utc::now());
        info!(
            run_id = %self.metadata.run_id,
            rounds = self.metadata.iterations,
            calls = self.metadata.agent_results.len(),
            answered = content.is_some(),
            "Orchestration finished"
        );
        match content {
            Some(content) => AgentWorkflowOutput {
                content,
                success: true,
                metadata: self.metadata,
                ..Default::default()
            },
            None => AgentWorkflowOutput::failure(
                planner_error.unwrap_or_else(|| "no sub-agent produced a result".to_string()),
                self.metadata,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision_with_surrounding_prose() {
        let text = "Sure! Here is my plan:\n```json\n{\"action\": \"delegate\", \"delegations\": [{\"agent_id\": \"search\", \"input\": \"flights\"}]}\n```";
        assert_eq!(
            parse_decision(text).unwrap(),
            Decision::Delegate {
                delegations: vec![Delegation::new("search", "flights")]
            }
        );
    }

    #[test]
    fn test_parse_complete_and_clarify() {
        assert_eq!(
            parse_decision(r#"{"action": "complete", "final_answer": "42"}"#).unwrap(),
            Decision::Complete {
                final_answer: Some("42".into())
            }
        );
        assert_eq!(
            parse_decision(r#"{"action": "clarify", "question": "Which city?"}"#).unwrap(),
            Decision::Clarify {
                question: "Which city?".into(),
                options: Vec::new()
            }
        );
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        assert!(matches!(parse_decision("no idea"), Err(Error::Protocol(_))));
        assert!(matches!(parse_decision("{\"action\": \"dance\"}"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_request_overrides_are_clamped() {
        let config = OrchestratorConfig::default();
        let input = AgentWorkflowInput {
            orchestrator_max_depth: Some(50),
            orchestrator_max_parallel: Some(0),
            orchestrator_max_same_agent_calls: Some(2),
            ..Default::default()
        };
        let limits = OrchestratorLimits::for_request(&config, &input);
        assert_eq!(limits.max_depth, config.max_depth);
        assert_eq!(limits.max_parallel, 1);
        assert_eq!(limits.max_same_agent_calls, 2);
    }

    #[test]
    fn test_streak_resets_when_agent_skips_a_round() {
        let limits = OrchestratorLimits {
            max_depth: 10,
            max_parallel: 3,
            max_same_agent_calls: 2,
            aggregation: Aggregation::All,
        };
        let mut session = Session::new(limits);
        let available = vec![AvailableAgent::new("a", ""), AvailableAgent::new("b", "")];
        let pick = |id: &str| vec![Delegation::new(id, "x")];

        assert_eq!(session.admit(1, pick("a"), &available).len(), 1);
        assert_eq!(session.admit(2, pick("a"), &available).len(), 1);
        assert_eq!(session.admit(3, pick("b"), &available).len(), 1);
        assert_eq!(session.admit(4, pick("a"), &available).len(), 1);
        assert!(session.blocked.is_empty());
    }

    #[test]
    fn test_excess_parallel_delegations_refused() {
        let limits = OrchestratorLimits {
            max_depth: 1,
            max_parallel: 1,
            max_same_agent_calls: 3,
            aggregation: Aggregation::All,
        };
        let mut session = Session::new(limits);
        let available = vec![AvailableAgent::new("a", ""), AvailableAgent::new("b", "")];
        let runnable = session.admit(
            1,
            vec![Delegation::new("a", "1"), Delegation::new("b", "2")],
            &available,
        );
        assert_eq!(runnable, vec![Delegation::new("a", "1")]);
        let refused = &session.metadata.agent_results[0];
        assert_eq!(refused.agent_id, "b");
        assert!(refused.error.as_deref().unwrap().contains("max_parallel"));
    }

    #[test]
    fn test_prompt_lists_agents_and_results() {
        let agents = vec![AvailableAgent::new("search", "web search")];
        let results = vec![AgentResult {
            agent_id: "search".into(),
            input: "q".into(),
            output: "found it".into(),
            success: true,
            error: None,
            round: 1,
            duration_ms: 3,
        }];
        let prompt = AgentPlanner::prompt(&PlanningRequest {
            user_input: "find flights",
            round: 2,
            max_depth: 3,
            available_agents: &agents,
            results: &results,
            blocked: vec![],
        });
        assert!(prompt.contains("- search: web search"));
        assert!(prompt.contains("[round 1] search: found it"));
        assert!(prompt.contains("round 2 of at most 3"));
    }
}
