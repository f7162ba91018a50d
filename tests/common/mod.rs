//! Shared test doubles.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use agent_workflow_mcp::orchestrator::{Decision, Planner, PlanningRequest};
use agent_workflow_mcp::{AvailableAgent, Error, Invoker, Result, StepResult};

/// What a mock agent does with its input.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return the input unchanged.
    Echo,
    /// Return `prefix` followed by the input.
    Prefix(String),
    /// Return a fixed reply.
    Reply(String),
    /// Fail with a message.
    Fail(String),
    /// Sleep, then behave as the inner behavior.
    Delay(Duration, Box<Behavior>),
    /// Fail the first `n` calls, then echo.
    FailTimes(u32),
}

impl Behavior {
    pub fn delay_ms(ms: u64, then: Behavior) -> Self {
        Self::Delay(Duration::from_millis(ms), Box::new(then))
    }
}

/// Invoker with scripted agents that records every call.
#[derive(Default)]
pub struct MockInvoker {
    agents: BTreeMap<String, Behavior>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, agent_id: &str, behavior: Behavior) -> Self {
        self.agents.insert(agent_id.to_string(), behavior);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Every `(agent_id, input)` pair, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, agent_id: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == agent_id).count()
    }

    pub fn inputs_of(&self, agent_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == agent_id)
            .map(|(_, input)| input)
            .collect()
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    fn contains(&self, target_id: &str) -> bool {
        self.agents.contains_key(target_id)
    }

    fn agents(&self) -> Vec<AvailableAgent> {
        self.agents
            .keys()
            .map(|id| AvailableAgent::new(id.as_str(), format!("mock agent {}", id)))
            .collect()
    }

    async fn invoke(&self, target_id: &str, input: &str) -> Result<StepResult> {
        let mut behavior = self
            .agents
            .get(target_id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(target_id.to_string()))?;
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|(id, _)| id == target_id).count() as u32;
            calls.push((target_id.to_string(), input.to_string()));
            previous
        };

        while let Behavior::Delay(duration, then) = behavior {
            tokio::time::sleep(duration).await;
            behavior = *then;
        }

        Ok(match behavior {
            Behavior::Echo => StepResult::success(input),
            Behavior::Prefix(prefix) => StepResult::success(format!("{}{}", prefix, input)),
            Behavior::Reply(reply) => StepResult::success(reply),
            Behavior::Fail(message) => StepResult::failure(message),
            Behavior::FailTimes(n) if previous < n => {
                StepResult::failure(format!("transient failure {}", previous + 1))
            }
            Behavior::FailTimes(_) => StepResult::success(input),
            Behavior::Delay(..) => unreachable!(),
        })
    }
}

/// Planner that replays a fixed script; once exhausted it repeats the last
/// decision forever.
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<Decision>>,
    last: Mutex<Option<Decision>>,
    /// Number of results visible at each call, for assertions.
    pub seen_results: Mutex<Vec<usize>>,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<Decision>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            seen_results: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen_results.lock().unwrap().len()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn decide(&self, request: &PlanningRequest<'_>) -> Result<Decision> {
        self.seen_results.lock().unwrap().push(request.results.len());
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(decision) => {
                *last = Some(decision.clone());
                Ok(decision)
            }
            None => last
                .clone()
                .ok_or_else(|| Error::Protocol("empty planner script".into())),
        }
    }
}
