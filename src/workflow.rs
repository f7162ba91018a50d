//! Workflow definitions: the declarative step graph external callers author.
//!
//! A definition is plain JSON:
//!
//! ```json
//! {
//!   "id": "fact-check",
//!   "name": "Summarize then verify",
//!   "entry_step": "summarize",
//!   "steps": [
//!     { "id": "summarize", "type": "agent", "agent_id": "summarizer", "input": "${user_input}" },
//!     { "id": "verify", "type": "agent", "agent_id": "fact-checker",
//!       "input": "Please verify:\n${steps.summarize.output}" }
//!   ]
//! }
//! ```
//!
//! Unless a step says otherwise (`next`, or conditional routing) the walk
//! continues with the step that follows it in `steps`.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::template::{Condition, Template};

/// Reserved step id that terminates the walk.
pub const END_STEP: &str = "end";

/// A declarative workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow ID.
    pub id: String,
    /// Workflow name.
    #[serde(default)]
    pub name: String,
    /// Top-level steps, in definition order.
    pub steps: Vec<Step>,
    /// Step the walk starts at.
    pub entry_step: String,
}

/// A single step. Common fields live here, kind-specific ones in [`StepKind`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Step ID, unique across the whole definition.
    pub id: String,
    /// What to do when the step fails at runtime.
    #[serde(default)]
    pub on_error: OnError,
    /// Explicit successor (a step id or [`END_STEP`]). Ignored for conditionals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Kind-specific configuration.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Create an agent step.
    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Agent {
                agent_id: agent_id.into(),
                input: input.into(),
            },
        )
    }

    /// Create a parallel step.
    pub fn parallel(id: impl Into<String>, branches: Vec<ParallelBranch>, aggregation: Aggregation) -> Self {
        Self::new(id, StepKind::Parallel { branches, aggregation })
    }

    /// Create a conditional step.
    pub fn conditional(
        id: impl Into<String>,
        condition_source: impl Into<String>,
        branches: BTreeMap<String, String>,
        default: Option<String>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Conditional {
                condition_source: condition_source.into(),
                branches,
                default,
            },
        )
    }

    /// Create a loop step.
    pub fn looped(
        id: impl Into<String>,
        max_iterations: u32,
        exit_condition: Option<String>,
        steps: Vec<Step>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Loop {
                max_iterations,
                exit_condition,
                steps,
            },
        )
    }

    fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            on_error: OnError::default(),
            next: None,
            kind,
        }
    }

    /// Set the error policy.
    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    /// Set an explicit successor.
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Whether this is a conditional (routing-only) step.
    pub fn is_conditional(&self) -> bool {
        matches!(self.kind, StepKind::Conditional { .. })
    }
}

fn default_input() -> String {
    "${user_input}".to_string()
}

/// Kind-specific step configuration, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke one agent.
    Agent {
        agent_id: String,
        #[serde(default = "default_input")]
        input: String,
    },
    /// Invoke several agents concurrently.
    Parallel {
        branches: Vec<ParallelBranch>,
        #[serde(default)]
        aggregation: Aggregation,
    },
    /// Route the walk on a resolved value.
    Conditional {
        condition_source: String,
        #[serde(default)]
        branches: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Repeat sub-steps until an exit condition holds or the bound is hit.
    Loop {
        max_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_condition: Option<String>,
        steps: Vec<Step>,
    },
}

/// One branch of a parallel step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelBranch {
    /// Branch ID; its result is stored under this id.
    pub id: String,
    /// Agent to invoke.
    pub agent_id: String,
    /// Input template.
    #[serde(default = "default_input")]
    pub input: String,
    /// Branch error policy.
    #[serde(default)]
    pub on_error: OnError,
}

impl ParallelBranch {
    /// Create a branch with the default (`fail`) policy.
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            input: input.into(),
            on_error: OnError::default(),
        }
    }

    /// Set the branch error policy.
    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }
}

/// Per-step error policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the workflow.
    #[default]
    Fail,
    /// Record the failure and continue.
    Skip,
    /// Retry up to the configured bound, then fail.
    Retry,
}

/// How concurrent results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Wait for every branch; every non-skip branch must succeed.
    #[default]
    All,
    /// Succeed on the first success, abandon the rest.
    First,
    /// Wait for every branch; at least one must succeed.
    Any,
}

impl WorkflowDefinition {
    /// Create an empty definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>, entry_step: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            entry_step: entry_step.into(),
        }
    }

    /// Append a top-level step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Parse a definition from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Definition(format!("invalid workflow JSON: {}", e)))
    }

    /// Find a top-level step and its position.
    pub fn find(&self, id: &str) -> Option<(usize, &Step)> {
        self.steps.iter().enumerate().find(|(_, s)| s.id == id)
    }

    /// Successor of the top-level step at `index` when no routing applies.
    pub fn successor(&self, index: usize) -> Option<String> {
        let step = self.steps.get(index)?;
        if let Some(next) = &step.next {
            return Some(next.clone());
        }
        self.steps.get(index + 1).map(|s| s.id.clone())
    }

    /// Every agent id referenced anywhere in the definition.
    pub fn agent_ids(&self) -> Vec<&str> {
        fn collect<'a>(steps: &'a [Step], out: &mut Vec<&'a str>) {
            for step in steps {
                match &step.kind {
                    StepKind::Agent { agent_id, .. } => out.push(agent_id),
                    StepKind::Parallel { branches, .. } => {
                        out.extend(branches.iter().map(|b| b.agent_id.as_str()))
                    }
                    StepKind::Loop { steps, .. } => collect(steps, out),
                    StepKind::Conditional { .. } => {}
                }
            }
        }
        let mut ids = Vec::new();
        collect(&self.steps, &mut ids);
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Check that every referenced agent is known to the caller.
    pub fn validate_targets(&self, is_known: impl Fn(&str) -> bool) -> Result<()> {
        let missing: Vec<_> = self.agent_ids().into_iter().filter(|id| !is_known(id)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::AgentNotFound(missing.join(", ")))
        }
    }

    /// Structural validation. Runs before any step executes.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::Definition(format!("workflow `{}` has no steps", self.id)));
        }

        let mut all_ids = HashSet::new();
        collect_ids(&self.steps, &mut all_ids)?;

        let top_level: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        if !top_level.contains(self.entry_step.as_str()) {
            return Err(Error::Definition(format!(
                "entry_step `{}` does not name a top-level step",
                self.entry_step
            )));
        }

        for step in &self.steps {
            check_step(step, &top_level, &all_ids, false)?;
        }

        self.check_cycles()
    }

    /// Reject cycles reachable from the entry step. Repetition must go
    /// through a `loop` step, which carries an iteration bound.
    fn check_cycles(&self) -> Result<()> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let successors = |i: usize| -> Vec<String> {
            match &self.steps[i].kind {
                StepKind::Conditional { branches, default, .. } => {
                    branches.values().chain(default.iter()).cloned().collect()
                }
                _ => self.successor(i).into_iter().collect(),
            }
        };

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.steps.len()];
        let mut path: Vec<usize> = Vec::new();
        // Iterative DFS: (node, successors, cursor)
        let entry = index[self.entry_step.as_str()];
        let mut stack: Vec<(usize, Vec<String>, usize)> = vec![(entry, successors(entry), 0)];
        marks[entry] = Mark::OnPath;
        path.push(entry);

        while let Some((node, succ, cursor)) = stack.last_mut() {
            if *cursor >= succ.len() {
                marks[*node] = Mark::Done;
                path.pop();
                stack.pop();
                continue;
            }
            let target = succ[*cursor].clone();
            *cursor += 1;
            if target == END_STEP {
                continue;
            }
            let Some(&t) = index.get(target.as_str()) else {
                continue;
            };
            match marks[t] {
                Mark::OnPath => {
                    let start = path.iter().position(|&p| p == t).unwrap_or(0);
                    let cycle: Vec<&str> = path[start..]
                        .iter()
                        .map(|&p| self.steps[p].id.as_str())
                        .chain(std::iter::once(self.steps[t].id.as_str()))
                        .collect();
                    return Err(Error::Definition(format!(
                        "cycle outside a loop step: {}",
                        cycle.join(" -> ")
                    )));
                }
                Mark::Done => {}
                Mark::Unvisited => {
                    marks[t] = Mark::OnPath;
                    path.push(t);
                    stack.push((t, successors(t), 0));
                }
            }
        }
        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn insert_id(id: &str, ids: &mut HashSet<String>) -> Result<()> {
    if !is_valid_id(id) {
        return Err(Error::Definition(format!(
            "invalid step id `{}` (use letters, digits, `_` or `-`)",
            id
        )));
    }
    if id == END_STEP {
        return Err(Error::Definition(format!("`{}` is a reserved step id", END_STEP)));
    }
    if !ids.insert(id.to_string()) {
        return Err(Error::Definition(format!("duplicate step id `{}`", id)));
    }
    Ok(())
}

fn collect_ids(steps: &[Step], ids: &mut HashSet<String>) -> Result<()> {
    for step in steps {
        insert_id(&step.id, ids)?;
        match &step.kind {
            StepKind::Parallel { branches, .. } => {
                for branch in branches {
                    insert_id(&branch.id, ids)?;
                }
            }
            StepKind::Loop { steps, .. } => collect_ids(steps, ids)?,
            _ => {}
        }
    }
    Ok(())
}

fn check_template(owner: &str, template: &str, all_ids: &HashSet<String>) -> Result<()> {
    let parsed = Template::parse(template)
        .map_err(|e| Error::Definition(format!("step `{}`: {}", owner, e)))?;
    check_references(owner, parsed.step_references(), all_ids)
}

fn check_references<'a>(
    owner: &str,
    references: impl Iterator<Item = &'a str>,
    all_ids: &HashSet<String>,
) -> Result<()> {
    for id in references {
        if !all_ids.contains(id) {
            return Err(Error::Definition(format!(
                "step `{}` references unknown step `{}`",
                owner, id
            )));
        }
    }
    Ok(())
}

fn check_target(owner: &str, target: &str, top_level: &HashSet<&str>) -> Result<()> {
    if target == END_STEP || top_level.contains(target) {
        Ok(())
    } else {
        Err(Error::Definition(format!(
            "step `{}` routes to unknown step `{}`",
            owner, target
        )))
    }
}

fn check_step(
    step: &Step,
    top_level: &HashSet<&str>,
    all_ids: &HashSet<String>,
    in_loop: bool,
) -> Result<()> {
    if let Some(next) = &step.next {
        if in_loop {
            return Err(Error::Definition(format!(
                "step `{}` inside a loop body cannot set `next`",
                step.id
            )));
        }
        check_target(&step.id, next, top_level)?;
    }

    match &step.kind {
        StepKind::Agent { agent_id, input } => {
            if agent_id.is_empty() {
                return Err(Error::Definition(format!("step `{}` has an empty agent_id", step.id)));
            }
            check_template(&step.id, input, all_ids)
        }
        StepKind::Parallel { branches, .. } => {
            if branches.is_empty() {
                return Err(Error::Definition(format!(
                    "parallel step `{}` has no branches",
                    step.id
                )));
            }
            let siblings: HashSet<&str> = branches.iter().map(|b| b.id.as_str()).collect();
            for branch in branches {
                let parsed = Template::parse(&branch.input)
                    .map_err(|e| Error::Definition(format!("branch `{}`: {}", branch.id, e)))?;
                if let Some(sibling) = parsed.step_references().find(|r| siblings.contains(r)) {
                    return Err(Error::Definition(format!(
                        "branch `{}` references sibling branch `{}`",
                        branch.id, sibling
                    )));
                }
                check_references(&branch.id, parsed.step_references(), all_ids)?;
            }
            Ok(())
        }
        StepKind::Conditional {
            condition_source,
            branches,
            default,
        } => {
            if in_loop {
                return Err(Error::Definition(format!(
                    "conditional step `{}` is not supported inside a loop body",
                    step.id
                )));
            }
            if branches.is_empty() && default.is_none() {
                return Err(Error::Definition(format!(
                    "conditional step `{}` has neither branches nor a default",
                    step.id
                )));
            }
            check_template(&step.id, condition_source, all_ids)?;
            for target in branches.values().chain(default.iter()) {
                check_target(&step.id, target, top_level)?;
            }
            Ok(())
        }
        StepKind::Loop {
            max_iterations,
            exit_condition,
            steps,
        } => {
            if *max_iterations == 0 {
                return Err(Error::Definition(format!(
                    "loop step `{}` needs max_iterations >= 1",
                    step.id
                )));
            }
            if steps.is_empty() {
                return Err(Error::Definition(format!("loop step `{}` has no steps", step.id)));
            }
            if let Some(condition) = exit_condition {
                let parsed = Condition::parse(condition)
                    .map_err(|e| Error::Definition(format!("step `{}`: {}", step.id, e)))?;
                check_references(&step.id, parsed.step_references(), all_ids)?;
            }
            for sub in steps {
                check_step(sub, top_level, all_ids, true)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "two step", "summarize")
            .with_step(Step::agent("summarize", "summarizer", "${user_input}"))
            .with_step(Step::agent(
                "verify",
                "fact-checker",
                "Please verify:\n${steps.summarize.output}",
            ))
    }

    #[test]
    fn test_parse_json_shape() {
        let json = r#"{
            "id": "wf",
            "name": "mixed",
            "entry_step": "route",
            "steps": [
                {"id": "route", "type": "conditional", "condition_source": "${user_input}",
                 "branches": {"fan": "fan"}, "default": "end"},
                {"id": "fan", "type": "parallel", "aggregation": "first",
                 "branches": [{"id": "a", "agent_id": "x", "input": "${user_input}"},
                              {"id": "b", "agent_id": "y", "input": "${user_input}", "on_error": "skip"}]},
                {"id": "refine", "type": "loop", "max_iterations": 3,
                 "exit_condition": "${steps.draft.output} contains DONE",
                 "steps": [{"id": "draft", "type": "agent", "agent_id": "writer",
                            "input": "iteration ${loop_iteration}", "on_error": "retry"}]}
            ]
        }"#;
        let def = WorkflowDefinition::from_json(json).unwrap();
        assert_eq!(def.steps.len(), 3);
        assert!(def.steps[0].is_conditional());
        match &def.steps[1].kind {
            StepKind::Parallel { branches, aggregation } => {
                assert_eq!(*aggregation, Aggregation::First);
                assert_eq!(branches[1].on_error, OnError::Skip);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &def.steps[2].kind {
            StepKind::Loop { steps, .. } => assert_eq!(steps[0].on_error, OnError::Retry),
            other => panic!("unexpected kind {:?}", other),
        }
        def.validate().unwrap();
        assert_eq!(def.agent_ids(), vec!["writer", "x", "y"]);
    }

    #[test]
    fn test_serialize_uses_type_tag() {
        let value = serde_json::to_value(&two_step()).unwrap();
        assert_eq!(value["steps"][0]["type"], "agent");
        assert_eq!(value["steps"][0]["on_error"], "fail");
        assert!(value["steps"][0].get("next").is_none());
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let json = r#"{"id": "wf", "name": "x", "entry_step": "a",
                       "steps": [{"id": "a", "type": "teleport"}]}"#;
        assert!(matches!(WorkflowDefinition::from_json(json), Err(Error::Definition(_))));
    }

    #[test]
    fn test_valid_definition() {
        two_step().validate().unwrap();
    }

    #[test]
    fn test_missing_entry_step() {
        let mut def = two_step();
        def.entry_step = "nope".into();
        assert!(matches!(def.validate(), Err(Error::Definition(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let def = two_step().with_step(Step::agent("verify", "x", "${user_input}"));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_dangling_route_rejected() {
        let mut branches = BTreeMap::new();
        branches.insert("yes".to_string(), "missing".to_string());
        let def = WorkflowDefinition::new("wf", "x", "route")
            .with_step(Step::conditional("route", "${user_input}", branches, None));
        assert!(matches!(def.validate(), Err(Error::Definition(_))));
    }

    #[test]
    fn test_reference_to_unknown_step_rejected() {
        let def = WorkflowDefinition::new("wf", "x", "a")
            .with_step(Step::agent("a", "x", "${steps.ghost.output}"));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_sibling_branch_reference_rejected() {
        let def = WorkflowDefinition::new("wf", "x", "p").with_step(Step::parallel(
            "p",
            vec![
                ParallelBranch::new("a", "x", "${user_input}"),
                ParallelBranch::new("b", "y", "${steps.a.output}"),
            ],
            Aggregation::All,
        ));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("sibling"));
    }

    #[test]
    fn test_cycle_through_conditional_rejected() {
        let mut branches = BTreeMap::new();
        branches.insert("again".to_string(), "draft".to_string());
        let def = WorkflowDefinition::new("wf", "x", "draft")
            .with_step(Step::agent("draft", "writer", "${user_input}"))
            .with_step(Step::conditional(
                "check",
                "${steps.draft.output}",
                branches,
                Some(END_STEP.to_string()),
            ));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("draft -> check -> draft"));
    }

    #[test]
    fn test_explicit_next_to_end() {
        let def = WorkflowDefinition::new("wf", "x", "a")
            .with_step(Step::agent("a", "x", "${user_input}").then(END_STEP))
            .with_step(Step::agent("b", "y", "${user_input}"));
        def.validate().unwrap();
        assert_eq!(def.successor(0).as_deref(), Some(END_STEP));
        assert_eq!(def.successor(1), None);
    }

    #[test]
    fn test_loop_bounds_required() {
        let def = WorkflowDefinition::new("wf", "x", "l").with_step(Step::looped(
            "l",
            0,
            None,
            vec![Step::agent("a", "x", "${user_input}")],
        ));
        assert!(matches!(def.validate(), Err(Error::Definition(_))));
    }

    #[test]
    fn test_validate_targets() {
        let def = two_step();
        def.validate_targets(|id| id == "summarizer" || id == "fact-checker")
            .unwrap();
        let err = def.validate_targets(|id| id == "summarizer").unwrap_err();
        assert!(matches!(err, Error::AgentNotFound(ref ids) if ids == "fact-checker"));
    }
}
