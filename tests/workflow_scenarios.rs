//! End-to-end workflow runs against scripted agents.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_workflow_mcp::config::EngineConfig;
use agent_workflow_mcp::{
    Aggregation, Error, OnError, ParallelBranch, Step, WorkflowDefinition, WorkflowEngine,
};

use common::{Behavior, MockInvoker};

fn engine(invoker: &Arc<MockInvoker>) -> WorkflowEngine {
    let config = EngineConfig {
        retry_backoff_ms: 1,
        ..Default::default()
    };
    WorkflowEngine::new(invoker.clone(), config)
}

fn routes(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn test_summarize_then_verify() {
    let invoker = MockInvoker::new()
        .with("summarizer", Behavior::Reply("S".into()))
        .with("fact-checker", Behavior::Prefix("verified: ".into()))
        .shared();
    let definition = WorkflowDefinition::new("fact-check", "Summarize then verify", "summarize")
        .with_step(Step::agent("summarize", "summarizer", "${user_input}"))
        .with_step(Step::agent(
            "verify",
            "fact-checker",
            "Please verify:\n${steps.summarize.output}",
        ));

    let output = engine(&invoker).execute(&definition, "a long article").await;

    assert!(output.success, "{:?}", output.error);
    assert_eq!(output.content, "verified: Please verify:\nS");
    assert_eq!(output.metadata.steps_executed, vec!["summarize", "verify"]);
    assert_eq!(invoker.inputs_of("summarizer"), vec!["a long article"]);
    assert_eq!(invoker.inputs_of("fact-checker"), vec!["Please verify:\nS"]);
    assert_eq!(output.metadata.workflow_id.as_deref(), Some("fact-check"));
    assert_eq!(output.metadata.tool_calls.len(), 2);
}

#[test]
fn test_json_definition_runs_synchronously() {
    let json = r#"{
        "id": "fact-check",
        "name": "Summarize then verify",
        "entry_step": "summarize",
        "steps": [
            { "id": "summarize", "type": "agent", "agent_id": "summarizer", "input": "${user_input}" },
            { "id": "verify", "type": "agent", "agent_id": "fact-checker",
              "input": "Please verify:\n${steps.summarize.output}", "on_error": "skip" }
        ]
    }"#;
    let definition = WorkflowDefinition::from_json(json).unwrap();
    assert_eq!(definition.steps.len(), 2);
    assert_eq!(definition.steps[1].on_error, OnError::Skip);

    let invoker = MockInvoker::new()
        .with("summarizer", Behavior::Echo)
        .with("fact-checker", Behavior::Echo)
        .shared();
    let output = tokio_test::block_on(engine(&invoker).execute(&definition, "text"));
    assert!(output.success);
    assert_eq!(output.content, "Please verify:\ntext");
}

#[tokio::test]
async fn test_loop_runs_to_max_iterations() {
    let invoker = MockInvoker::new().with("worker", Behavior::Echo).shared();
    let definition = WorkflowDefinition::new("loop", "Bounded loop", "refine").with_step(Step::looped(
        "refine",
        3,
        Some("${steps.draft.output} == never".into()),
        vec![Step::agent("draft", "worker", "pass ${loop_iteration}")],
    ));

    let run = engine(&invoker).run(&definition, "").await;

    assert!(run.success(), "{:?}", run.error);
    let result = run.context.step("refine").unwrap();
    assert_eq!(result.iterations_completed, Some(3));
    assert_eq!(run.content, "pass 2");
    assert_eq!(invoker.inputs_of("worker"), vec!["pass 0", "pass 1", "pass 2"]);
}

#[tokio::test]
async fn test_loop_exits_when_condition_holds() {
    let invoker = MockInvoker::new().with("worker", Behavior::Echo).shared();
    let definition = WorkflowDefinition::new("loop", "Early exit", "refine").with_step(Step::looped(
        "refine",
        10,
        Some("${steps.draft.output} == pass 1".into()),
        vec![Step::agent("draft", "worker", "pass ${loop_iteration}")],
    ));

    let run = engine(&invoker).run(&definition, "").await;

    assert!(run.success());
    assert_eq!(run.context.step("refine").unwrap().iterations_completed, Some(2));
    assert_eq!(invoker.call_count("worker"), 2);
}

#[tokio::test]
async fn test_first_waits_past_fast_failure() {
    let invoker = MockInvoker::new()
        .with("slow", Behavior::delay_ms(50, Behavior::Reply("slow answer".into())))
        .with("broken", Behavior::Fail("boom".into()))
        .shared();
    let definition = WorkflowDefinition::new("race", "First wins", "race").with_step(Step::parallel(
        "race",
        vec![
            ParallelBranch::new("a", "slow", "${user_input}"),
            ParallelBranch::new("b", "broken", "${user_input}"),
        ],
        Aggregation::First,
    ));

    let output = engine(&invoker).execute(&definition, "q").await;

    assert!(output.success, "{:?}", output.error);
    assert_eq!(output.content, "slow answer");
}

#[tokio::test]
async fn test_first_abandons_slow_branch() {
    let invoker = MockInvoker::new()
        .with("fast", Behavior::Reply("fast answer".into()))
        .with("glacial", Behavior::delay_ms(5_000, Behavior::Echo))
        .shared();
    let definition = WorkflowDefinition::new("race", "First wins", "race").with_step(Step::parallel(
        "race",
        vec![
            ParallelBranch::new("slow", "glacial", "${user_input}"),
            ParallelBranch::new("quick", "fast", "${user_input}"),
        ],
        Aggregation::First,
    ));

    let started = Instant::now();
    let run = engine(&invoker).run(&definition, "q").await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(run.success());
    assert_eq!(run.content, "fast answer");
    assert!(run.context.step("quick").is_some());
    assert!(run.context.step("slow").is_none());
}

#[tokio::test]
async fn test_all_fails_when_a_fail_branch_fails() {
    let invoker = MockInvoker::new()
        .with("prep", Behavior::Reply("prepared".into()))
        .with("good", Behavior::Echo)
        .with("bad", Behavior::Fail("unavailable".into()))
        .shared();
    let definition = WorkflowDefinition::new("fanout", "All must pass", "prep")
        .with_step(Step::agent("prep", "prep", "${user_input}"))
        .with_step(Step::parallel(
            "fan",
            vec![
                ParallelBranch::new("ok", "good", "${steps.prep.output}"),
                ParallelBranch::new("ko", "bad", "${steps.prep.output}"),
            ],
            Aggregation::All,
        ))
        .with_step(Step::agent("after", "good", "never"));

    let output = engine(&invoker).execute(&definition, "x").await;

    assert!(!output.success);
    assert!(output.content.is_empty());
    assert!(output.error.unwrap().contains("fan"));
    let results = &output.metadata.step_results;
    assert!(results["prep"].success);
    assert!(!results["fan"].success);
    assert!(!results["ko"].success);
    assert!(!results.contains_key("after"));
    assert_eq!(invoker.call_count("good"), 1);
}

#[tokio::test]
async fn test_all_tolerates_skip_branch() {
    let invoker = MockInvoker::new()
        .with("good", Behavior::Reply("fine".into()))
        .with("bad", Behavior::Fail("unavailable".into()))
        .shared();
    let definition = WorkflowDefinition::new("fanout", "Skip branch", "fan").with_step(Step::parallel(
        "fan",
        vec![
            ParallelBranch::new("ok", "good", "${user_input}"),
            ParallelBranch::new("ko", "bad", "${user_input}").on_error(OnError::Skip),
        ],
        Aggregation::All,
    ));

    let output = engine(&invoker).execute(&definition, "x").await;

    assert!(output.success, "{:?}", output.error);
    assert!(output.content.contains("**ok**:\nfine"));
}

#[tokio::test]
async fn test_conditional_without_match_or_default_is_definition_error() {
    let invoker = MockInvoker::new()
        .with("classifier", Behavior::Reply("maybe".into()))
        .with("worker", Behavior::Echo)
        .shared();
    let definition = WorkflowDefinition::new("route", "Routing", "classify")
        .with_step(Step::agent("classify", "classifier", "${user_input}"))
        .with_step(Step::conditional(
            "decide",
            "${steps.classify.output}",
            routes(&[("yes", "work"), ("no", "end")]),
            None,
        ))
        .with_step(Step::agent("work", "worker", "${user_input}"));

    let run = engine(&invoker).run(&definition, "q").await;

    assert!(matches!(run.error, Some(Error::Definition(_))), "{:?}", run.error);
    assert_eq!(invoker.call_count("worker"), 0);
}

#[tokio::test]
async fn test_conditional_routes_to_end() {
    let invoker = MockInvoker::new()
        .with("classifier", Behavior::Reply(" no \n".into()))
        .with("worker", Behavior::Echo)
        .shared();
    let definition = WorkflowDefinition::new("route", "Routing", "classify")
        .with_step(Step::agent("classify", "classifier", "${user_input}"))
        .with_step(Step::conditional(
            "decide",
            "${steps.classify.output}",
            routes(&[("yes", "work"), ("no", "end")]),
            None,
        ))
        .with_step(Step::agent("work", "worker", "${user_input}"));

    let run = engine(&invoker).run(&definition, "q").await;

    assert!(run.success(), "{:?}", run.error);
    assert_eq!(run.context.steps_executed(), ["classify", "decide"]);
    assert_eq!(run.context.step("decide").unwrap().selected_branch.as_deref(), Some("end"));
    // Conditionals produce no content of their own.
    assert_eq!(run.content, " no \n");
}

#[tokio::test]
async fn test_conditional_default_branch() {
    let invoker = MockInvoker::new()
        .with("classifier", Behavior::Reply("unsure".into()))
        .with("worker", Behavior::Prefix("handled: ".into()))
        .shared();
    let definition = WorkflowDefinition::new("route", "Routing", "classify")
        .with_step(Step::agent("classify", "classifier", "${user_input}"))
        .with_step(Step::conditional(
            "decide",
            "${steps.classify.output}",
            routes(&[("yes", "end")]),
            Some("work".into()),
        ))
        .with_step(Step::agent("work", "worker", "${user_input}"));

    let output = engine(&invoker).execute(&definition, "q").await;

    assert!(output.success);
    assert_eq!(output.content, "handled: q");
}

/// Steps without routing fall through to the next step in definition order.
/// `next` overrides that, including jumping straight to `end`.
#[tokio::test]
async fn test_successor_is_definition_order_unless_next_is_set() {
    let invoker = MockInvoker::new().with("worker", Behavior::Echo).shared();
    let definition = WorkflowDefinition::new("order", "Ordering", "one")
        .with_step(Step::agent("one", "worker", "1").then("three"))
        .with_step(Step::agent("two", "worker", "2"))
        .with_step(Step::agent("three", "worker", "3"))
        .with_step(Step::agent("four", "worker", "4").then("end"))
        .with_step(Step::agent("five", "worker", "5"));

    let run = engine(&invoker).run(&definition, "").await;

    assert!(run.success(), "{:?}", run.error);
    assert_eq!(run.context.steps_executed(), ["one", "three", "four"]);
    assert_eq!(run.content, "4");
}

#[tokio::test]
async fn test_skip_continues_the_walk() {
    let invoker = MockInvoker::new()
        .with("bad", Behavior::Fail("nope".into()))
        .with("worker", Behavior::Echo)
        .shared();
    let definition = WorkflowDefinition::new("skip", "Skip", "flaky")
        .with_step(Step::agent("flaky", "bad", "${user_input}").on_error(OnError::Skip))
        .with_step(Step::agent("next", "worker", "after ${steps.flaky.success}"));

    let output = engine(&invoker).execute(&definition, "q").await;

    assert!(output.success);
    assert_eq!(output.content, "after false");
    assert!(!output.metadata.step_results["flaky"].success);
}

#[tokio::test]
async fn test_retry_attempts_are_traced() {
    let invoker = MockInvoker::new().with("flaky", Behavior::FailTimes(2)).shared();
    let definition = WorkflowDefinition::new("retry", "Retry", "call")
        .with_step(Step::agent("call", "flaky", "${user_input}").on_error(OnError::Retry));

    let output = engine(&invoker).execute(&definition, "q").await;

    assert!(output.success, "{:?}", output.error);
    let attempts: Vec<(u32, bool)> = output
        .metadata
        .tool_calls
        .iter()
        .map(|call| (call.attempt, call.success))
        .collect();
    assert_eq!(attempts, vec![(1, false), (2, false), (3, true)]);
    assert_eq!(output.metadata.step_results["call"].attempts, 3);
}

#[tokio::test]
async fn test_retry_exhaustion_fails() {
    let invoker = MockInvoker::new().with("flaky", Behavior::FailTimes(10)).shared();
    let definition = WorkflowDefinition::new("retry", "Retry", "call")
        .with_step(Step::agent("call", "flaky", "${user_input}").on_error(OnError::Retry));

    let run = engine(&invoker).run(&definition, "q").await;

    assert!(matches!(run.error, Some(Error::StepFailed { .. })));
    assert_eq!(invoker.call_count("flaky"), 3);
}

#[tokio::test]
async fn test_reference_to_later_step_is_unresolved() {
    let invoker = MockInvoker::new().with("worker", Behavior::Echo).shared();
    let definition = WorkflowDefinition::new("forward", "Forward ref", "early")
        .with_step(Step::agent("early", "worker", "${steps.late.output}"))
        .with_step(Step::agent("late", "worker", "${user_input}"));

    let run = engine(&invoker).run(&definition, "q").await;

    assert!(matches!(run.error, Some(Error::UnresolvedReference { .. })), "{:?}", run.error);
    assert_eq!(invoker.call_count("worker"), 0);
}

#[tokio::test]
async fn test_unknown_agent_fails_before_any_step() {
    let invoker = MockInvoker::new().with("worker", Behavior::Echo).shared();
    let definition = WorkflowDefinition::new("missing", "Missing agent", "first")
        .with_step(Step::agent("first", "worker", "${user_input}"))
        .with_step(Step::agent("second", "ghost", "${user_input}"));

    let run = engine(&invoker).run(&definition, "q").await;

    assert!(matches!(run.error, Some(Error::AgentNotFound(ref id)) if id == "ghost"));
    assert!(invoker.calls().is_empty());
    assert!(run.context.steps_executed().is_empty());
}

#[tokio::test]
async fn test_cycle_is_rejected() {
    let invoker = MockInvoker::new().with("worker", Behavior::Echo).shared();
    let definition = WorkflowDefinition::new("cycle", "Cycle", "a")
        .with_step(Step::agent("a", "worker", "1"))
        .with_step(Step::agent("b", "worker", "2").then("a"));

    let err = engine(&invoker).validate(&definition).unwrap_err();
    assert!(matches!(err, Error::Definition(_)));

    let run = engine(&invoker).run(&definition, "").await;
    assert!(!run.success());
    assert!(invoker.calls().is_empty());
}

#[tokio::test]
async fn test_loop_iteration_outside_loop_is_scope_error() {
    let invoker = MockInvoker::new().with("worker", Behavior::Echo).shared();
    let definition = WorkflowDefinition::new("scope", "Scope", "a")
        .with_step(Step::agent("a", "worker", "round ${loop_iteration}"));

    let run = engine(&invoker).run(&definition, "").await;

    assert!(matches!(run.error, Some(Error::Scope(_))), "{:?}", run.error);
    assert!(invoker.calls().is_empty());
}

#[tokio::test]
async fn test_failing_loop_body_fails_the_loop() {
    let invoker = MockInvoker::new()
        .with("worker", Behavior::Echo)
        .with("bad", Behavior::Fail("broken".into()))
        .shared();
    let definition = WorkflowDefinition::new("loop", "Broken body", "refine")
        .with_step(
            Step::looped(
                "refine",
                5,
                None,
                vec![
                    Step::agent("draft", "worker", "${loop_iteration}"),
                    Step::agent("check", "bad", "${steps.draft.output}"),
                ],
            )
            .on_error(OnError::Skip),
        )
        .with_step(Step::agent("after", "worker", "done"));

    let output = engine(&invoker).execute(&definition, "").await;

    assert!(output.success);
    let refine = &output.metadata.step_results["refine"];
    assert!(!refine.success);
    assert_eq!(refine.iterations_completed, Some(0));
    assert_eq!(output.content, "done");
}
