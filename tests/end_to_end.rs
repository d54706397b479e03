use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use agentflow_core::config::{EngineConfig, StreamConfig};
use agentflow_core::traits::{Catalog, ExecutionStore};
use agentflow_core::types::{Execution, ExecutionStatus, ExecutionTarget};
use agentflow_core::workflow::{Condition, ConditionOperator, StepConfig, Workflow};
use agentflow_engine::Engine;
use agentflow_gateway::{StreamEvent, SubscriberRegistry};
use agentflow_store::SqliteStore;
use agentflow_test_utils::{fixtures, ScriptedAgent};

/// research -> fan(analyze, critic) -> gate -> [escalate ->] summarize
fn triage() -> Workflow {
    let mut workflow = Workflow::new(
        "triage",
        "Triage",
        vec![
            StepConfig::single_agent("research", "research")
                .with_input("query", "query")
                .with_capture(vec!["research_results".into()]),
            StepConfig::parallel("fan", vec!["analyze".into(), "critic".into()]),
            StepConfig::conditional(
                "gate",
                Condition {
                    field: "research_results".into(),
                    operator: ConditionOperator::Contains,
                    value: json!("urgent"),
                },
                "escalate",
                "summarize",
            ),
            StepConfig::single_agent("escalate", "escalate")
                .with_input("findings", "research_results")
                .with_capture(vec!["escalation".into()]),
            StepConfig::single_agent("summarize", "summarize")
                .with_input("reviews", "parallel_results")
                .with_capture(vec!["final_summary".into()]),
        ],
    );
    workflow.output_key = Some("final_summary".into());
    workflow
}

async fn open(dir: &tempfile::TempDir) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open(&dir.path().join("agentflow.db")).unwrap());
    let ids = ["research", "analyze", "critic", "escalate", "summarize"];
    for (_, agent) in fixtures::agents(&ids) {
        store.upsert_agent(&agent).await.unwrap();
    }
    store.upsert_workflow(&triage()).await.unwrap();
    store
}

fn registry(store: Arc<SqliteStore>) -> Arc<SubscriberRegistry> {
    Arc::new(SubscriberRegistry::new(
        &StreamConfig {
            poll_interval_ms: 20,
        },
        store,
    ))
}

fn start(
    store: Arc<SqliteStore>,
    registry: Arc<SubscriberRegistry>,
    agent: Arc<ScriptedAgent>,
) -> Engine {
    Engine::start(
        &EngineConfig::default(),
        store.clone(),
        store,
        agent,
        Some(registry),
        CancellationToken::new(),
    )
}

async fn collect(registry: &Arc<SubscriberRegistry>, execution: &Execution) -> Vec<StreamEvent> {
    let mut rx = registry.subscribe(execution.id);
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
    })
    .await
    .expect("stream did not finish");
    events
}

fn completion(events: &[StreamEvent]) -> (ExecutionStatus, serde_json::Value) {
    match events.last() {
        Some(StreamEvent::ExecutionComplete { data }) => {
            (data.status, data.output_data.clone().unwrap_or_default())
        }
        other => panic!("stream did not end with completion: {:?}", other),
    }
}

#[tokio::test]
async fn test_quiet_path_skips_escalation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let registry = registry(store.clone());
    let agent = Arc::new(
        ScriptedAgent::new()
            .respond("research", "all quiet")
            .respond_after("analyze", "looks fine", Duration::from_millis(30))
            .respond("critic", "no objections"),
    );
    let engine = start(store.clone(), registry.clone(), agent.clone());

    let execution = engine
        .lifecycle()
        .submit(ExecutionTarget::Workflow("triage".into()), json!({"query": "status"}), "alice")
        .await
        .unwrap();
    let events = collect(&registry, &execution).await;

    let (status, output) = completion(&events);
    assert_eq!(status, ExecutionStatus::Success);
    assert_eq!(output["output"], "summarize-result");
    assert_eq!(output["messages"].as_array().unwrap().len(), 2);

    let calls = agent.calls();
    assert!(!calls.contains(&"escalate".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("summarize"));
    assert_eq!(
        agent.inputs_for("summarize"),
        vec![json!({"reviews": ["looks fine", "no objections"]})]
    );

    let logs: Vec<(i64, u32)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Log { data } => Some((data.seq, data.step_number)),
            _ => None,
        })
        .collect();
    // step_started for research, fan, gate, summarize plus a pair per agent call
    assert_eq!(logs.len(), 12);
    assert_eq!(logs[0].1, 1);
    assert!(logs.windows(2).all(|w| w[0].0 < w[1].0));
    // steps never go backwards, even across the parallel reviewers
    assert!(logs.windows(2).all(|w| w[0].1 <= w[1].1), "steps: {:?}", logs);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_urgent_path_escalates_then_summarizes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let registry = registry(store.clone());
    let agent = Arc::new(ScriptedAgent::new().respond("research", "urgent: outage in eu-west"));
    let engine = start(store.clone(), registry.clone(), agent.clone());

    let execution = engine
        .lifecycle()
        .submit(ExecutionTarget::Workflow("triage".into()), json!({"query": "status"}), "alice")
        .await
        .unwrap();
    let (status, _) = completion(&collect(&registry, &execution).await);
    assert_eq!(status, ExecutionStatus::Success);

    assert_eq!(
        agent.inputs_for("escalate"),
        vec![json!({"findings": "urgent: outage in eu-west"})]
    );
    let calls = agent.calls();
    let escalate = calls.iter().position(|c| c == "escalate").unwrap();
    let summarize = calls.iter().position(|c| c == "summarize").unwrap();
    assert!(escalate < summarize);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_parallel_failure_is_reported_to_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir).await;
    let registry = registry(store.clone());
    let agent = Arc::new(
        ScriptedAgent::new()
            .respond_after("analyze", "slow", Duration::from_secs(30))
            .fail("critic", "critic crashed"),
    );
    let engine = start(store.clone(), registry.clone(), agent.clone());

    let execution = engine
        .lifecycle()
        .submit(ExecutionTarget::Workflow("triage".into()), json!({"query": "status"}), "alice")
        .await
        .unwrap();
    let events = collect(&registry, &execution).await;

    let (status, output) = completion(&events);
    assert_eq!(status, ExecutionStatus::Failed);
    assert_eq!(output["output"]["research_results"], "research-result");
    assert!(!agent.finished().contains(&"analyze".to_string()));

    let stored = store.get_execution(&execution.id).await.unwrap().unwrap();
    assert!(stored.error_message.unwrap().contains("critic crashed"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_restart_recovers_pending_work() {
    let dir = tempfile::tempdir().unwrap();
    let pending = {
        let store = open(&dir).await;
        let execution = Execution::pending(
            ExecutionTarget::Workflow("triage".into()),
            json!({"query": "queued before restart"}),
            "alice",
        );
        store.insert_execution(&execution).await.unwrap();
        execution
    };

    let store = open(&dir).await;
    let registry = registry(store.clone());
    let engine = start(store.clone(), registry.clone(), Arc::new(ScriptedAgent::new()));
    assert_eq!(engine.recover().await.unwrap(), (1, 0));

    let (status, _) = completion(&collect(&registry, &pending).await);
    assert_eq!(status, ExecutionStatus::Success);

    engine.shutdown().await;
}
