//! End-to-end circle tests: event flows across the bus, review
//! round-trips, and conversations driven through circle agents.

mod common;

use std::sync::Arc;

use gathering::domain::errors::CoreError;
use gathering::domain::models::{
    AgentCallbacks, AgentHandle, AgentId, Artifact, ConversationStatus, EventKind, ReviewDecision,
    TaskStatus, TurnStrategy,
};
use gathering::services::CircleConfig;

use common::test_context;

fn coder(id: u64, name: &str) -> AgentHandle {
    AgentHandle::new(AgentId(id), name)
        .with_provider("anthropic", "claude-3-opus")
        .with_competencies(["python", "architecture"])
        .with_can_review(["code"])
}

fn responder(reply: &str) -> AgentCallbacks {
    let reply = reply.to_string();
    AgentCallbacks {
        process_message: Some(Arc::new(move |_prompt| {
            let reply = reply.clone();
            Box::pin(async move { Some(reply) })
        })),
        ..AgentCallbacks::default()
    }
}

#[tokio::test]
async fn full_review_cycle_emits_the_expected_events() {
    let ctx = test_context().await;
    let circle = ctx
        .create_circle("research", CircleConfig { auto_route: false, ..CircleConfig::default() })
        .await
        .unwrap();
    circle.add_agent(coder(1, "Claude")).await.unwrap();
    circle.add_agent(coder(2, "DeepSeek")).await.unwrap();
    circle.start().await.unwrap();

    let task_id = circle
        .create_task("Implement auth", "JWT auth for the API", vec!["python".into()], 4)
        .await
        .unwrap();
    assert!(circle.claim_task(task_id, AgentId(1)).await.unwrap());
    circle
        .submit_task(task_id, AgentId(1), "implemented", vec![Artifact::code("src/auth.py")])
        .await
        .unwrap();
    circle
        .submit_review(task_id, AgentId(2), ReviewDecision::Approved, Some(88), None, vec![])
        .await
        .unwrap();

    assert_eq!(circle.task(task_id).await.unwrap().status, TaskStatus::Completed);

    let kinds: Vec<EventKind> = ctx.bus.history(None, None).iter().map(|e| e.kind).collect();
    let expected = [
        EventKind::CircleStarted,
        EventKind::TaskCreated,
        EventKind::TaskClaimed,
        EventKind::TaskSubmitted,
        EventKind::ReviewRequested,
        EventKind::ReviewCompleted,
        EventKind::TaskCompleted,
    ];
    let mut cursor = 0;
    for kind in kinds {
        if cursor < expected.len() && kind == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, expected.len(), "event sequence incomplete");

    // Topic tags carry the circle and agent hierarchy.
    let claimed = &ctx.bus.history(Some(EventKind::TaskClaimed), None)[0];
    assert!(claimed.topics.contains(&"circles:research".to_string()));
    assert!(claimed.topics.contains(&"agents:1".to_string()));
}

#[tokio::test]
async fn reviewer_callback_reviews_inline() {
    let ctx = test_context().await;
    let circle = ctx
        .create_circle("auto-review", CircleConfig { auto_route: false, ..CircleConfig::default() })
        .await
        .unwrap();

    circle.add_agent(coder(1, "Author")).await.unwrap();
    let mut reviewer = coder(2, "Reviewer");
    reviewer.callbacks.review_work = Some(Arc::new(|_task| {
        Box::pin(async { (ReviewDecision::Approved, Some("looks right".to_string())) })
    }));
    circle.add_agent(reviewer).await.unwrap();
    circle.start().await.unwrap();

    let task_id = circle
        .create_task("t", "d", vec!["python".into()], 3)
        .await
        .unwrap();
    circle.claim_task(task_id, AgentId(1)).await.unwrap();
    circle
        .submit_task(task_id, AgentId(1), "done", vec![Artifact::code("f.py")])
        .await
        .unwrap();

    let task = circle.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.review_history.len(), 1);
    assert_eq!(task.review_history[0].feedback.as_deref(), Some("looks right"));
}

#[tokio::test]
async fn collaborate_runs_to_the_completion_marker() {
    let ctx = test_context().await;
    let circle = ctx
        .create_circle("bdd", CircleConfig { auto_route: false, ..CircleConfig::default() })
        .await
        .unwrap();

    circle
        .add_agent(
            coder(1, "Sonnet").with_callbacks(responder("I'll write the first scenario")),
        )
        .await
        .unwrap();
    circle
        .add_agent(
            coder(2, "DeepSeek").with_callbacks(responder("[TERMINÉ] I'll add validation")),
        )
        .await
        .unwrap();
    circle.start().await.unwrap();

    let result = circle
        .collaborate(
            "Écrire les scénarios BDD",
            vec![AgentId(1), AgentId(2)],
            10,
            TurnStrategy::RoundRobin,
            None,
            Some("Focus on authentication features.".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ConversationStatus::Completed);
    assert_eq!(result.turns_taken, 2);
    let speakers: Vec<u64> = result.messages.iter().map(|m| m.agent_id.0).collect();
    assert_eq!(speakers, vec![1, 2]);

    assert!(!ctx.bus.history(Some(EventKind::ConversationStarted), None).is_empty());
    assert!(!ctx.bus.history(Some(EventKind::ConversationCompleted), None).is_empty());

    let summary = circle.circle_status().await;
    assert_eq!(summary.conversations, 1);
}

#[tokio::test]
async fn collaborate_with_unknown_agent_fails() {
    let ctx = test_context().await;
    let circle = ctx.create_circle("solo", CircleConfig::default()).await.unwrap();
    circle.add_agent(coder(1, "A").with_callbacks(responder("hi"))).await.unwrap();
    circle.start().await.unwrap();

    let err = circle
        .collaborate("t", vec![AgentId(1), AgentId(999)], 4, TurnStrategy::RoundRobin, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn inactive_agents_stop_receiving_routes() {
    let ctx = test_context().await;
    let circle = ctx.create_circle("shrinking", ctx.circle_config()).await.unwrap();
    circle.add_agent(coder(1, "Gone")).await.unwrap();
    circle.add_agent(coder(2, "Here")).await.unwrap();
    circle.start().await.unwrap();

    circle.remove_agent(AgentId(1)).await.unwrap();
    assert!(!circle.agent(AgentId(1)).await.unwrap().is_active);

    let task_id = circle
        .create_task("t", "d", vec!["python".into()], 3)
        .await
        .unwrap();
    let task = circle.task(task_id).await.unwrap();
    assert_eq!(task.assigned_agent_id, Some(AgentId(2)));
}

#[tokio::test]
async fn subscriptions_by_topic_see_only_their_slice() {
    let ctx = test_context().await;
    let circle = ctx
        .create_circle("topical", CircleConfig { auto_route: false, ..CircleConfig::default() })
        .await
        .unwrap();
    circle.add_agent(coder(1, "Claude")).await.unwrap();
    circle.add_agent(coder(2, "DeepSeek")).await.unwrap();
    circle.start().await.unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    ctx.bus.subscribe_filtered(
        None,
        Some("agents:2".to_string()),
        gathering::services::sink(move |event| {
            let seen = seen_in.clone();
            async move {
                seen.lock().unwrap().push(event.kind);
            }
        }),
    );

    let task_id = circle
        .create_task("t", "d", vec!["python".into()], 3)
        .await
        .unwrap();
    circle.claim_task(task_id, AgentId(1)).await.unwrap();
    circle.claim_task(task_id, AgentId(2)).await.unwrap_err();
    circle.send_message(AgentId(2), "present", None).await.unwrap();

    let seen = seen.lock().unwrap();
    // Only agent 2's message traffic landed here, not agent 1's claim.
    assert!(seen.contains(&EventKind::Message));
    assert!(!seen.contains(&EventKind::TaskClaimed));
}
