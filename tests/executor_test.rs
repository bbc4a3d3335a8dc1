//! Integration tests for the background executor: goal loops,
//! pause/resume, cancellation, crash recovery, and shutdown draining.

mod common;

use std::time::Duration;

use gathering::domain::errors::CoreError;
use gathering::domain::models::{
    AgentId, BackgroundTask, BackgroundTaskStatus, EventKind, StepAction,
};
use gathering::domain::ports::{BackgroundTaskRepository, TaskStepRepository};

use common::{
    test_context, test_context_with_skills, wait_for, FlakyDispatcher, GatedDriver, ScriptedDriver,
};

#[tokio::test]
async fn goal_loop_runs_to_completion() {
    let ctx = test_context().await;
    let driver = ScriptedDriver::new(vec![
        Ok(StepAction::Emit { message: "thinking".to_string() }),
        Ok(StepAction::ToolCall { tool: "search".to_string(), input: serde_json::json!({"q": "x"}) }),
        Ok(StepAction::Complete { result: "all done".to_string() }),
    ]);
    ctx.executor.register_driver(AgentId(1), driver).await;

    let task = BackgroundTask::new(AgentId(1), "finish the thing")
        .with_max_steps(10)
        .with_checkpoint_interval(2);
    let task_id = ctx.executor.start_task(task).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || async {
            ctx.executor
                .task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status.is_terminal())
        })
        .await
    );

    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("all done"));
    assert_eq!(task.current_step, 3);

    let steps = ctx.task_steps.list_for_task(task_id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].action, "message");
    assert_eq!(steps[1].action, "tool_call");
    assert_eq!(steps[1].tool.as_deref(), Some("search"));
    assert!(steps[1].success);
    assert_eq!(steps[2].action, "complete");
    // Steps link back to their predecessors.
    assert_eq!(steps[1].prior_step_id, Some(steps[0].id));

    // The tool-call boundary wrote a checkpoint.
    assert!(task.last_checkpoint_at.is_some());
    assert!(!ctx.bus.history(Some(EventKind::CheckpointWritten), None).is_empty());
    assert_eq!(ctx.bus.history(Some(EventKind::TaskStep), None).len(), 3);
}

#[tokio::test]
async fn step_budget_exhaustion_fails_and_escalates() {
    let ctx = test_context().await;
    // Never completes on its own.
    let driver = ScriptedDriver::new(vec![]);
    ctx.executor.register_driver(AgentId(1), driver).await;

    let task = BackgroundTask::new(AgentId(1), "forever").with_max_steps(3);
    let task_id = ctx.executor.start_task(task).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || async {
            ctx.executor
                .task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status.is_terminal())
        })
        .await
    );

    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Failed);
    assert_eq!(task.current_step, 3);
    assert!(task.error.unwrap().contains("step budget"));
    assert!(!ctx.bus.history(Some(EventKind::Escalation), None).is_empty());
}

#[tokio::test]
async fn wall_clock_deadline_times_out() {
    let ctx = test_context().await;
    let (driver, _gate) = GatedDriver::new();
    ctx.executor.register_driver(AgentId(1), driver).await;

    let task = BackgroundTask::new(AgentId(1), "slow").with_timeout(0);
    let task_id = ctx.executor.start_task(task).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || async {
            ctx.executor
                .task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status == BackgroundTaskStatus::Timeout)
        })
        .await
    );
}

#[tokio::test]
async fn single_step_failure_retries_in_place() {
    let ctx = test_context().await;
    ctx.executor
        .register_driver(AgentId(1), ScriptedDriver::failing_n_then_complete(1, "ok"))
        .await;

    let task = BackgroundTask::new(AgentId(1), "flaky once");
    let task_id = ctx.executor.start_task(task).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || async {
            ctx.executor
                .task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status.is_terminal())
        })
        .await
    );
    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Completed);
}

#[tokio::test]
async fn failed_tool_dispatch_retries_in_place() {
    let ctx = test_context_with_skills(FlakyDispatcher::new(1)).await;
    // The retried iteration asks the driver again, so the tool call
    // appears twice in the script.
    let tool_call = || {
        Ok(StepAction::ToolCall {
            tool: "search".to_string(),
            input: serde_json::json!({"q": "x"}),
        })
    };
    ctx.executor
        .register_driver(
            AgentId(1),
            ScriptedDriver::new(vec![
                tool_call(),
                tool_call(),
                Ok(StepAction::Complete { result: "ok".to_string() }),
            ]),
        )
        .await;

    let task = BackgroundTask::new(AgentId(1), "flaky tool");
    let task_id = ctx.executor.start_task(task).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || async {
            ctx.executor
                .task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status.is_terminal())
        })
        .await
    );

    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Completed);
    // The failed dispatch left no trace: the retried tool call is still
    // step 1, and only successful steps were recorded.
    assert_eq!(task.current_step, 2);
    let steps = ctx.task_steps.list_for_task(task_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_number, 1);
    assert_eq!(steps[0].action, "tool_call");
    assert!(steps[0].success);
    assert_eq!(steps[0].output["echo"]["q"], "x");
    assert_eq!(steps[1].action, "complete");
}

#[tokio::test]
async fn tool_dispatch_failing_twice_fails_the_task() {
    let ctx = test_context_with_skills(FlakyDispatcher::new(usize::MAX)).await;
    let tool_call = || {
        Ok(StepAction::ToolCall {
            tool: "search".to_string(),
            input: serde_json::json!({"q": "x"}),
        })
    };
    ctx.executor
        .register_driver(AgentId(1), ScriptedDriver::new(vec![tool_call(), tool_call()]))
        .await;

    let task = BackgroundTask::new(AgentId(1), "dead tool");
    let task_id = ctx.executor.start_task(task).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || async {
            ctx.executor
                .task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status.is_terminal())
        })
        .await
    );

    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Failed);
    assert!(task.error.unwrap().contains("tool call failed twice"));
    // Neither attempt advanced the loop or recorded a step.
    assert_eq!(task.current_step, 0);
    assert!(ctx.task_steps.list_for_task(task_id).await.unwrap().is_empty());
    assert!(!ctx.bus.history(Some(EventKind::Escalation), None).is_empty());
}

#[tokio::test]
async fn two_consecutive_failures_fail_the_task() {
    let ctx = test_context().await;
    ctx.executor
        .register_driver(AgentId(1), ScriptedDriver::failing_n_then_complete(2, "never"))
        .await;

    let task = BackgroundTask::new(AgentId(1), "flaky twice");
    let task_id = ctx.executor.start_task(task).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || async {
            ctx.executor
                .task(task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status.is_terminal())
        })
        .await
    );
    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Failed);
    assert!(task.error.unwrap().contains("twice"));
    assert!(!ctx.bus.history(Some(EventKind::Escalation), None).is_empty());
}

#[tokio::test]
async fn pause_resume_preserves_progress() {
    let ctx = test_context().await;
    let (driver, gate) = GatedDriver::new();
    ctx.executor.register_driver(AgentId(1), driver).await;

    let task = BackgroundTask::new(AgentId(1), "gated")
        .with_max_steps(100)
        .with_checkpoint_interval(1);
    let task_id = ctx.executor.start_task(task).await.unwrap();

    // Allow exactly two steps.
    gate.add_permits(2);
    assert!(
        wait_for(Duration::from_secs(5), || async {
            ctx.executor.task(task_id).await.unwrap().is_some_and(|t| t.current_step == 2)
        })
        .await
    );

    ctx.executor.pause_task(task_id).await.unwrap();
    // The in-flight step finishes, then the runner yields at the
    // boundary.
    gate.add_permits(1);
    assert!(
        wait_for(Duration::from_secs(5), || async { !ctx.executor.has_live_runner(task_id).await })
            .await
    );

    let paused = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(paused.status, BackgroundTaskStatus::Paused);
    assert_eq!(paused.current_step, 3);
    let checkpoint = paused.checkpoint.clone().expect("checkpoint");
    assert_eq!(checkpoint.step, 3);

    // Pause is re-entrant safe.
    ctx.executor.pause_task(task_id).await.unwrap();

    ctx.executor.resume_task(task_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // No permits granted since the resume: the step counter and
    // checkpoint are exactly as they were.
    let resumed = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(resumed.status, BackgroundTaskStatus::Running);
    assert_eq!(resumed.current_step, 3);
    assert_eq!(resumed.checkpoint.unwrap().step, checkpoint.step);
    assert!(ctx.executor.has_live_runner(task_id).await);
}

#[tokio::test]
async fn cancel_terminates_at_the_next_boundary() {
    let ctx = test_context().await;
    let (driver, gate) = GatedDriver::new();
    ctx.executor.register_driver(AgentId(1), driver).await;

    let task = BackgroundTask::new(AgentId(1), "to cancel");
    let task_id = ctx.executor.start_task(task).await.unwrap();

    ctx.executor.cancel_task(task_id, Some("operator said so")).await.unwrap();
    gate.add_permits(8);

    assert!(
        wait_for(Duration::from_secs(5), || async { !ctx.executor.has_live_runner(task_id).await })
            .await
    );
    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Cancelled);
    assert_eq!(task.error.as_deref(), Some("operator said so"));

    // Cancelling a terminal task is an invalid state.
    let err = ctx.executor.cancel_task(task_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));
}

#[tokio::test]
async fn recovery_parks_orphaned_running_tasks() {
    let ctx = test_context().await;

    // A task durably `running` with no live runner, as after a crash.
    let mut orphan = BackgroundTask::new(AgentId(1), "orphan");
    orphan.status = BackgroundTaskStatus::Running;
    orphan.started_at = Some(chrono::Utc::now());
    orphan.current_step = 7;
    ctx.background_tasks.create(&orphan).await.unwrap();

    let recovered = ctx.executor.recover_tasks().await.unwrap();
    assert_eq!(recovered, 1);

    let parked = ctx.executor.task(orphan.id).await.unwrap().unwrap();
    assert_eq!(parked.status, BackgroundTaskStatus::Paused);
    assert!(parked.error.unwrap().contains("recovered"));

    // Nothing left to recover on a second pass.
    assert_eq!(ctx.executor.recover_tasks().await.unwrap(), 0);

    // Explicit resume restarts from where it left off.
    let (driver, _gate) = GatedDriver::new();
    ctx.executor.register_driver(AgentId(1), driver).await;
    ctx.executor.resume_task(orphan.id).await.unwrap();

    let resumed = ctx.executor.task(orphan.id).await.unwrap().unwrap();
    assert_eq!(resumed.status, BackgroundTaskStatus::Running);
    assert_eq!(resumed.current_step, 7);
}

#[tokio::test]
async fn shutdown_drains_and_refuses_new_starts() {
    let ctx = test_context().await;
    let (driver, gate) = GatedDriver::new();
    ctx.executor.register_driver(AgentId(1), driver).await;

    let task = BackgroundTask::new(AgentId(1), "draining");
    let task_id = ctx.executor.start_task(task).await.unwrap();
    gate.add_permits(1);

    ctx.executor.shutdown(Duration::from_millis(500)).await;

    let task = ctx.executor.task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, BackgroundTaskStatus::Paused);

    let err = ctx
        .executor
        .start_task(BackgroundTask::new(AgentId(1), "too late"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Capacity(_)));
}
