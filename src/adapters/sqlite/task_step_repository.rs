//! SQLite adapter for TaskStepRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::{parse_datetime, parse_optional_uuid, parse_uuid};
use crate::domain::errors::CoreResult;
use crate::domain::models::TaskStep;
use crate::domain::ports::TaskStepRepository;

#[derive(Clone)]
pub struct SqliteTaskStepRepository {
    pool: SqlitePool,
}

impl SqliteTaskStepRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TaskStepRow {
    id: String,
    task_id: String,
    step_number: i64,
    action: String,
    tool: Option<String>,
    input: String,
    output: String,
    success: i64,
    tokens_in: i64,
    tokens_out: i64,
    duration_ms: i64,
    prior_step_id: Option<String>,
    created_at: String,
}

fn row_to_step(row: TaskStepRow) -> CoreResult<TaskStep> {
    Ok(TaskStep {
        id: parse_uuid(&row.id)?,
        task_id: parse_uuid(&row.task_id)?,
        step_number: row.step_number as u32,
        action: row.action,
        tool: row.tool,
        input: serde_json::from_str(&row.input).unwrap_or(serde_json::Value::Null),
        output: serde_json::from_str(&row.output).unwrap_or(serde_json::Value::Null),
        success: row.success != 0,
        tokens_in: row.tokens_in as u64,
        tokens_out: row.tokens_out as u64,
        duration_ms: row.duration_ms as u64,
        prior_step_id: parse_optional_uuid(row.prior_step_id)?,
        created_at: parse_datetime(&row.created_at)?,
    })
}

#[async_trait]
impl TaskStepRepository for SqliteTaskStepRepository {
    async fn create(&self, step: &TaskStep) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO task_steps
             (id, task_id, step_number, action, tool, input, output, success,
              tokens_in, tokens_out, duration_ms, prior_step_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(step.id.to_string())
        .bind(step.task_id.to_string())
        .bind(i64::from(step.step_number))
        .bind(&step.action)
        .bind(&step.tool)
        .bind(serde_json::to_string(&step.input)?)
        .bind(serde_json::to_string(&step.output)?)
        .bind(i64::from(step.success))
        .bind(step.tokens_in as i64)
        .bind(step.tokens_out as i64)
        .bind(step.duration_ms as i64)
        .bind(step.prior_step_id.map(|u| u.to_string()))
        .bind(step.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_task(&self, task_id: Uuid) -> CoreResult<Vec<TaskStep>> {
        let rows: Vec<TaskStepRow> = sqlx::query_as(
            "SELECT * FROM task_steps WHERE task_id = ? ORDER BY step_number",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_step).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteBackgroundTaskRepository};
    use crate::domain::models::{AgentId, BackgroundTask, StepAction};
    use crate::domain::ports::BackgroundTaskRepository;

    #[tokio::test]
    async fn steps_list_in_order() {
        let pool = create_migrated_test_pool().await.unwrap();
        let tasks = SqliteBackgroundTaskRepository::new(pool.clone());
        let steps = SqliteTaskStepRepository::new(pool);

        let task = BackgroundTask::new(AgentId(1), "goal");
        tasks.create(&task).await.unwrap();

        for number in 1..=3 {
            let action = StepAction::Emit { message: format!("step {number}") };
            let step = TaskStep::new(task.id, number, &action);
            steps.create(&step).await.unwrap();
        }

        let listed = steps.list_for_task(task.id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].step_number, 1);
        assert_eq!(listed[2].step_number, 3);
        assert_eq!(listed[1].action, "message");
    }
}
