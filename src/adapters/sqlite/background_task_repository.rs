//! SQLite adapter for BackgroundTaskRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::{parse_datetime, parse_optional_datetime, parse_uuid};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{AgentId, BackgroundTask, BackgroundTaskStatus, Checkpoint};
use crate::domain::ports::BackgroundTaskRepository;

#[derive(Clone)]
pub struct SqliteBackgroundTaskRepository {
    pool: SqlitePool,
}

impl SqliteBackgroundTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BackgroundTaskRow {
    id: String,
    agent_id: i64,
    goal: String,
    goal_context: String,
    current_step: i64,
    max_steps: i64,
    checkpoint_interval: i64,
    timeout_seconds: i64,
    status: String,
    result: Option<String>,
    error: Option<String>,
    checkpoint: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    last_checkpoint_at: Option<String>,
}

fn row_to_task(row: BackgroundTaskRow) -> CoreResult<BackgroundTask> {
    let checkpoint: Option<Checkpoint> = row
        .checkpoint
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| CoreError::External(format!("bad checkpoint in store: {e}")))?;

    Ok(BackgroundTask {
        id: parse_uuid(&row.id)?,
        agent_id: AgentId(row.agent_id as u64),
        goal: row.goal,
        goal_context: serde_json::from_str(&row.goal_context).unwrap_or(serde_json::Value::Null),
        current_step: row.current_step as u32,
        max_steps: row.max_steps as u32,
        checkpoint_interval: row.checkpoint_interval as u32,
        timeout_seconds: row.timeout_seconds as u64,
        status: BackgroundTaskStatus::from_str(&row.status)
            .ok_or_else(|| CoreError::External(format!("bad task status in store: {}", row.status)))?,
        result: row.result,
        error: row.error,
        checkpoint,
        created_at: parse_datetime(&row.created_at)?,
        started_at: parse_optional_datetime(row.started_at)?,
        completed_at: parse_optional_datetime(row.completed_at)?,
        last_checkpoint_at: parse_optional_datetime(row.last_checkpoint_at)?,
    })
}

#[async_trait]
impl BackgroundTaskRepository for SqliteBackgroundTaskRepository {
    async fn create(&self, task: &BackgroundTask) -> CoreResult<()> {
        let checkpoint = task.checkpoint.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO background_tasks
             (id, agent_id, goal, goal_context, current_step, max_steps,
              checkpoint_interval, timeout_seconds, status, result, error, checkpoint,
              created_at, started_at, completed_at, last_checkpoint_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(task.id.to_string())
        .bind(task.agent_id.0 as i64)
        .bind(&task.goal)
        .bind(serde_json::to_string(&task.goal_context)?)
        .bind(i64::from(task.current_step))
        .bind(i64::from(task.max_steps))
        .bind(i64::from(task.checkpoint_interval))
        .bind(task.timeout_seconds as i64)
        .bind(task.status.as_str())
        .bind(&task.result)
        .bind(&task.error)
        .bind(&checkpoint)
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|dt| dt.to_rfc3339()))
        .bind(task.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(task.last_checkpoint_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<BackgroundTask>> {
        let row: Option<BackgroundTaskRow> =
            sqlx::query_as("SELECT * FROM background_tasks WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_task).transpose()
    }

    async fn update(&self, task: &BackgroundTask) -> CoreResult<()> {
        let checkpoint = task.checkpoint.as_ref().map(serde_json::to_string).transpose()?;
        // `status` is deliberately absent: transitions go through
        // compare_and_set_status so a concurrent pause/cancel is never
        // overwritten by a stale snapshot.
        sqlx::query(
            "UPDATE background_tasks SET
             goal = ?2, goal_context = ?3, current_step = ?4, max_steps = ?5,
             checkpoint_interval = ?6, timeout_seconds = ?7,
             result = ?8, error = ?9, checkpoint = ?10,
             started_at = ?11, completed_at = ?12, last_checkpoint_at = ?13
             WHERE id = ?1",
        )
        .bind(task.id.to_string())
        .bind(&task.goal)
        .bind(serde_json::to_string(&task.goal_context)?)
        .bind(i64::from(task.current_step))
        .bind(i64::from(task.max_steps))
        .bind(i64::from(task.checkpoint_interval))
        .bind(task.timeout_seconds as i64)
        .bind(&task.result)
        .bind(&task.error)
        .bind(&checkpoint)
        .bind(task.started_at.map(|dt| dt.to_rfc3339()))
        .bind(task.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(task.last_checkpoint_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM background_tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: BackgroundTaskStatus,
        next: BackgroundTaskStatus,
    ) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE background_tasks SET status = ?3 WHERE id = ?1 AND status = ?2",
        )
        .bind(id.to_string())
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_by_status(
        &self,
        status: BackgroundTaskStatus,
    ) -> CoreResult<Vec<BackgroundTask>> {
        let rows: Vec<BackgroundTaskRow> = sqlx::query_as(
            "SELECT * FROM background_tasks WHERE status = ? ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn list_running(&self) -> CoreResult<Vec<BackgroundTask>> {
        self.list_by_status(BackgroundTaskStatus::Running).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn repo() -> SqliteBackgroundTaskRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteBackgroundTaskRepository::new(pool)
    }

    #[tokio::test]
    async fn round_trips_a_task() {
        let repo = repo().await;
        let task = BackgroundTask::new(AgentId(7), "summarize the day")
            .with_context(serde_json::json!({"notes": ["a", "b"]}))
            .with_max_steps(10)
            .with_timeout(120);
        repo.create(&task).await.unwrap();

        let loaded = repo.get(task.id).await.unwrap().expect("task");
        assert_eq!(loaded.goal, "summarize the day");
        assert_eq!(loaded.agent_id, AgentId(7));
        assert_eq!(loaded.max_steps, 10);
        assert_eq!(loaded.status, BackgroundTaskStatus::Pending);
        assert_eq!(loaded.goal_context["notes"][0], "a");
    }

    #[tokio::test]
    async fn cas_transitions_are_atomic() {
        let repo = repo().await;
        let task = BackgroundTask::new(AgentId(1), "goal");
        repo.create(&task).await.unwrap();

        assert!(repo
            .compare_and_set_status(task.id, BackgroundTaskStatus::Pending, BackgroundTaskStatus::Running)
            .await
            .unwrap());
        // Stale transition attempt fails.
        assert!(!repo
            .compare_and_set_status(task.id, BackgroundTaskStatus::Pending, BackgroundTaskStatus::Running)
            .await
            .unwrap());

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BackgroundTaskStatus::Running);
    }

    #[tokio::test]
    async fn lists_running_tasks() {
        let repo = repo().await;
        let mut a = BackgroundTask::new(AgentId(1), "a");
        a.status = BackgroundTaskStatus::Running;
        let b = BackgroundTask::new(AgentId(1), "b");
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        let running = repo.list_running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].goal, "a");
    }
}
