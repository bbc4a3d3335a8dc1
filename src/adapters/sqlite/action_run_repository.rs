//! SQLite adapter for ActionRunRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::{parse_datetime, parse_optional_datetime, parse_optional_uuid, parse_uuid};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{ActionRunStatus, ScheduledActionRun, TriggerSource};
use crate::domain::ports::ActionRunRepository;

#[derive(Clone)]
pub struct SqliteActionRunRepository {
    pool: SqlitePool,
}

impl SqliteActionRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ActionRunRow {
    id: String,
    action_id: String,
    background_task_id: Option<String>,
    run_number: i64,
    triggered_at: String,
    triggered_by: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result_summary: Option<String>,
    error: Option<String>,
    retry_count: i64,
    duration_ms: i64,
    steps_executed: i64,
}

fn row_to_run(row: ActionRunRow) -> CoreResult<ScheduledActionRun> {
    Ok(ScheduledActionRun {
        id: parse_uuid(&row.id)?,
        action_id: parse_uuid(&row.action_id)?,
        background_task_id: parse_optional_uuid(row.background_task_id)?,
        run_number: row.run_number as u64,
        triggered_at: parse_datetime(&row.triggered_at)?,
        triggered_by: TriggerSource::from_str(&row.triggered_by)
            .ok_or_else(|| CoreError::External(format!("bad trigger source in store: {}", row.triggered_by)))?,
        status: ActionRunStatus::from_str(&row.status)
            .ok_or_else(|| CoreError::External(format!("bad run status in store: {}", row.status)))?,
        started_at: parse_optional_datetime(row.started_at)?,
        completed_at: parse_optional_datetime(row.completed_at)?,
        result_summary: row.result_summary,
        error: row.error,
        retry_count: row.retry_count as u32,
        duration_ms: row.duration_ms as u64,
        steps_executed: row.steps_executed as u32,
    })
}

#[async_trait]
impl ActionRunRepository for SqliteActionRunRepository {
    async fn create(&self, run: &ScheduledActionRun) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO scheduled_action_runs
             (id, action_id, background_task_id, run_number, triggered_at, triggered_by,
              status, started_at, completed_at, result_summary, error,
              retry_count, duration_ms, steps_executed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(run.id.to_string())
        .bind(run.action_id.to_string())
        .bind(run.background_task_id.map(|u| u.to_string()))
        .bind(run.run_number as i64)
        .bind(run.triggered_at.to_rfc3339())
        .bind(run.triggered_by.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at.map(|dt| dt.to_rfc3339()))
        .bind(run.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(&run.result_summary)
        .bind(&run.error)
        .bind(i64::from(run.retry_count))
        .bind(run.duration_ms as i64)
        .bind(i64::from(run.steps_executed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, run: &ScheduledActionRun) -> CoreResult<()> {
        sqlx::query(
            "UPDATE scheduled_action_runs SET
             background_task_id = ?2, status = ?3, started_at = ?4, completed_at = ?5,
             result_summary = ?6, error = ?7, retry_count = ?8, duration_ms = ?9,
             steps_executed = ?10
             WHERE id = ?1",
        )
        .bind(run.id.to_string())
        .bind(run.background_task_id.map(|u| u.to_string()))
        .bind(run.status.as_str())
        .bind(run.started_at.map(|dt| dt.to_rfc3339()))
        .bind(run.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(&run.result_summary)
        .bind(&run.error)
        .bind(i64::from(run.retry_count))
        .bind(run.duration_ms as i64)
        .bind(i64::from(run.steps_executed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<ScheduledActionRun>> {
        let row: Option<ActionRunRow> =
            sqlx::query_as("SELECT * FROM scheduled_action_runs WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_run).transpose()
    }

    async fn list_for_action(&self, action_id: Uuid) -> CoreResult<Vec<ScheduledActionRun>> {
        let rows: Vec<ActionRunRow> = sqlx::query_as(
            "SELECT * FROM scheduled_action_runs WHERE action_id = ? ORDER BY run_number",
        )
        .bind(action_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_run).collect()
    }

    async fn count_for_action(&self, action_id: Uuid) -> CoreResult<u64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scheduled_action_runs WHERE action_id = ?")
                .bind(action_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 as u64)
    }

    async fn list_by_status(&self, status: ActionRunStatus) -> CoreResult<Vec<ScheduledActionRun>> {
        let rows: Vec<ActionRunRow> = sqlx::query_as(
            "SELECT * FROM scheduled_action_runs WHERE status = ? ORDER BY triggered_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteScheduledActionRepository};
    use crate::domain::models::{AgentId, ScheduleSpec, ScheduledAction};
    use crate::domain::ports::ScheduledActionRepository;

    #[tokio::test]
    async fn run_log_round_trip() {
        let pool = create_migrated_test_pool().await.unwrap();
        let actions = SqliteScheduledActionRepository::new(pool.clone());
        let runs = SqliteActionRunRepository::new(pool);

        let action = ScheduledAction::new(
            AgentId(1),
            "hourly",
            "do it",
            ScheduleSpec::Interval { seconds: 3600 },
        );
        actions.upsert(&action).await.unwrap();

        let mut run = ScheduledActionRun::new(action.id, 1, TriggerSource::Scheduler);
        runs.create(&run).await.unwrap();
        assert_eq!(runs.count_for_action(action.id).await.unwrap(), 1);

        run.status = ActionRunStatus::Succeeded;
        run.steps_executed = 4;
        run.result_summary = Some("done".to_string());
        runs.update(&run).await.unwrap();

        let listed = runs.list_for_action(action.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ActionRunStatus::Succeeded);
        assert_eq!(listed[0].steps_executed, 4);
        assert_eq!(listed[0].triggered_by, TriggerSource::Scheduler);
    }
}
