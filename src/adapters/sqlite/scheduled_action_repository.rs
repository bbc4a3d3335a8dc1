//! SQLite adapter for ScheduledActionRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::{parse_datetime, parse_optional_datetime, parse_uuid};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{AgentId, ScheduleSpec, ScheduledAction, ScheduledActionStatus};
use crate::domain::ports::ScheduledActionRepository;

#[derive(Clone)]
pub struct SqliteScheduledActionRepository {
    pool: SqlitePool,
}

impl SqliteScheduledActionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduledActionRow {
    id: String,
    agent_id: i64,
    circle_id: Option<i64>,
    name: String,
    description: Option<String>,
    goal: String,
    #[allow(dead_code)]
    schedule_type: String,
    schedule_data: String,
    next_run_at: Option<String>,
    max_steps: i64,
    timeout_seconds: i64,
    retry_on_failure: i64,
    max_retries: i64,
    retry_delay_seconds: i64,
    allow_concurrent: i64,
    start_date: Option<String>,
    end_date: Option<String>,
    max_executions: Option<i64>,
    execution_count: i64,
    last_run_at: Option<String>,
    last_run_status: Option<String>,
    status: String,
    tags: String,
    created_at: String,
    updated_at: String,
}

fn row_to_action(row: ScheduledActionRow) -> CoreResult<ScheduledAction> {
    let schedule: ScheduleSpec = serde_json::from_str(&row.schedule_data)
        .map_err(|e| CoreError::External(format!("bad schedule_data in store: {e}")))?;

    Ok(ScheduledAction {
        id: parse_uuid(&row.id)?,
        agent_id: AgentId(row.agent_id as u64),
        circle_id: row.circle_id.map(|id| id as u64),
        name: row.name,
        description: row.description,
        goal: row.goal,
        schedule,
        next_run_at: parse_optional_datetime(row.next_run_at)?,
        max_steps: row.max_steps as u32,
        timeout_seconds: row.timeout_seconds as u64,
        retry_on_failure: row.retry_on_failure != 0,
        max_retries: row.max_retries as u32,
        retry_delay_seconds: row.retry_delay_seconds as u64,
        allow_concurrent: row.allow_concurrent != 0,
        start_date: parse_optional_datetime(row.start_date)?,
        end_date: parse_optional_datetime(row.end_date)?,
        max_executions: row.max_executions.map(|n| n as u64),
        execution_count: row.execution_count as u64,
        last_run_at: parse_optional_datetime(row.last_run_at)?,
        last_run_status: row.last_run_status,
        status: ScheduledActionStatus::from_str(&row.status)
            .ok_or_else(|| CoreError::External(format!("bad action status in store: {}", row.status)))?,
        tags: serde_json::from_str(&row.tags).unwrap_or_default(),
        created_at: parse_datetime(&row.created_at)?,
        updated_at: parse_datetime(&row.updated_at)?,
    })
}

#[async_trait]
impl ScheduledActionRepository for SqliteScheduledActionRepository {
    async fn upsert(&self, action: &ScheduledAction) -> CoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO scheduled_actions
             (id, agent_id, circle_id, name, description, goal,
              schedule_type, schedule_data, next_run_at,
              max_steps, timeout_seconds, retry_on_failure, max_retries,
              retry_delay_seconds, allow_concurrent, start_date, end_date,
              max_executions, execution_count, last_run_at, last_run_status,
              status, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        )
        .bind(action.id.to_string())
        .bind(action.agent_id.0 as i64)
        .bind(action.circle_id.map(|id| id as i64))
        .bind(&action.name)
        .bind(&action.description)
        .bind(&action.goal)
        .bind(action.schedule.schedule_type())
        .bind(serde_json::to_string(&action.schedule)?)
        .bind(action.next_run_at.map(|dt| dt.to_rfc3339()))
        .bind(i64::from(action.max_steps))
        .bind(action.timeout_seconds as i64)
        .bind(i64::from(action.retry_on_failure))
        .bind(i64::from(action.max_retries))
        .bind(action.retry_delay_seconds as i64)
        .bind(i64::from(action.allow_concurrent))
        .bind(action.start_date.map(|dt| dt.to_rfc3339()))
        .bind(action.end_date.map(|dt| dt.to_rfc3339()))
        .bind(action.max_executions.map(|n| n as i64))
        .bind(action.execution_count as i64)
        .bind(action.last_run_at.map(|dt| dt.to_rfc3339()))
        .bind(&action.last_run_status)
        .bind(action.status.as_str())
        .bind(serde_json::to_string(&action.tags)?)
        .bind(action.created_at.to_rfc3339())
        .bind(action.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<ScheduledAction>> {
        let row: Option<ScheduledActionRow> =
            sqlx::query_as("SELECT * FROM scheduled_actions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_action).transpose()
    }

    async fn get_by_name(&self, name: &str) -> CoreResult<Option<ScheduledAction>> {
        let row: Option<ScheduledActionRow> =
            sqlx::query_as("SELECT * FROM scheduled_actions WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_action).transpose()
    }

    async fn delete(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM scheduled_actions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        status: Option<ScheduledActionStatus>,
    ) -> CoreResult<Vec<ScheduledAction>> {
        let rows: Vec<ScheduledActionRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM scheduled_actions WHERE status = ? ORDER BY created_at",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM scheduled_actions ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_action).collect()
    }

    async fn list_active(&self) -> CoreResult<Vec<ScheduledAction>> {
        self.list(Some(ScheduledActionStatus::Active)).await
    }
}
