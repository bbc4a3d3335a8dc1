//! Gathering circle orchestrator.
//!
//! A circle owns its agents, tasks, and conversations, and wires them to
//! a facilitator and the event bus. It runs the task lifecycle
//! (claim → execute → review → complete/escalate) and drives
//! multi-agent conversations.
//!
//! Principles carried from the gathering model: agents keep autonomy
//! (they can refuse tasks), the facilitator routes rather than commands,
//! work is peer reviewed before completion, and escalations surface to
//! the human as events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    AgentHandle, AgentId, Artifact, CircleTask, ConversationResult, Event, EventKind, Review,
    ReviewDecision, TaskId, TaskStatus, TurnStrategy,
};

use super::conversation::{
    extract_mentions, ConversationRunner, ConversationSettings, Participant,
};
use super::event_bus::EventBus;
use super::facilitator::Facilitator;

/// Lifecycle status of a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Paused,
}

impl CircleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
        }
    }
}

/// Tunables for a circle.
#[derive(Debug, Clone)]
pub struct CircleConfig {
    /// Submitted work goes through peer review before completion.
    pub require_review: bool,
    /// Ask the facilitator to route new tasks immediately.
    pub auto_route: bool,
    /// Changes-requested reviews beyond this iteration escalate.
    pub max_iterations: u32,
    /// Workload ceiling used for availability scoring.
    pub max_workload: u32,
    /// How long `stop` waits for in-flight tasks before force-cancel.
    pub stop_grace: Duration,
    pub conversation: ConversationSettings,
}

impl Default for CircleConfig {
    fn default() -> Self {
        Self {
            require_review: true,
            auto_route: true,
            max_iterations: 3,
            max_workload: 5,
            stop_grace: Duration::from_secs(10),
            conversation: ConversationSettings::default(),
        }
    }
}

/// Aggregate counts reported by [`GatheringCircle::circle_status`].
#[derive(Debug, Clone, Serialize)]
pub struct CircleSummary {
    pub name: String,
    pub status: CircleStatus,
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_tasks: usize,
    pub tasks_by_status: HashMap<String, usize>,
    pub conversations: usize,
}

/// Per-agent workload snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AgentWorkload {
    pub agent_id: AgentId,
    pub name: String,
    pub current_workload: u32,
    pub availability: f64,
}

struct CircleState {
    status: CircleStatus,
    agents: HashMap<AgentId, AgentHandle>,
    tasks: HashMap<TaskId, CircleTask>,
    conversations: Vec<ConversationResult>,
}

/// A bounded group of agents sharing tasks, conversations, and a
/// facilitator.
pub struct GatheringCircle {
    name: String,
    config: CircleConfig,
    bus: Arc<EventBus>,
    facilitator: Arc<Facilitator>,
    state: RwLock<CircleState>,
    next_task_id: AtomicU64,
}

impl GatheringCircle {
    pub fn new(name: impl Into<String>, config: CircleConfig, bus: Arc<EventBus>) -> Self {
        let facilitator = Arc::new(Facilitator::with_max_workload(bus.clone(), config.max_workload));
        Self {
            name: name.into(),
            config,
            bus,
            facilitator,
            state: RwLock::new(CircleState {
                status: CircleStatus::Initializing,
                agents: HashMap::new(),
                tasks: HashMap::new(),
                conversations: Vec::new(),
            }),
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn facilitator(&self) -> &Facilitator {
        &self.facilitator
    }

    pub async fn status(&self) -> CircleStatus {
        self.state.read().await.status
    }

    // -- Lifecycle ----------------------------------------------------

    pub async fn start(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            if !matches!(state.status, CircleStatus::Initializing | CircleStatus::Stopped | CircleStatus::Paused)
            {
                return Err(CoreError::InvalidState(format!(
                    "cannot start circle from {}",
                    state.status.as_str()
                )));
            }
            state.status = CircleStatus::Starting;
            state.status = CircleStatus::Running;
        }
        tracing::info!(circle = %self.name, "circle started");
        self.emit(EventKind::CircleStarted, json!({ "circle": self.name }), None).await;
        Ok(())
    }

    pub async fn pause(&self) -> CoreResult<()> {
        let mut state = self.state.write().await;
        if state.status != CircleStatus::Running {
            return Err(CoreError::InvalidState("only a running circle can pause".to_string()));
        }
        state.status = CircleStatus::Paused;
        Ok(())
    }

    /// Stop the circle: refuse new claims, drain in-progress work for
    /// the grace period, then force-cancel stragglers.
    pub async fn stop(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            if state.status == CircleStatus::Stopped {
                return Ok(());
            }
            state.status = CircleStatus::Stopping;
        }

        let deadline = tokio::time::Instant::now() + self.config.stop_grace;
        loop {
            let draining = {
                let state = self.state.read().await;
                state
                    .tasks
                    .values()
                    .any(|t| matches!(t.status, TaskStatus::InProgress | TaskStatus::InReview))
            };
            if !draining || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stragglers: Vec<TaskId> = {
            let state = self.state.read().await;
            state
                .tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id)
                .collect()
        };
        for task_id in stragglers {
            if let Err(error) = self.cancel_task(task_id, "circle stopped").await {
                tracing::warn!(%task_id, %error, "failed to cancel task during stop");
            }
        }

        {
            let mut state = self.state.write().await;
            state.status = CircleStatus::Stopped;
        }
        tracing::info!(circle = %self.name, "circle stopped");
        self.emit(EventKind::CircleStopped, json!({ "circle": self.name }), None).await;
        Ok(())
    }

    // -- Agents -------------------------------------------------------

    pub async fn add_agent(&self, agent: AgentHandle) -> CoreResult<()> {
        let id = agent.id;
        {
            let mut state = self.state.write().await;
            if state.agents.contains_key(&id) {
                return Err(CoreError::InvalidState(format!("agent {id} already in circle")));
            }
            self.facilitator.register_agent(
                id,
                agent.name.clone(),
                agent.competencies.clone(),
                agent.can_review.clone(),
            );
            state.agents.insert(id, agent);
        }
        self.emit(EventKind::AgentJoined, json!({ "circle": self.name }), Some(id)).await;
        Ok(())
    }

    /// Deactivate an agent. Its in-flight work keeps running; it simply
    /// stops receiving new routes and turns.
    pub async fn remove_agent(&self, agent_id: AgentId) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            let agent = state
                .agents
                .get_mut(&agent_id)
                .ok_or_else(|| CoreError::not_found("agent", agent_id))?;
            agent.is_active = false;
            self.facilitator.set_active(agent_id, false);
        }
        self.emit(EventKind::AgentLeft, json!({ "circle": self.name }), Some(agent_id)).await;
        Ok(())
    }

    pub async fn agent(&self, agent_id: AgentId) -> Option<AgentHandle> {
        self.state.read().await.agents.get(&agent_id).cloned()
    }

    pub async fn agents(&self) -> Vec<AgentHandle> {
        let mut agents: Vec<AgentHandle> = self.state.read().await.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    // -- Tasks --------------------------------------------------------

    /// Create a task and, when auto-routing is on, assign it immediately.
    pub async fn create_task(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        required_competencies: Vec<String>,
        priority: u8,
    ) -> CoreResult<TaskId> {
        self.ensure_running().await?;

        let task_id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let task = CircleTask::new(task_id, title, description, required_competencies, priority);
        {
            let mut state = self.state.write().await;
            state.tasks.insert(task_id, task.clone());
        }
        self.emit(
            EventKind::TaskCreated,
            json!({ "circle": self.name, "task_id": task_id.0, "title": task.title }),
            None,
        )
        .await;

        if self.config.auto_route {
            match self.facilitator.route_task(&task, &[]).await {
                Some(agent_id) => {
                    {
                        let mut state = self.state.write().await;
                        if let Some(task) = state.tasks.get_mut(&task_id) {
                            task.status = TaskStatus::Assigned;
                            task.assigned_agent_id = Some(agent_id);
                        }
                    }
                    self.facilitator.task_assigned(agent_id);
                    self.emit(
                        EventKind::TaskAssigned,
                        json!({ "circle": self.name, "task_id": task_id.0 }),
                        Some(agent_id),
                    )
                    .await;
                }
                None => {
                    self.emit(
                        EventKind::TaskPendingNoAgent,
                        json!({ "circle": self.name, "task_id": task_id.0 }),
                        None,
                    )
                    .await;
                }
            }
        }

        Ok(task_id)
    }

    /// Claim a task for an agent. Returns `Ok(false)` when the agent's
    /// accept callback declines.
    pub async fn claim_task(&self, task_id: TaskId, agent_id: AgentId) -> CoreResult<bool> {
        self.ensure_running().await?;

        let (task_snapshot, accept, was_pending) = {
            let state = self.state.read().await;
            let task = state
                .tasks
                .get(&task_id)
                .ok_or_else(|| CoreError::not_found("task", task_id))?;
            let agent = state
                .agents
                .get(&agent_id)
                .ok_or_else(|| CoreError::not_found("agent", agent_id))?;
            if !agent.is_active {
                return Err(CoreError::InvalidState(format!("agent {agent_id} is inactive")));
            }
            match task.status {
                TaskStatus::Pending => {}
                TaskStatus::Assigned if task.assigned_agent_id == Some(agent_id) => {}
                TaskStatus::Assigned => {
                    return Err(CoreError::NotAuthorized(format!(
                        "task {task_id} is assigned to another agent"
                    )));
                }
                other => {
                    return Err(CoreError::InvalidState(format!(
                        "task {task_id} cannot be claimed from {other}"
                    )));
                }
            }
            (task.clone(), agent.callbacks.accept_task.clone(), task.status == TaskStatus::Pending)
        };

        // Autonomy: the agent may refuse. Default is to accept.
        if let Some(accept) = accept {
            if !accept(task_snapshot).await {
                tracing::debug!(%task_id, %agent_id, "agent declined task");
                return Ok(false);
            }
        }

        {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| CoreError::not_found("task", task_id))?;
            // Re-validate: the task may have moved while the callback ran.
            let claimable = task.status == TaskStatus::Pending
                || (task.status == TaskStatus::Assigned && task.assigned_agent_id == Some(agent_id));
            if !claimable {
                return Err(CoreError::InvalidState(format!(
                    "task {task_id} changed state during claim"
                )));
            }
            task.status = TaskStatus::InProgress;
            task.assigned_agent_id = Some(agent_id);
            task.started_at = Some(Utc::now());
            if let Some(agent) = state.agents.get_mut(&agent_id) {
                agent.current_task_id = Some(task_id);
            }
        }
        if was_pending {
            self.facilitator.task_assigned(agent_id);
        }

        self.emit(
            EventKind::TaskClaimed,
            json!({ "circle": self.name, "task_id": task_id.0 }),
            Some(agent_id),
        )
        .await;
        Ok(true)
    }

    /// Submit finished work. Moves to review, or straight to completed
    /// when review is not required (or no reviewer exists).
    pub async fn submit_task(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        result: impl Into<String>,
        artifacts: Vec<Artifact>,
    ) -> CoreResult<()> {
        let reviewer = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| CoreError::not_found("task", task_id))?;
            if task.status != TaskStatus::InProgress {
                return Err(CoreError::InvalidState(format!(
                    "task {task_id} is {} and cannot be submitted",
                    task.status
                )));
            }
            if task.assigned_agent_id != Some(agent_id) {
                return Err(CoreError::NotAuthorized(format!(
                    "agent {agent_id} does not hold task {task_id}"
                )));
            }
            task.result = Some(result.into());
            task.artifacts = artifacts;

            if self.config.require_review {
                let reviewer = pick_reviewer(&state.agents, task, agent_id);
                if let Some(reviewer_id) = reviewer {
                    task.status = TaskStatus::InReview;
                    task.reviewer_id = Some(reviewer_id);
                }
                reviewer
            } else {
                None
            }
        };

        self.emit(
            EventKind::TaskSubmitted,
            json!({ "circle": self.name, "task_id": task_id.0 }),
            Some(agent_id),
        )
        .await;

        match reviewer {
            Some(reviewer_id) => {
                self.emit(
                    EventKind::ReviewRequested,
                    json!({ "circle": self.name, "task_id": task_id.0, "reviewer_id": reviewer_id.0 }),
                    Some(agent_id),
                )
                .await;

                // A reviewer with a review callback reviews inline.
                let review = self
                    .agent(reviewer_id)
                    .await
                    .and_then(|a| a.callbacks.review_work.clone());
                if let Some(review) = review {
                    let snapshot = self
                        .task(task_id)
                        .await
                        .ok_or_else(|| CoreError::not_found("task", task_id))?;
                    let (decision, feedback) = review(snapshot).await;
                    self.submit_review(task_id, reviewer_id, decision, None, feedback, Vec::new())
                        .await?;
                }
            }
            None => {
                if self.config.require_review {
                    tracing::warn!(%task_id, "no eligible reviewer, completing without review");
                }
                self.complete_task(task_id).await?;
            }
        }
        Ok(())
    }

    /// Apply a review decision to a task in review.
    pub async fn submit_review(
        &self,
        task_id: TaskId,
        reviewer_id: AgentId,
        decision: ReviewDecision,
        score: Option<u8>,
        feedback: Option<String>,
        changes: Vec<String>,
    ) -> CoreResult<()> {
        let iteration = {
            let mut state = self.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| CoreError::not_found("task", task_id))?;
            if task.status != TaskStatus::InReview {
                return Err(CoreError::InvalidState(format!(
                    "task {task_id} is {} and cannot be reviewed",
                    task.status
                )));
            }
            if task.assigned_agent_id == Some(reviewer_id) {
                return Err(CoreError::NotAuthorized(
                    "authors cannot review their own work".to_string(),
                ));
            }
            if task.reviewer_id != Some(reviewer_id) {
                return Err(CoreError::NotAuthorized(format!(
                    "agent {reviewer_id} is not the reviewer of task {task_id}"
                )));
            }
            let iteration = task.iteration;
            task.review_history.push(Review {
                reviewer_id,
                decision,
                score,
                feedback: feedback.clone(),
                changes: changes.clone(),
                iteration,
                at: Utc::now(),
            });
            iteration
        };

        self.facilitator.record_review(task_id, iteration, reviewer_id, decision).await;
        self.facilitator.review_done(reviewer_id);

        self.emit(
            EventKind::ReviewCompleted,
            json!({
                "circle": self.name,
                "task_id": task_id.0,
                "decision": decision.as_str(),
                "score": score,
            }),
            Some(reviewer_id),
        )
        .await;

        match decision {
            ReviewDecision::Approved => self.complete_task(task_id).await,
            ReviewDecision::ChangesRequested => {
                let escalate = {
                    let mut state = self.state.write().await;
                    let task = state
                        .tasks
                        .get_mut(&task_id)
                        .ok_or_else(|| CoreError::not_found("task", task_id))?;
                    task.iteration += 1;
                    if task.iteration > self.config.max_iterations {
                        true
                    } else {
                        task.status = TaskStatus::InProgress;
                        task.revision_notes.extend(changes);
                        false
                    }
                };
                if escalate {
                    self.fail_task(
                        task_id,
                        format!(
                            "changes requested beyond max iterations ({})",
                            self.config.max_iterations
                        ),
                        true,
                    )
                    .await?;
                }
                Ok(())
            }
            ReviewDecision::Rejected => {
                self.fail_task(
                    task_id,
                    format!("review rejected by agent {reviewer_id}"),
                    true,
                )
                .await
            }
        }
    }

    /// Cancel any non-terminal task. Privileged surface.
    pub async fn cancel_task(&self, task_id: TaskId, reason: &str) -> CoreResult<()> {
        {
            let state = self.state.read().await;
            let task = state
                .tasks
                .get(&task_id)
                .ok_or_else(|| CoreError::not_found("task", task_id))?;
            if task.status.is_terminal() {
                return Err(CoreError::InvalidState(format!(
                    "task {task_id} is already {}",
                    task.status
                )));
            }
        }
        self.fail_task(task_id, reason.to_string(), false).await
    }

    pub async fn task(&self, task_id: TaskId) -> Option<CircleTask> {
        self.state.read().await.tasks.get(&task_id).cloned()
    }

    pub async fn tasks(&self) -> Vec<CircleTask> {
        let mut tasks: Vec<CircleTask> = self.state.read().await.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    // -- Messaging ----------------------------------------------------

    /// Post a message into the circle, emitting a mention event for each
    /// mentioned agent. Mentions are extracted from `@Name` when not
    /// given explicitly.
    pub async fn send_message(
        &self,
        from: AgentId,
        content: impl Into<String>,
        mentions: Option<Vec<AgentId>>,
    ) -> CoreResult<()> {
        let content = content.into();
        let mentions = {
            let state = self.state.read().await;
            if !state.agents.contains_key(&from) {
                return Err(CoreError::not_found("agent", from));
            }
            match mentions {
                Some(explicit) => explicit,
                None => {
                    let roster: Vec<Participant> = state
                        .agents
                        .values()
                        .map(|a| Participant {
                            id: a.id,
                            name: a.name.clone(),
                            persona: None,
                            responder: None,
                        })
                        .collect();
                    extract_mentions(&content, &roster)
                }
            }
        };

        self.emit(
            EventKind::Message,
            json!({ "circle": self.name, "content": content }),
            Some(from),
        )
        .await;
        for mentioned in mentions {
            self.emit(
                EventKind::Mention,
                json!({
                    "circle": self.name,
                    "mentioned_agent_id": mentioned.0,
                    "content": content,
                }),
                Some(from),
            )
            .await;
        }
        Ok(())
    }

    // -- Conversations ------------------------------------------------

    /// Run a conversation among circle agents and return the transcript.
    #[allow(clippy::too_many_arguments)]
    pub async fn collaborate(
        &self,
        topic: impl Into<String>,
        agent_ids: Vec<AgentId>,
        max_turns: u32,
        strategy: TurnStrategy,
        facilitator_id: Option<AgentId>,
        initial_prompt: Option<String>,
    ) -> CoreResult<ConversationResult> {
        self.ensure_running().await?;
        let topic = topic.into();

        let participants = {
            let state = self.state.read().await;
            let mut participants = Vec::with_capacity(agent_ids.len());
            for id in &agent_ids {
                let agent = state
                    .agents
                    .get(id)
                    .filter(|a| a.is_active)
                    .ok_or_else(|| CoreError::not_found("agent", *id))?;
                participants.push(Participant {
                    id: agent.id,
                    name: agent.name.clone(),
                    persona: agent.persona.clone(),
                    responder: agent.callbacks.process_message.clone(),
                });
            }
            participants
        };

        let mut runner = ConversationRunner::new(
            topic.clone(),
            participants,
            max_turns,
            strategy,
            facilitator_id,
            self.config.conversation.clone(),
        )?;
        if let Some(prompt) = initial_prompt {
            runner = runner.with_initial_prompt(prompt);
        }

        let conversation_id = runner.conversation().id;
        self.emit(
            EventKind::ConversationStarted,
            json!({
                "circle": self.name,
                "conversation_id": conversation_id.to_string(),
                "topic": topic,
                "strategy": strategy.as_str(),
            }),
            None,
        )
        .await;

        let result = runner.run().await;

        self.emit(
            EventKind::ConversationCompleted,
            json!({
                "circle": self.name,
                "conversation_id": conversation_id.to_string(),
                "turns_taken": result.turns_taken,
                "messages": result.messages.len(),
            }),
            None,
        )
        .await;

        self.state.write().await.conversations.push(result.clone());
        Ok(result)
    }

    // -- Introspection ------------------------------------------------

    pub async fn circle_status(&self) -> CircleSummary {
        let state = self.state.read().await;
        let mut tasks_by_status: HashMap<String, usize> = HashMap::new();
        for task in state.tasks.values() {
            *tasks_by_status.entry(task.status.as_str().to_string()).or_default() += 1;
        }
        CircleSummary {
            name: self.name.clone(),
            status: state.status,
            total_agents: state.agents.len(),
            active_agents: state.agents.values().filter(|a| a.is_active).count(),
            total_tasks: state.tasks.len(),
            tasks_by_status,
            conversations: state.conversations.len(),
        }
    }

    pub async fn agent_workload(&self) -> Vec<AgentWorkload> {
        let agents = self.agents().await;
        agents
            .into_iter()
            .map(|agent| {
                let metrics = self.facilitator.metrics(agent.id).unwrap_or_default();
                AgentWorkload {
                    agent_id: agent.id,
                    name: agent.name,
                    current_workload: metrics.current_workload,
                    availability: metrics.availability_score(),
                }
            })
            .collect()
    }

    // -- Internals ----------------------------------------------------

    async fn ensure_running(&self) -> CoreResult<()> {
        let state = self.state.read().await;
        if state.status != CircleStatus::Running {
            return Err(CoreError::Capacity(format!(
                "circle {} is {}",
                self.name,
                state.status.as_str()
            )));
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: TaskId) -> CoreResult<()> {
        let (agent_id, duration_ms) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| CoreError::not_found("task", task_id))?;
            let now = Utc::now();
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            let duration_ms = task
                .started_at
                .map(|s| now.signed_duration_since(s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            let agent_id = task.assigned_agent_id;
            if let Some(agent_id) = agent_id {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    if agent.current_task_id == Some(task_id) {
                        agent.current_task_id = None;
                    }
                }
            }
            (agent_id, duration_ms)
        };

        if let Some(agent_id) = agent_id {
            self.facilitator.task_completed(agent_id, duration_ms);
        }
        self.emit(
            EventKind::TaskCompleted,
            json!({ "circle": self.name, "task_id": task_id.0, "duration_ms": duration_ms }),
            agent_id,
        )
        .await;
        Ok(())
    }

    async fn fail_task(&self, task_id: TaskId, reason: String, escalate: bool) -> CoreResult<()> {
        let (agent_id, counted) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| CoreError::not_found("task", task_id))?;
            let counted = task.status.counts_toward_workload();
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            let agent_id = task.assigned_agent_id;
            if let Some(agent_id) = agent_id {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    if agent.current_task_id == Some(task_id) {
                        agent.current_task_id = None;
                    }
                }
            }
            (agent_id, counted)
        };

        if counted {
            if let Some(agent_id) = agent_id {
                self.facilitator.task_failed(agent_id);
            }
        }
        self.emit(
            EventKind::TaskFailed,
            json!({ "circle": self.name, "task_id": task_id.0, "reason": reason }),
            agent_id,
        )
        .await;
        if escalate {
            tracing::warn!(%task_id, %reason, "escalating to human");
            self.emit(
                EventKind::Escalation,
                json!({ "circle": self.name, "task_id": task_id.0, "reason": reason }),
                agent_id,
            )
            .await;
        }
        Ok(())
    }

    async fn emit(&self, kind: EventKind, payload: serde_json::Value, source: Option<AgentId>) -> Event {
        self.bus.emit(kind, payload, source).await
    }
}

/// Reviewer selection: a different agent whose review set intersects the
/// task's artifact kinds, falling back to any other active agent.
fn pick_reviewer(
    agents: &HashMap<AgentId, AgentHandle>,
    task: &CircleTask,
    author: AgentId,
) -> Option<AgentId> {
    let kinds = task.artifact_kinds();
    let mut candidates: Vec<&AgentHandle> = agents
        .values()
        .filter(|a| a.is_active && a.id != author)
        .collect();
    candidates.sort_by_key(|a| a.id);

    candidates
        .iter()
        .find(|a| kinds.iter().any(|k| a.can_review_kind(k)))
        .or_else(|| candidates.first())
        .map(|a| a.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventBusConfig;

    fn circle(require_review: bool, auto_route: bool) -> GatheringCircle {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let config = CircleConfig {
            require_review,
            auto_route,
            stop_grace: Duration::from_millis(100),
            ..CircleConfig::default()
        };
        GatheringCircle::new("test-circle", config, bus)
    }

    fn agent(id: u64, name: &str, competencies: &[&str], can_review: &[&str]) -> AgentHandle {
        AgentHandle::new(AgentId(id), name)
            .with_provider("anthropic", "claude-3-opus")
            .with_competencies(competencies.iter().copied())
            .with_can_review(can_review.iter().copied())
    }

    async fn two_agent_circle(require_review: bool) -> GatheringCircle {
        let c = circle(require_review, false);
        c.add_agent(agent(1, "Claude", &["python", "architecture"], &["code", "architecture"]))
            .await
            .unwrap();
        c.add_agent(agent(2, "DeepSeek", &["python", "testing"], &["code"])).await.unwrap();
        c.start().await.unwrap();
        c
    }

    #[tokio::test]
    async fn lifecycle_start_stop() {
        let c = circle(true, false);
        assert_eq!(c.status().await, CircleStatus::Initializing);
        c.start().await.unwrap();
        assert_eq!(c.status().await, CircleStatus::Running);
        c.stop().await.unwrap();
        assert_eq!(c.status().await, CircleStatus::Stopped);
    }

    #[tokio::test]
    async fn create_requires_running_circle() {
        let c = circle(true, false);
        let err = c.create_task("t", "d", vec![], 3).await.unwrap_err();
        assert!(matches!(err, CoreError::Capacity(_)));
    }

    #[tokio::test]
    async fn claim_and_submit_without_review() {
        let c = two_agent_circle(false).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        assert_eq!(c.task(task_id).await.unwrap().status, TaskStatus::Pending);

        assert!(c.claim_task(task_id, AgentId(1)).await.unwrap());
        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agent_id, Some(AgentId(1)));
        assert!(task.started_at.is_some());

        c.submit_task(task_id, AgentId(1), "done", vec![Artifact::code("src/f.py")])
            .await
            .unwrap();
        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));

        let metrics = c.facilitator().metrics(AgentId(1)).unwrap();
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.current_workload, 0);
    }

    #[tokio::test]
    async fn submit_routes_to_capable_reviewer() {
        let c = two_agent_circle(true).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();
        c.submit_task(task_id, AgentId(1), "done", vec![Artifact::code("src/f.py")])
            .await
            .unwrap();

        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InReview);
        assert_eq!(task.reviewer_id, Some(AgentId(2)));
    }

    #[tokio::test]
    async fn approved_review_completes() {
        let c = two_agent_circle(true).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();
        c.submit_task(task_id, AgentId(1), "done", vec![Artifact::code("f.py")]).await.unwrap();

        c.submit_review(task_id, AgentId(2), ReviewDecision::Approved, Some(90), Some("nice".into()), vec![])
            .await
            .unwrap();
        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.review_history.len(), 1);

        // Approving again is an invalid state, with no state change.
        let err = c
            .submit_review(task_id, AgentId(2), ReviewDecision::Approved, None, None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert_eq!(c.task(task_id).await.unwrap().review_history.len(), 1);
    }

    #[tokio::test]
    async fn changes_requested_increments_iteration() {
        let c = two_agent_circle(true).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();
        c.submit_task(task_id, AgentId(1), "v1", vec![Artifact::code("f.py")]).await.unwrap();

        c.submit_review(
            task_id,
            AgentId(2),
            ReviewDecision::ChangesRequested,
            Some(60),
            Some("needs work".into()),
            vec!["fix bug in line 42".into()],
        )
        .await
        .unwrap();

        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.iteration, 2);
        assert_eq!(task.revision_notes, vec!["fix bug in line 42".to_string()]);
    }

    #[tokio::test]
    async fn rejected_review_escalates() {
        let c = two_agent_circle(true).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();
        c.submit_task(task_id, AgentId(1), "v1", vec![Artifact::code("f.py")]).await.unwrap();

        c.submit_review(task_id, AgentId(2), ReviewDecision::Rejected, Some(20), None, vec![])
            .await
            .unwrap();

        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let escalations = c.bus.history(Some(EventKind::Escalation), None);
        assert_eq!(escalations.len(), 1);
        assert!(escalations[0].payload_str("reason").unwrap().contains("rejected"));

        let metrics = c.facilitator().metrics(AgentId(1)).unwrap();
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.current_workload, 0);
    }

    #[tokio::test]
    async fn iteration_cap_escalates_instead_of_looping() {
        let c = two_agent_circle(true).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();

        for round in 0..3 {
            c.submit_task(task_id, AgentId(1), format!("v{round}"), vec![Artifact::code("f.py")])
                .await
                .unwrap();
            c.submit_review(
                task_id,
                AgentId(2),
                ReviewDecision::ChangesRequested,
                None,
                None,
                vec![format!("round {round}")],
            )
            .await
            .unwrap();
        }

        // Iterations ran 1→4; the cap (3) fires on the third rework.
        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.iteration, 4);
        assert!(!c.bus.history(Some(EventKind::Escalation), None).is_empty());
    }

    #[tokio::test]
    async fn self_review_is_refused() {
        let c = two_agent_circle(true).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();
        c.submit_task(task_id, AgentId(1), "v1", vec![Artifact::code("f.py")]).await.unwrap();

        let err = c
            .submit_review(task_id, AgentId(1), ReviewDecision::Approved, None, None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn auto_route_assigns_on_create() {
        let c = circle(true, true);
        c.add_agent(agent(1, "Claude", &["python"], &["code"])).await.unwrap();
        c.add_agent(agent(2, "DeepSeek", &["rust"], &["code"])).await.unwrap();
        c.start().await.unwrap();

        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        let task = c.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent_id, Some(AgentId(1)));

        // Unroutable task stays pending and says so.
        let orphan = c.create_task("t2", "d", vec!["cobol".into()], 3).await.unwrap();
        assert_eq!(c.task(orphan).await.unwrap().status, TaskStatus::Pending);
        assert!(!c.bus.history(Some(EventKind::TaskPendingNoAgent), None).is_empty());
    }

    #[tokio::test]
    async fn declined_claim_returns_false() {
        let c = circle(false, false);
        let mut refusenik = agent(1, "Claude", &["python"], &[]);
        refusenik.callbacks.accept_task =
            Some(Arc::new(|_task| Box::pin(async { false })));
        c.add_agent(refusenik).await.unwrap();
        c.start().await.unwrap();

        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        assert!(!c.claim_task(task_id, AgentId(1)).await.unwrap());
        assert_eq!(c.task(task_id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_fails_non_terminal_tasks() {
        let c = two_agent_circle(false).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();

        c.cancel_task(task_id, "superseded").await.unwrap();
        assert_eq!(c.task(task_id).await.unwrap().status, TaskStatus::Failed);

        let err = c.cancel_task(task_id, "again").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stop_cancels_stragglers_after_grace() {
        let c = two_agent_circle(false).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        c.claim_task(task_id, AgentId(1)).await.unwrap();

        c.stop().await.unwrap();
        assert_eq!(c.status().await, CircleStatus::Stopped);
        assert_eq!(c.task(task_id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn send_message_emits_mentions() {
        let c = two_agent_circle(false).await;
        c.send_message(AgentId(1), "hey @DeepSeek, review this?", None).await.unwrap();

        let mentions = c.bus.history(Some(EventKind::Mention), None);
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].payload_u64("mentioned_agent_id"), Some(2));
        assert_eq!(mentions[0].source_agent_id, Some(AgentId(1)));
    }

    #[tokio::test]
    async fn workload_invariant_holds_through_lifecycle() {
        let c = two_agent_circle(true).await;
        let task_id = c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();

        c.claim_task(task_id, AgentId(1)).await.unwrap();
        assert_eq!(c.facilitator().metrics(AgentId(1)).unwrap().current_workload, 1);

        c.submit_task(task_id, AgentId(1), "v1", vec![Artifact::code("f.py")]).await.unwrap();
        // Still counted while in review.
        assert_eq!(c.facilitator().metrics(AgentId(1)).unwrap().current_workload, 1);

        c.submit_review(task_id, AgentId(2), ReviewDecision::Approved, None, None, vec![])
            .await
            .unwrap();
        assert_eq!(c.facilitator().metrics(AgentId(1)).unwrap().current_workload, 0);
    }

    #[tokio::test]
    async fn status_summary_counts() {
        let c = two_agent_circle(false).await;
        c.create_task("t", "d", vec!["python".into()], 3).await.unwrap();
        let summary = c.circle_status().await;
        assert_eq!(summary.name, "test-circle");
        assert_eq!(summary.total_agents, 2);
        assert_eq!(summary.total_tasks, 1);
        assert_eq!(summary.tasks_by_status.get("pending"), Some(&1));

        let workload = c.agent_workload().await;
        assert_eq!(workload.len(), 2);
        assert_eq!(workload[0].name, "Claude");
    }
}
