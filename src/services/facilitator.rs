//! Facilitator: task routing and conflict arbitration.
//!
//! The facilitator routes, it does not command. It keeps per-agent
//! workload and quality metrics, scores candidates for each task, and
//! raises conflicts (file collisions, task overlaps, disagreeing
//! reviews, reported deadlocks) as events. Routing never fails loudly:
//! an unmatched task simply yields `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::domain::models::{
    AgentId, AgentMetrics, CircleTask, Conflict, ConflictKind, EventKind, ReviewDecision, TaskId,
    TaskStatus,
};

use super::event_bus::EventBus;

/// Routing score weights.
const WEIGHT_AVAILABILITY: f64 = 0.6;
const WEIGHT_SUCCESS: f64 = 0.3;
const WEIGHT_REVERSE_WORKLOAD: f64 = 0.1;

/// An agent as the facilitator sees it.
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub id: AgentId,
    pub name: String,
    pub competencies: Vec<String>,
    pub can_review: Vec<String>,
    pub active: bool,
}

#[derive(Default)]
struct FacilitatorState {
    agents: HashMap<AgentId, RegisteredAgent>,
    metrics: HashMap<AgentId, AgentMetrics>,
    /// Advisory resource locks: resource string → holder.
    file_locks: HashMap<String, AgentId>,
    /// Review verdicts per (task, iteration), for disagreement detection.
    review_log: HashMap<(TaskId, u32), Vec<(AgentId, ReviewDecision)>>,
    conflicts: Vec<Conflict>,
}

/// Routing and arbitration component inside a circle.
///
/// State is mutated only through these methods; an internal mutex
/// serializes writers and is never held across an await point.
pub struct Facilitator {
    bus: Arc<EventBus>,
    state: Mutex<FacilitatorState>,
    max_workload: u32,
}

impl Facilitator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_max_workload(bus, AgentMetrics::DEFAULT_MAX_WORKLOAD)
    }

    pub fn with_max_workload(bus: Arc<EventBus>, max_workload: u32) -> Self {
        Self {
            bus,
            state: Mutex::new(FacilitatorState::default()),
            max_workload: max_workload.max(1),
        }
    }

    // -- Registration -------------------------------------------------

    pub fn register_agent(
        &self,
        id: AgentId,
        name: impl Into<String>,
        competencies: Vec<String>,
        can_review: Vec<String>,
    ) {
        let mut state = self.lock();
        state.agents.insert(
            id,
            RegisteredAgent { id, name: name.into(), competencies, can_review, active: true },
        );
        state.metrics.entry(id).or_insert_with(|| {
            let mut metrics = AgentMetrics::new();
            metrics.max_workload = self.max_workload;
            metrics
        });
    }

    pub fn unregister_agent(&self, id: AgentId) {
        let mut state = self.lock();
        state.agents.remove(&id);
    }

    pub fn set_active(&self, id: AgentId, active: bool) {
        let mut state = self.lock();
        if let Some(agent) = state.agents.get_mut(&id) {
            agent.active = active;
        }
    }

    pub fn active_agents(&self) -> Vec<RegisteredAgent> {
        let state = self.lock();
        let mut agents: Vec<RegisteredAgent> =
            state.agents.values().filter(|a| a.active).cloned().collect();
        agents.sort_by_key(|a| a.id);
        agents
    }

    // -- Routing ------------------------------------------------------

    /// Pick the best available agent for a task, or `None` when nobody
    /// qualifies. Re-routing a task that is already in progress records
    /// a task-overlap conflict instead of routing.
    pub async fn route_task(&self, task: &CircleTask, excluded: &[AgentId]) -> Option<AgentId> {
        if task.status == TaskStatus::InProgress {
            let holder = task.assigned_agent_id;
            let conflict = Conflict::new(
                ConflictKind::TaskOverlap,
                holder.into_iter().collect(),
                Some(task.id.to_string()),
            );
            self.record_conflict(conflict).await;
            return None;
        }

        let scored = {
            let state = self.lock();
            let mut scored: Vec<(f64, f64, u32, AgentId)> = state
                .agents
                .values()
                .filter(|agent| agent.active && !excluded.contains(&agent.id))
                .filter(|agent| {
                    task.required_competencies.iter().all(|c| agent.competencies.contains(c))
                })
                .map(|agent| {
                    let metrics = state.metrics.get(&agent.id).cloned().unwrap_or_default();
                    let availability = metrics.availability_score();
                    let reverse_workload = 1.0 / (1.0 + f64::from(metrics.current_workload));
                    let score = availability * WEIGHT_AVAILABILITY
                        + metrics.success_rate() * WEIGHT_SUCCESS
                        + reverse_workload * WEIGHT_REVERSE_WORKLOAD;
                    (score, availability, metrics.current_workload, agent.id)
                })
                .collect();

            // Best score first; ties broken by availability, then lighter
            // workload, then lower id.
            scored.sort_by(|a, b| {
                b.0.total_cmp(&a.0)
                    .then(b.1.total_cmp(&a.1))
                    .then(a.2.cmp(&b.2))
                    .then(a.3.cmp(&b.3))
            });
            scored
        };

        scored.first().map(|(_, _, _, id)| *id)
    }

    // -- File-access arbitration --------------------------------------

    /// Record advisory access to a resource. Returns the collision
    /// conflict when another agent already holds it; locks never block.
    pub async fn acquire(&self, resource: &str, agent_id: AgentId) -> Option<Conflict> {
        let collision = {
            let mut state = self.lock();
            match state.file_locks.get(resource) {
                Some(&holder) if holder != agent_id => Some(Conflict::new(
                    ConflictKind::FileCollision,
                    vec![holder, agent_id],
                    Some(resource.to_string()),
                )),
                Some(_) => None,
                None => {
                    state.file_locks.insert(resource.to_string(), agent_id);
                    None
                }
            }
        };

        if let Some(conflict) = collision {
            self.record_conflict(conflict.clone()).await;
            return Some(conflict);
        }
        None
    }

    /// Drop an advisory lock held by `agent_id`.
    pub fn release(&self, resource: &str, agent_id: AgentId) {
        let mut state = self.lock();
        if state.file_locks.get(resource) == Some(&agent_id) {
            state.file_locks.remove(resource);
        }
    }

    // -- Review disagreement ------------------------------------------

    /// Record a review verdict; returns a conflicting-reviews conflict
    /// when another reviewer reached the opposite verdict on the same
    /// submission.
    pub async fn record_review(
        &self,
        task_id: TaskId,
        iteration: u32,
        reviewer_id: AgentId,
        decision: ReviewDecision,
    ) -> Option<Conflict> {
        let disagreement = {
            let mut state = self.lock();
            let log = state.review_log.entry((task_id, iteration)).or_default();
            let approved = decision == ReviewDecision::Approved;
            let disagreeing: Vec<AgentId> = log
                .iter()
                .filter(|(other, prior)| {
                    *other != reviewer_id && (*prior == ReviewDecision::Approved) != approved
                })
                .map(|(other, _)| *other)
                .collect();
            log.push((reviewer_id, decision));

            if disagreeing.is_empty() {
                None
            } else {
                let mut agents = disagreeing;
                agents.push(reviewer_id);
                Some(Conflict::new(
                    ConflictKind::ConflictingReviews,
                    agents,
                    Some(task_id.to_string()),
                ))
            }
        };

        if let Some(conflict) = disagreement {
            self.record_conflict(conflict.clone()).await;
            return Some(conflict);
        }
        None
    }

    /// Explicit deadlock report surface; no automatic detection runs.
    pub async fn report_deadlock(&self, agent_ids: Vec<AgentId>, resource: Option<String>) -> Conflict {
        let conflict = Conflict::new(ConflictKind::Deadlock, agent_ids, resource);
        self.record_conflict(conflict.clone()).await;
        conflict
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.lock().conflicts.clone()
    }

    // -- Metrics ------------------------------------------------------

    pub fn metrics(&self, agent_id: AgentId) -> Option<AgentMetrics> {
        self.lock().metrics.get(&agent_id).cloned()
    }

    pub fn task_assigned(&self, agent_id: AgentId) {
        if let Some(m) = self.lock().metrics.get_mut(&agent_id) {
            m.record_assignment();
        }
    }

    pub fn task_completed(&self, agent_id: AgentId, duration_ms: u64) {
        if let Some(m) = self.lock().metrics.get_mut(&agent_id) {
            m.record_completion(duration_ms);
        }
    }

    pub fn task_failed(&self, agent_id: AgentId) {
        if let Some(m) = self.lock().metrics.get_mut(&agent_id) {
            m.record_failure();
        }
    }

    pub fn review_done(&self, agent_id: AgentId) {
        if let Some(m) = self.lock().metrics.get_mut(&agent_id) {
            m.record_review();
        }
    }

    // -- Internals ----------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, FacilitatorState> {
        self.state.lock().expect("facilitator state poisoned")
    }

    async fn record_conflict(&self, conflict: Conflict) {
        {
            let mut state = self.lock();
            state.conflicts.push(conflict.clone());
        }
        tracing::warn!(
            kind = conflict.kind.as_str(),
            resource = conflict.resource.as_deref().unwrap_or("-"),
            "conflict detected"
        );
        self.bus
            .emit(
                EventKind::Conflict,
                json!({
                    "conflict_kind": conflict.kind.as_str(),
                    "agent_ids": conflict.agent_ids,
                    "resource": conflict.resource,
                }),
                None,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::CircleTask;

    fn facilitator() -> Facilitator {
        Facilitator::new(Arc::new(EventBus::default()))
    }

    fn task(required: &[&str]) -> CircleTask {
        CircleTask::new(
            TaskId(100),
            "t",
            "d",
            required.iter().map(|s| (*s).to_string()).collect(),
            3,
        )
    }

    #[tokio::test]
    async fn routes_to_higher_availability() {
        let f = facilitator();
        f.register_agent(AgentId(1), "Claude", vec!["py".into()], vec![]);
        f.register_agent(AgentId(2), "DeepSeek", vec!["py".into()], vec![]);

        // Agent 1: idle with a perfect record. Agent 2: two tasks in
        // flight, also perfect.
        for _ in 0..10 {
            f.task_assigned(AgentId(1));
            f.task_completed(AgentId(1), 100);
        }
        for _ in 0..20 {
            f.task_assigned(AgentId(2));
            f.task_completed(AgentId(2), 100);
        }
        f.task_assigned(AgentId(2));
        f.task_assigned(AgentId(2));

        let routed = f.route_task(&task(&["py"]), &[]).await;
        assert_eq!(routed, Some(AgentId(1)));
    }

    #[tokio::test]
    async fn routing_requires_all_competencies() {
        let f = facilitator();
        f.register_agent(AgentId(1), "Claude", vec!["py".into()], vec![]);

        assert_eq!(f.route_task(&task(&["rust"]), &[]).await, None);
        assert_eq!(f.route_task(&task(&["py"]), &[]).await, Some(AgentId(1)));
    }

    #[tokio::test]
    async fn routing_honors_exclusions() {
        let f = facilitator();
        f.register_agent(AgentId(1), "Claude", vec!["py".into()], vec![]);
        f.register_agent(AgentId(2), "DeepSeek", vec!["py".into()], vec![]);

        let routed = f.route_task(&task(&["py"]), &[AgentId(1)]).await;
        assert_eq!(routed, Some(AgentId(2)));
    }

    #[tokio::test]
    async fn equal_candidates_tie_break_on_lower_id() {
        let f = facilitator();
        f.register_agent(AgentId(2), "B", vec!["py".into()], vec![]);
        f.register_agent(AgentId(1), "A", vec!["py".into()], vec![]);

        assert_eq!(f.route_task(&task(&["py"]), &[]).await, Some(AgentId(1)));
    }

    #[tokio::test]
    async fn reroute_of_in_progress_task_is_an_overlap() {
        let f = facilitator();
        f.register_agent(AgentId(1), "A", vec!["py".into()], vec![]);

        let mut t = task(&["py"]);
        t.status = TaskStatus::InProgress;
        t.assigned_agent_id = Some(AgentId(1));

        assert_eq!(f.route_task(&t, &[]).await, None);
        let conflicts = f.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::TaskOverlap);
    }

    #[tokio::test]
    async fn file_collision_and_release() {
        let f = facilitator();
        f.register_agent(AgentId(1), "A", vec![], vec![]);
        f.register_agent(AgentId(2), "B", vec![], vec![]);

        assert!(f.acquire("src/main.rs", AgentId(1)).await.is_none());
        // Re-entrant acquire by the holder is quiet.
        assert!(f.acquire("src/main.rs", AgentId(1)).await.is_none());

        let conflict = f.acquire("src/main.rs", AgentId(2)).await.expect("collision");
        assert_eq!(conflict.kind, ConflictKind::FileCollision);
        assert!(conflict.agent_ids.contains(&AgentId(1)));
        assert!(conflict.agent_ids.contains(&AgentId(2)));

        f.release("src/main.rs", AgentId(1));
        assert!(f.acquire("src/main.rs", AgentId(2)).await.is_none());
    }

    #[tokio::test]
    async fn disagreeing_reviews_conflict() {
        let f = facilitator();
        f.register_agent(AgentId(1), "A", vec![], vec![]);
        f.register_agent(AgentId(2), "B", vec![], vec![]);

        assert!(f
            .record_review(TaskId(9), 1, AgentId(1), ReviewDecision::Approved)
            .await
            .is_none());
        let conflict = f
            .record_review(TaskId(9), 1, AgentId(2), ReviewDecision::Rejected)
            .await
            .expect("disagreement");
        assert_eq!(conflict.kind, ConflictKind::ConflictingReviews);
    }

    #[tokio::test]
    async fn metrics_track_registration() {
        let f = facilitator();
        f.register_agent(AgentId(1), "A", vec![], vec![]);

        let metrics = f.metrics(AgentId(1)).expect("metrics");
        assert_eq!(metrics.tasks_completed, 0);
        assert_eq!(metrics.current_workload, 0);
    }
}
