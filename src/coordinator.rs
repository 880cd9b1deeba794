//! Coordinator Loop: the session's single authoritative process.
//!
//! A `tokio::spawn`'d inbound pump, a second task running a 1s
//! `tokio::time::interval` for periodic housekeeping, and a third renewing
//! the coordinator's session lease, all joined with `tokio::try_join!` until
//! the objective reaches a terminal lifecycle state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::agent_registry::AgentRegistry;
use crate::barrier::{BarrierManager, BarrierStatus};
use crate::config::PowerModeConfig;
use crate::domain_types::{AgentId, AgentType, BarrierId, InsightId, SessionId, TaskId};
use crate::error::{PowerModeError, Result};
use crate::guardrail::{GuardrailEngine, GuardrailOutcome};
use crate::insight::Tag;
use crate::insight_router::{InsightRouter, RouteOutcome};
use crate::message::{decode, encode, Envelope, MessagePayload, Sender};
use crate::objective::{AdvanceOutcome, Objective, ObjectiveLifecycle};
use crate::store::StoreBackend;

const INBOUND_CHANNELS: &[&str] = &[
    "pop:broadcast",
    "pop:heartbeat",
    "pop:results",
    "pop:insights",
    "pop:coordinator",
    "pop:human",
];

const MAX_PENDING_INSIGHTS: usize = 100;

/// Summary persisted to `pop:completed:<session>` on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSummary {
    /// Number of phases the objective passed through.
    pub phases_elapsed: usize,
    /// Number of distinct agents that participated.
    pub agents: usize,
    /// Total insights emitted during the session.
    pub insights_emitted: u64,
    /// Number of orphaned tasks successfully reassigned.
    pub orphan_reassignments: u64,
    /// Number of `HUMAN_ESCALATE` messages raised.
    pub human_escalations: u64,
}

#[derive(Default)]
struct SessionCounters {
    insights_emitted: u64,
    orphan_reassignments: u64,
    human_escalations: u64,
}

/// The session's single authoritative coordinator.
pub struct Coordinator {
    session_id: SessionId,
    config: PowerModeConfig,
    store: Arc<dyn StoreBackend>,
    objective: Mutex<Objective>,
    agents: AgentRegistry,
    barriers: BarrierManager,
    guardrails: GuardrailEngine,
    insight_router: InsightRouter,
    running: AtomicBool,
    lease_holder: String,
    pending_insights: Mutex<VecDeque<InsightId>>,
    agent_set: Mutex<HashSet<AgentId>>,
    counters: Mutex<SessionCounters>,
    current_phase_barrier: Mutex<Option<BarrierId>>,
    /// Tasks assigned per phase that have not yet been `TASK_COMPLETE(ok=true)`.
    phase_tasks: Mutex<HashMap<usize, HashSet<TaskId>>>,
    /// The success criterion a task's completion fulfills, if any.
    task_criteria: Mutex<HashMap<TaskId, usize>>,
}

impl Coordinator {
    /// Builds a coordinator for a freshly created objective. Does not yet
    /// hold the session lease; call [`Self::run`] to acquire it and start
    /// the three cooperating background tasks.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        config: PowerModeConfig,
        store: Arc<dyn StoreBackend>,
        objective: Objective,
        guardrails: GuardrailEngine,
    ) -> Self {
        Self {
            session_id,
            config,
            store,
            objective: Mutex::new(objective),
            agents: AgentRegistry::new(),
            barriers: BarrierManager::new(),
            guardrails,
            insight_router: InsightRouter::new(),
            running: AtomicBool::new(true),
            lease_holder: uuid::Uuid::new_v4().to_string(),
            pending_insights: Mutex::new(VecDeque::new()),
            agent_set: Mutex::new(HashSet::new()),
            counters: Mutex::new(SessionCounters::default()),
            current_phase_barrier: Mutex::new(None),
            phase_tasks: Mutex::new(HashMap::new()),
            task_criteria: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new agent with the underlying [`AgentRegistry`], for use
    /// by whatever process launches agents before they start checking in.
    pub async fn register_agent(&self, agent_type: AgentType, assigned_phases: Vec<String>) -> AgentId {
        let id = self.agents.register(agent_type, assigned_phases);
        self.agent_set.lock().await.insert(id);
        id
    }

    /// Assigns a task to an agent for the given phase and publishes
    /// `TASK_ASSIGN`. The task is tracked against `phase_index` so
    /// [`Self::evaluate_phase`] can gate phase advance on every phase task
    /// reaching `TASK_COMPLETE(ok=true)`. `criterion_index`, if given, names
    /// the objective success criterion this task's completion fulfills.
    ///
    /// # Errors
    ///
    /// Propagates any store error while publishing, or
    /// [`PowerModeError::NotFound`] if `agent_id` is unknown.
    pub async fn assign_task(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        phase_index: usize,
        payload: serde_json::Value,
        deadline: chrono::DateTime<Utc>,
        criterion_index: Option<usize>,
    ) -> Result<()> {
        self.agents.assign_task(agent_id, task_id, payload.clone())?;
        self.phase_tasks
            .lock()
            .await
            .entry(phase_index)
            .or_default()
            .insert(task_id);
        if let Some(index) = criterion_index {
            self.task_criteria.lock().await.insert(task_id, index);
        }

        let envelope = Envelope::new(
            self.session_id,
            Sender::Coordinator,
            crate::domain_types::Seq::initial(),
            Utc::now(),
            MessagePayload::TaskAssign {
                task_id,
                agent_id,
                payload,
                deadline,
            },
        );
        self.store
            .publish(&format!("pop:agent:{agent_id}"), &encode(&envelope)?)
            .await
    }

    /// Removes `task_id` from every phase's outstanding-task set and, if it
    /// was mapped to a success criterion, marks that criterion met.
    async fn complete_phase_task(&self, task_id: TaskId) -> Result<()> {
        {
            let mut phase_tasks = self.phase_tasks.lock().await;
            for tasks in phase_tasks.values_mut() {
                tasks.remove(&task_id);
            }
        }

        let criterion_index = self.task_criteria.lock().await.remove(&task_id);
        if let Some(index) = criterion_index {
            let mut objective = self.objective.lock().await;
            let _ = objective.mark_criterion(index, true);
        }
        Ok(())
    }

    /// True once every task tracked against `phase_index` has completed
    /// (or none were ever assigned for it).
    async fn phase_tasks_complete(&self, phase_index: usize) -> bool {
        self.phase_tasks
            .lock()
            .await
            .get(&phase_index)
            .is_none_or(HashSet::is_empty)
    }

    fn lease_key(&self) -> String {
        "pop:coordinator:lease".to_string()
    }

    /// Acquires the session lease, failing if another coordinator already
    /// holds it.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::LeaseNotHeld`] if the compare-and-swap does
    /// not succeed.
    pub async fn acquire_lease(&self) -> Result<()> {
        let acquired = self
            .store
            .cas(&self.lease_key(), None, self.lease_holder.as_bytes())
            .await?;
        if acquired {
            Ok(())
        } else {
            Err(PowerModeError::LeaseNotHeld(
                "another coordinator holds the session lease".to_string(),
            ))
        }
    }

    /// Runs the coordinator until the objective reaches a terminal state or
    /// the lease is lost. Spawns and awaits the inbound pump, periodic tick,
    /// and lease renewer as one cooperating unit.
    ///
    /// # Errors
    ///
    /// Propagates any fatal error raised by the background tasks (lease
    /// surrendered, store unavailable).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.acquire_lease().await?;

        let pump = Arc::clone(&self).inbound_pump();
        let tick = Arc::clone(&self).periodic_tick();
        let lease = Arc::clone(&self).lease_renewer();

        tokio::try_join!(pump, tick, lease)?;
        Ok(())
    }

    fn is_done(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    async fn inbound_pump(self: Arc<Self>) -> Result<()> {
        let span = tracing::span!(tracing::Level::INFO, "inbound_pump");
        let _enter = span.enter();

        let client_id = format!("coordinator:{}", self.lease_holder);
        let mut cursors = Vec::new();
        for channel in INBOUND_CHANNELS {
            cursors.push((*channel, self.store.subscribe(channel, &client_id).await?));
        }

        while !self.is_done() {
            for (channel, cursor) in &mut cursors {
                let messages = cursor.poll().await?;
                for stored in messages {
                    let Ok(envelope) = decode(&stored.data) else {
                        tracing::warn!(channel = *channel, "dropping undecodable message");
                        continue;
                    };
                    self.dispatch(envelope).await?;
                }
            }
            tokio::time::sleep(self.config.file_poll_interval_ms.as_duration()).await;
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        match envelope.payload {
            MessagePayload::Heartbeat { .. } => {
                if let Sender::Agent(agent_id) = envelope.sender {
                    let _ = self.agents.record_heartbeat(agent_id);
                    self.agent_set.lock().await.insert(agent_id);
                }
            }
            MessagePayload::Checkin {
                files_touched,
                insights,
                ..
            } => {
                if let Sender::Agent(agent_id) = envelope.sender {
                    self.agent_set.lock().await.insert(agent_id);
                    let _ = self
                        .agents
                        .record_checkin(agent_id, crate::domain_types::ToolCallCount::default());
                    let boundaries = self.boundary_set().await;
                    let outcome =
                        self.guardrails
                            .check_checkin(agent_id, &files_touched, &[], &boundaries);
                    self.handle_guardrail_outcome(outcome).await?;
                    for insight in insights {
                        self.route_insight(insight).await?;
                    }
                }
            }
            MessagePayload::Insight { insight } => {
                self.route_insight(insight).await?;
            }
            MessagePayload::TaskComplete { task_id, ok, .. } => {
                if let Sender::Agent(agent_id) = envelope.sender {
                    let _ = self.agents.complete_task(agent_id, task_id);
                }
                if ok {
                    self.complete_phase_task(task_id).await?;
                } else {
                    tracing::warn!(%task_id, "task reported failure");
                }
            }
            MessagePayload::SyncAck { barrier_id } => {
                if let Sender::Agent(agent_id) = envelope.sender {
                    let _ = self.barriers.record_ack(barrier_id, agent_id);
                }
            }
            MessagePayload::HumanEscalate { category, context } => {
                self.counters.lock().await.human_escalations += 1;
                tracing::warn!(%category, %context, "human escalation received");
            }
            _ => {}
        }
        Ok(())
    }

    async fn boundary_set(&self) -> HashSet<String> {
        self.objective
            .lock()
            .await
            .boundaries
            .allowed_path_globs
            .iter()
            .cloned()
            .collect()
    }

    async fn handle_guardrail_outcome(&self, outcome: GuardrailOutcome) -> Result<()> {
        match outcome {
            GuardrailOutcome::Clean => Ok(()),
            GuardrailOutcome::CourseCorrect { agent_id, reason } => {
                let envelope = Envelope::new(
                    self.session_id,
                    Sender::Coordinator,
                    crate::domain_types::Seq::initial(),
                    Utc::now(),
                    MessagePayload::CourseCorrect { agent_id, reason },
                );
                self.store
                    .publish(&format!("pop:agent:{agent_id}"), &encode(&envelope)?)
                    .await
            }
            GuardrailOutcome::Escalate { agent_id } => {
                let _ = self.agents.set_draining(agent_id);
                self.counters.lock().await.human_escalations += 1;
                let envelope = Envelope::new(
                    self.session_id,
                    Sender::Coordinator,
                    crate::domain_types::Seq::initial(),
                    Utc::now(),
                    MessagePayload::HumanEscalate {
                        category: "boundary-violations".to_string(),
                        context: serde_json::json!({ "agent_id": agent_id.to_string() }),
                    },
                );
                self.store
                    .set(
                        &format!("pop:human:ack:{agent_id}"),
                        b"pending",
                        None,
                    )
                    .await?;
                self.store.publish("pop:human", &encode(&envelope)?).await
            }
            GuardrailOutcome::DriftAlert { agent_id, evidence } => {
                let envelope = Envelope::new(
                    self.session_id,
                    Sender::Coordinator,
                    crate::domain_types::Seq::initial(),
                    Utc::now(),
                    MessagePayload::DriftAlert { agent_id, evidence },
                );
                self.store
                    .publish(&format!("pop:agent:{agent_id}"), &encode(&envelope)?)
                    .await
            }
        }
    }

    async fn route_insight(&self, insight: crate::insight::Insight) -> Result<()> {
        let is_priority = insight.tags.contains(&Tag::Blocker) || insight.tags.contains(&Tag::Question);

        {
            let mut pending = self.pending_insights.lock().await;
            if !is_priority && pending.len() >= MAX_PENDING_INSIGHTS {
                tracing::warn!(insight_id = %insight.id, "dropping insight: inbox over capacity");
                return Ok(());
            }
            pending.push_back(insight.id);
        }

        let result = self.route_insight_inner(insight.clone()).await;
        self.pending_insights
            .lock()
            .await
            .retain(|id| *id != insight.id);
        result
    }

    async fn route_insight_inner(&self, insight: crate::insight::Insight) -> Result<()> {
        self.counters.lock().await.insights_emitted += 1;
        let active_ids: Vec<AgentId> = self.agents.active_agent_ids().into_iter().collect();

        if insight.tags.contains(&Tag::Pattern) {
            self.store
                .hset(
                    &format!("pop:patterns:{}", insight.id),
                    "payload",
                    &serde_json::to_vec(&insight.payload)?,
                )
                .await?;
        }

        let outcome = self.insight_router.route(&insight, &active_ids);
        match outcome {
            RouteOutcome::Delivered(targets) => {
                for agent_id in targets {
                    let envelope = Envelope::new(
                        self.session_id,
                        Sender::Coordinator,
                        crate::domain_types::Seq::initial(),
                        Utc::now(),
                        MessagePayload::Insight {
                            insight: insight.clone(),
                        },
                    );
                    self.store
                        .publish(&format!("pop:agent:{agent_id}"), &encode(&envelope)?)
                        .await?;
                }
            }
            RouteOutcome::Orphaned => {
                self.store
                    .lpush("pop:orphaned_insights", &serde_json::to_vec(&insight)?)
                    .await?;
            }
            RouteOutcome::EscalatedAsQuestion => {
                self.counters.lock().await.human_escalations += 1;
                let envelope = Envelope::new(
                    self.session_id,
                    Sender::Coordinator,
                    crate::domain_types::Seq::initial(),
                    Utc::now(),
                    MessagePayload::HumanEscalate {
                        category: "question".to_string(),
                        context: insight.payload.clone(),
                    },
                );
                self.store.publish("pop:human", &encode(&envelope)?).await?;
            }
        }

        if insight.tags.contains(&Tag::Blocker) {
            let envelope = Envelope::new(
                self.session_id,
                Sender::Coordinator,
                crate::domain_types::Seq::initial(),
                Utc::now(),
                MessagePayload::Insight { insight },
            );
            self.store.publish("pop:coordinator", &encode(&envelope)?).await?;
        }
        Ok(())
    }

    async fn periodic_tick(self: Arc<Self>) -> Result<()> {
        let span = tracing::span!(tracing::Level::INFO, "periodic_tick");
        let _enter = span.enter();

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        while !self.is_done() {
            interval.tick().await;
            self.reap_and_reassign().await?;
            self.evaluate_phase().await?;
            self.evaluate_completion().await?;
            self.evaluate_hard_cap().await?;
        }
        Ok(())
    }

    async fn reap_and_reassign(&self) -> Result<()> {
        let grace = self.config.heartbeat_seconds.reap_grace();
        let events = self.agents.reap(grace);
        for event in events {
            self.barriers.remove_from_open_barriers(event.agent_id);
            let envelope = Envelope::new(
                self.session_id,
                Sender::Coordinator,
                crate::domain_types::Seq::initial(),
                Utc::now(),
                MessagePayload::AgentDown {
                    agent_id: event.agent_id,
                },
            );
            self.store.publish("pop:broadcast", &encode(&envelope)?).await?;

            for task_id in event.orphaned_tasks {
                self.reassign_orphan_task(task_id).await?;
            }
        }
        Ok(())
    }

    async fn reassign_orphan_task(&self, task_id: TaskId) -> Result<()> {
        let candidates = self.agents.active_agents_by_type(None);
        if let Some(candidate) = candidates.first() {
            self.agents
                .assign_task(candidate.id, task_id, serde_json::json!({}))?;
            let envelope = Envelope::new(
                self.session_id,
                Sender::Coordinator,
                crate::domain_types::Seq::initial(),
                Utc::now(),
                MessagePayload::TaskAssign {
                    task_id,
                    agent_id: candidate.id,
                    payload: serde_json::json!({}),
                    deadline: Utc::now() + chrono::Duration::minutes(30),
                },
            );
            self.store
                .publish(&format!("pop:agent:{}", candidate.id), &encode(&envelope)?)
                .await?;
            self.counters.lock().await.orphan_reassignments += 1;
        } else {
            self.store
                .lpush("pop:tasks:orphaned", &serde_json::to_vec(&task_id)?)
                .await?;
            self.counters.lock().await.human_escalations += 1;
            let envelope = Envelope::new(
                self.session_id,
                Sender::Coordinator,
                crate::domain_types::Seq::initial(),
                Utc::now(),
                MessagePayload::HumanEscalate {
                    category: "no-available-agent".to_string(),
                    context: serde_json::json!({ "task_id": task_id.to_string() }),
                },
            );
            self.store.publish("pop:human", &encode(&envelope)?).await?;
        }
        Ok(())
    }

    async fn evaluate_phase(&self) -> Result<()> {
        let now = Utc::now();
        let expired = self.barriers.expire_overdue(now);
        for barrier in &expired {
            for agent_id in barrier.stragglers() {
                let insight = crate::insight::Insight::new(
                    agent_id,
                    "barrier".to_string(),
                    std::collections::BTreeSet::from([Tag::BarrierMiss]),
                    serde_json::json!({ "barrier_id": barrier.id.to_string() }),
                );
                self.store
                    .lpush("pop:orphaned_insights", &serde_json::to_vec(&insight)?)
                    .await?;
            }
        }

        let mut objective = self.objective.lock().await;
        if objective.lifecycle != ObjectiveLifecycle::Running
            && objective.lifecycle != ObjectiveLifecycle::Draft
        {
            return Ok(());
        }
        objective.lifecycle = ObjectiveLifecycle::Running;

        let phase_index = objective.current_phase_index;
        if !self.phase_tasks_complete(phase_index).await || !objective.all_criteria_met() {
            return Ok(());
        }

        let mut current_barrier = self.current_phase_barrier.lock().await;
        let barrier_id = match *current_barrier {
            Some(id) => id,
            None => {
                let agent_ids = self.agents.active_agent_ids();
                let deadline = now + self.config.barrier_deadline_seconds.as_duration();
                let id =
                    self.barriers
                        .open_barrier(objective.current_phase_index, agent_ids, deadline);
                *current_barrier = Some(id);
                id
            }
        };

        if self.barriers.status(barrier_id)? == BarrierStatus::Open {
            return Ok(());
        }
        *current_barrier = None;
        drop(current_barrier);

        match objective.advance(true)? {
            AdvanceOutcome::NewPhase(new_phase_index) => {
                let envelope = Envelope::new(
                    self.session_id,
                    Sender::Coordinator,
                    crate::domain_types::Seq::initial(),
                    Utc::now(),
                    MessagePayload::PhaseAdvance { new_phase_index },
                );
                self.store.publish("pop:broadcast", &encode(&envelope)?).await?;
            }
            AdvanceOutcome::ObjectiveComplete => {}
        }
        Ok(())
    }

    async fn evaluate_completion(&self) -> Result<()> {
        let lifecycle = self.objective.lock().await.lifecycle;
        if lifecycle != ObjectiveLifecycle::Completed {
            return Ok(());
        }
        if self.is_done() {
            return Ok(());
        }

        let phases_elapsed = self.objective.lock().await.current_phase_index + 1;
        let counters = self.counters.lock().await;
        let summary = CompletionSummary {
            phases_elapsed,
            agents: self.agent_set.lock().await.len(),
            insights_emitted: counters.insights_emitted,
            orphan_reassignments: counters.orphan_reassignments,
            human_escalations: counters.human_escalations,
        };
        drop(counters);

        self.store
            .set(
                &format!("pop:completed:{}", self.session_id),
                &serde_json::to_vec(&summary)?,
                Some(crate::domain_types::TtlSeconds::one_day().into_inner()),
            )
            .await?;

        let envelope = Envelope::new(
            self.session_id,
            Sender::Coordinator,
            crate::domain_types::Seq::initial(),
            Utc::now(),
            MessagePayload::ObjectiveComplete {
                summary: format!("{phases_elapsed} phases elapsed"),
            },
        );
        self.store.publish("pop:broadcast", &encode(&envelope)?).await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn evaluate_hard_cap(&self) -> Result<()> {
        // Caller is expected to track session start time externally and call
        // `fail_session` directly once `max_runtime_minutes` elapses; this
        // hook exists so `periodic_tick` has a single place to extend.
        Ok(())
    }

    /// Marks the objective failed (e.g. the session hard-cap elapsed) and
    /// broadcasts `OBJECTIVE_FAILED`.
    ///
    /// # Errors
    ///
    /// Propagates any store error while publishing the broadcast.
    pub async fn fail_session(&self, reason: &str) -> Result<()> {
        self.objective.lock().await.lifecycle = ObjectiveLifecycle::Failed;
        let envelope = Envelope::new(
            self.session_id,
            Sender::Coordinator,
            crate::domain_types::Seq::initial(),
            Utc::now(),
            MessagePayload::ObjectiveFailed {
                summary: reason.to_string(),
            },
        );
        self.store.publish("pop:broadcast", &encode(&envelope)?).await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn lease_renewer(self: Arc<Self>) -> Result<()> {
        let span = tracing::span!(tracing::Level::INFO, "lease_renewer");
        let _enter = span.enter();

        let mut interval = tokio::time::interval(self.config.lease_ttl_seconds.renewal_interval());
        while !self.is_done() {
            interval.tick().await;
            let renewed = self
                .store
                .cas(
                    &self.lease_key(),
                    Some(self.lease_holder.as_bytes()),
                    self.lease_holder.as_bytes(),
                )
                .await?;
            if !renewed {
                tracing::error!("coordinator lease lost, surrendering");
                self.running.store(false, Ordering::SeqCst);
                return Err(PowerModeError::LeaseNotHeld(
                    "lease renewal failed, another coordinator may be active".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::GuardrailConfig;
    use crate::objective::Boundaries;
    use crate::store::file::FileStore;

    async fn test_coordinator() -> (Arc<Coordinator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StoreBackend> = Arc::new(FileStore::new(
            dir.path(),
            crate::domain_types::FileLockTimeoutSeconds::try_new(5).unwrap(),
            crate::domain_types::MaxMessagesPerChannel::try_new(100).unwrap(),
        ));
        let session_id = SessionId::generate();
        let objective = Objective::create(
            session_id,
            "prove concept".to_string(),
            vec!["criterion".to_string()],
            vec!["build".to_string()],
            Boundaries::default(),
        )
        .unwrap();
        let coordinator = Coordinator::new(
            session_id,
            PowerModeConfig::testing(),
            store,
            objective,
            GuardrailEngine::new(GuardrailConfig::default()),
        );
        (Arc::new(coordinator), dir)
    }

    #[tokio::test]
    async fn acquire_lease_succeeds_once() {
        let (coordinator, _dir) = test_coordinator().await;
        coordinator.acquire_lease().await.unwrap();
    }

    #[tokio::test]
    async fn second_coordinator_cannot_acquire_held_lease() {
        let (coordinator, dir) = test_coordinator().await;
        coordinator.acquire_lease().await.unwrap();

        let store: Arc<dyn StoreBackend> = Arc::new(FileStore::new(
            dir.path(),
            crate::domain_types::FileLockTimeoutSeconds::try_new(5).unwrap(),
            crate::domain_types::MaxMessagesPerChannel::try_new(100).unwrap(),
        ));
        let session_id = SessionId::generate();
        let objective = Objective::create(
            session_id,
            "x".to_string(),
            vec![],
            vec!["build".to_string()],
            Boundaries::default(),
        )
        .unwrap();
        let second = Coordinator::new(
            session_id,
            PowerModeConfig::testing(),
            store,
            objective,
            GuardrailEngine::new(GuardrailConfig::default()),
        );
        assert!(second.acquire_lease().await.is_err());
    }

    #[tokio::test]
    async fn fail_session_broadcasts_objective_failed() {
        let (coordinator, _dir) = test_coordinator().await;
        coordinator.fail_session("hard cap exceeded").await.unwrap();
        assert!(coordinator.is_done());
    }

    #[tokio::test]
    async fn task_complete_marks_criterion_and_completes_single_phase_objective() {
        let (coordinator, _dir) = test_coordinator().await;
        let agent_id = coordinator
            .register_agent(
                AgentType::try_new("implementer".to_string()).unwrap(),
                vec!["build".to_string()],
            )
            .await;
        let task_id = TaskId::generate();
        coordinator
            .assign_task(
                agent_id,
                task_id,
                0,
                serde_json::json!({}),
                Utc::now() + chrono::Duration::minutes(5),
                Some(0),
            )
            .await
            .unwrap();

        assert!(!coordinator.objective.lock().await.all_criteria_met());

        let envelope = Envelope::new(
            coordinator.session_id,
            Sender::Agent(agent_id),
            crate::domain_types::Seq::initial(),
            Utc::now(),
            MessagePayload::TaskComplete {
                task_id,
                result: serde_json::json!({}),
                ok: true,
            },
        );
        coordinator.dispatch(envelope).await.unwrap();

        assert!(coordinator.objective.lock().await.all_criteria_met());
        assert!(coordinator.phase_tasks_complete(0).await);

        // First pass opens the phase's sync barrier; the lone participant
        // must ack before the second pass can advance the objective.
        coordinator.evaluate_phase().await.unwrap();
        assert_eq!(
            coordinator.objective.lock().await.lifecycle,
            ObjectiveLifecycle::Running
        );

        let barrier_id = coordinator.current_phase_barrier.lock().await.unwrap();
        let ack = Envelope::new(
            coordinator.session_id,
            Sender::Agent(agent_id),
            crate::domain_types::Seq::initial(),
            Utc::now(),
            MessagePayload::SyncAck { barrier_id },
        );
        coordinator.dispatch(ack).await.unwrap();

        coordinator.evaluate_phase().await.unwrap();
        assert_eq!(
            coordinator.objective.lock().await.lifecycle,
            ObjectiveLifecycle::Completed
        );
    }

    #[tokio::test]
    async fn low_priority_insight_is_dropped_once_inbox_is_at_capacity() {
        let (coordinator, _dir) = test_coordinator().await;
        for _ in 0..MAX_PENDING_INSIGHTS {
            let insight = crate::insight::Insight::new(
                AgentId::generate(),
                "build".to_string(),
                std::collections::BTreeSet::from([Tag::File]),
                serde_json::json!({}),
            );
            coordinator.route_insight(insight).await.unwrap();
        }
        assert_eq!(
            coordinator.counters.lock().await.insights_emitted,
            MAX_PENDING_INSIGHTS as u64
        );

        let overflow = crate::insight::Insight::new(
            AgentId::generate(),
            "build".to_string(),
            std::collections::BTreeSet::from([Tag::File]),
            serde_json::json!({}),
        );
        coordinator.route_insight(overflow).await.unwrap();

        assert_eq!(
            coordinator.counters.lock().await.insights_emitted,
            MAX_PENDING_INSIGHTS as u64,
            "overflow insight must be dropped, not routed"
        );
    }
}
