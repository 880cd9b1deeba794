//! Agent Registry & Heartbeat Tracker.
//!
//! A concurrent map of agent records plus a secondary index, with simple
//! accessor methods rather than a heavyweight query layer.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::domain_types::{AgentId, AgentType, MissedHeartbeats, ToolCallCount};
use crate::error::{PowerModeError, Result};

/// Lifecycle of an agent: `registered → active → (draining | down) → retired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registered but has not yet sent its first heartbeat.
    Registered,
    /// Sending heartbeats and available for task assignment.
    Active,
    /// Winding down voluntarily; no new tasks assigned.
    Draining,
    /// Reaped after missing too many heartbeats.
    Down,
    /// Permanently removed from coordination.
    Retired,
}

/// One agent's coordinator-owned record, plus the two fields the agent
/// itself owns and publishes (`tool_call_count`, `current_task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique id, scoped to the session.
    pub id: AgentId,
    /// Opaque role label, used by the Insight Router as a routing hint.
    pub agent_type: AgentType,
    /// Current lifecycle state.
    pub state: AgentState,
    /// Last heartbeat timestamp observed by the coordinator.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Last check-in timestamp observed by the coordinator.
    pub last_checkin_at: Option<DateTime<Utc>>,
    /// Subset of objective phases this agent is assigned to.
    pub assigned_phases: Vec<String>,
    /// Opaque task payload, owned and published by the agent.
    pub current_task: Option<serde_json::Value>,
    /// Monotonic tool-call counter, owned and published by the agent.
    pub tool_call_count: ToolCallCount,
    /// Ordered tasks accepted but not yet acknowledged or reassigned.
    pub pending_tasks: Vec<crate::domain_types::TaskId>,
    /// Consecutive missed heartbeats since the last one observed.
    pub missed_heartbeats: MissedHeartbeats,
}

impl AgentRecord {
    fn new(id: AgentId, agent_type: AgentType, assigned_phases: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            agent_type,
            state: AgentState::Registered,
            last_heartbeat_at: now,
            last_checkin_at: None,
            assigned_phases,
            current_task: None,
            tool_call_count: ToolCallCount::default(),
            pending_tasks: Vec::new(),
            missed_heartbeats: MissedHeartbeats::default(),
        }
    }
}

/// An `AGENT_DOWN` transition produced by [`AgentRegistry::reap`].
#[derive(Debug, Clone)]
pub struct AgentDownEvent {
    /// The agent that was reaped.
    pub agent_id: AgentId,
    /// The tasks moved to the global orphan queue.
    pub orphaned_tasks: Vec<crate::domain_types::TaskId>,
}

/// Concurrent registry of every agent in a session.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentRecord>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Registers a new agent in the `registered` state.
    #[must_use]
    pub fn register(&self, agent_type: AgentType, assigned_phases: Vec<String>) -> AgentId {
        let id = AgentId::generate();
        self.agents
            .insert(id, AgentRecord::new(id, agent_type, assigned_phases, Utc::now()));
        id
    }

    /// Records a heartbeat: resets the missed-heartbeat counter, updates
    /// `last_heartbeat_at`, and transitions `registered -> active` on first
    /// contact.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `agent_id` is unknown.
    pub fn record_heartbeat(&self, agent_id: AgentId) -> Result<()> {
        let mut record = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| PowerModeError::NotFound(format!("agent {agent_id}")))?;
        record.last_heartbeat_at = Utc::now();
        record.missed_heartbeats = MissedHeartbeats::default();
        if record.state == AgentState::Registered {
            record.state = AgentState::Active;
        }
        Ok(())
    }

    /// Updates `last_checkin_at`, `tool_call_count`, and `current_task` from
    /// an agent-published check-in or task-complete.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `agent_id` is unknown.
    pub fn record_checkin(&self, agent_id: AgentId, tool_call_count: ToolCallCount) -> Result<()> {
        let mut record = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| PowerModeError::NotFound(format!("agent {agent_id}")))?;
        record.last_checkin_at = Some(Utc::now());
        record.tool_call_count = tool_call_count;
        Ok(())
    }

    /// Returns a snapshot of one agent's record.
    #[must_use]
    pub fn get(&self, agent_id: AgentId) -> Option<AgentRecord> {
        self.agents.get(&agent_id).map(|r| r.clone())
    }

    /// Lists every agent currently `active`.
    #[must_use]
    pub fn active_agents(&self) -> Vec<AgentRecord> {
        self.agents
            .iter()
            .filter(|r| r.state == AgentState::Active)
            .map(|r| r.clone())
            .collect()
    }

    /// Lists active agents whose type matches, or every active agent if
    /// `required_type` is `None` (used by failover task reassignment).
    #[must_use]
    pub fn active_agents_by_type(&self, required_type: Option<&AgentType>) -> Vec<AgentRecord> {
        self.agents
            .iter()
            .filter(|r| {
                r.state == AgentState::Active
                    && required_type.is_none_or(|t| &r.agent_type == t)
            })
            .map(|r| r.clone())
            .collect()
    }

    /// Appends `task_id` to `agent_id`'s pending-task list.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `agent_id` is unknown.
    pub fn assign_task(
        &self,
        agent_id: AgentId,
        task_id: crate::domain_types::TaskId,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut record = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| PowerModeError::NotFound(format!("agent {agent_id}")))?;
        record.pending_tasks.push(task_id);
        record.current_task = Some(payload);
        Ok(())
    }

    /// Removes `task_id` from `agent_id`'s pending-task list once
    /// acknowledged (`TASK_COMPLETE`) or reassigned elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `agent_id` is unknown.
    pub fn complete_task(
        &self,
        agent_id: AgentId,
        task_id: crate::domain_types::TaskId,
    ) -> Result<()> {
        let mut record = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| PowerModeError::NotFound(format!("agent {agent_id}")))?;
        record.pending_tasks.retain(|t| *t != task_id);
        Ok(())
    }

    /// Scans every `registered`/`active` agent and reaps any whose
    /// `last_heartbeat_at` is older than `3 * heartbeat_interval`.
    ///
    /// Reaped agents transition to `down`, their pending tasks are returned
    /// for the caller to push onto `pop:tasks:orphaned`, and they are
    /// excluded from future `active_agents*` queries.
    #[must_use]
    pub fn reap(&self, grace: std::time::Duration) -> Vec<AgentDownEvent> {
        let now = Utc::now();
        let mut events = Vec::new();
        for mut entry in self.agents.iter_mut() {
            if matches!(entry.state, AgentState::Registered | AgentState::Active)
                && now.signed_duration_since(entry.last_heartbeat_at)
                    > chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero())
            {
                entry.missed_heartbeats = entry.missed_heartbeats.increment();
                if entry.missed_heartbeats.should_reap() {
                    entry.state = AgentState::Down;
                    let orphaned_tasks = std::mem::take(&mut entry.pending_tasks);
                    entry.current_task = None;
                    events.push(AgentDownEvent {
                        agent_id: entry.id,
                        orphaned_tasks,
                    });
                }
            }
        }
        events
    }

    /// The set of agent ids currently in any non-terminal state, used as the
    /// `required_agent_ids` snapshot when opening a new barrier.
    #[must_use]
    pub fn active_agent_ids(&self) -> HashSet<AgentId> {
        self.active_agents().into_iter().map(|r| r.id).collect()
    }

    /// Pauses dispatch to an agent pending human acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `agent_id` is unknown.
    pub fn set_draining(&self, agent_id: AgentId) -> Result<()> {
        let mut record = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| PowerModeError::NotFound(format!("agent {agent_id}")))?;
        record.state = AgentState::Draining;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn agent_type() -> AgentType {
        AgentType::try_new("implementer".to_string()).unwrap()
    }

    #[test]
    fn register_then_heartbeat_transitions_to_active() {
        let registry = AgentRegistry::new();
        let id = registry.register(agent_type(), vec!["build".to_string()]);
        assert_eq!(registry.get(id).unwrap().state, AgentState::Registered);
        registry.record_heartbeat(id).unwrap();
        assert_eq!(registry.get(id).unwrap().state, AgentState::Active);
    }

    #[test]
    fn reap_marks_down_after_three_missed_heartbeats() {
        let registry = AgentRegistry::new();
        let id = registry.register(agent_type(), vec![]);
        registry.record_heartbeat(id).unwrap();
        registry
            .agents
            .get_mut(&id)
            .unwrap()
            .last_heartbeat_at = Utc::now() - chrono::Duration::seconds(1000);
        let grace = Duration::from_secs(1);
        assert!(registry.reap(grace).is_empty());
        assert!(registry.reap(grace).is_empty());
        let events = registry.reap(grace);
        assert_eq!(events.len(), 1);
        assert_eq!(registry.get(id).unwrap().state, AgentState::Down);
    }

    #[test]
    fn reap_moves_pending_tasks_to_orphan_event() {
        let registry = AgentRegistry::new();
        let id = registry.register(agent_type(), vec![]);
        registry.record_heartbeat(id).unwrap();
        let task_id = crate::domain_types::TaskId::generate();
        registry
            .assign_task(id, task_id, serde_json::json!({"step": 1}))
            .unwrap();
        registry
            .agents
            .get_mut(&id)
            .unwrap()
            .last_heartbeat_at = Utc::now() - chrono::Duration::seconds(1000);
        let grace = Duration::from_secs(1);
        registry.reap(grace);
        registry.reap(grace);
        let events = registry.reap(grace);
        assert_eq!(events[0].orphaned_tasks, vec![task_id]);
    }
}
