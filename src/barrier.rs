//! Sync Barrier Manager: per-phase rendezvous with quorum and timeout.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::domain_types::{AgentId, BarrierId};
use crate::error::{PowerModeError, Result};

/// `open → released | timed_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierStatus {
    /// Awaiting acknowledgements.
    Open,
    /// Every required participant acked before the deadline.
    Released,
    /// The deadline elapsed with at least one participant un-acked.
    TimedOut,
}

/// Per-phase transition rendezvous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barrier {
    /// Unique id.
    pub id: BarrierId,
    /// The phase index this barrier gates.
    pub phase_index: usize,
    /// Snapshot of active agents at barrier creation.
    pub required_agent_ids: HashSet<AgentId>,
    /// Agents that have acknowledged so far.
    pub acknowledged_agent_ids: HashSet<AgentId>,
    /// When this barrier must resolve by.
    pub deadline: DateTime<Utc>,
    /// Current status.
    pub status: BarrierStatus,
}

impl Barrier {
    /// True once every required participant has acked.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.required_agent_ids
            .is_subset(&self.acknowledged_agent_ids)
    }

    /// Participants that never acked; recorded as `barrier-miss` insights on
    /// timeout.
    #[must_use]
    pub fn stragglers(&self) -> HashSet<AgentId> {
        self.required_agent_ids
            .difference(&self.acknowledged_agent_ids)
            .copied()
            .collect()
    }
}

/// Manages every barrier in a session. A barrier, once resolved, is never
/// retried — a fresh barrier is opened for the next phase transition.
#[derive(Default)]
pub struct BarrierManager {
    barriers: DashMap<BarrierId, Barrier>,
}

impl BarrierManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            barriers: DashMap::new(),
        }
    }

    /// Opens a new barrier for `phase_index`, snapshotting `participants` as
    /// the required acknowledgers.
    #[must_use]
    pub fn open_barrier(
        &self,
        phase_index: usize,
        participants: HashSet<AgentId>,
        deadline: DateTime<Utc>,
    ) -> BarrierId {
        let id = BarrierId::generate();
        self.barriers.insert(
            id,
            Barrier {
                id,
                phase_index,
                required_agent_ids: participants,
                acknowledged_agent_ids: HashSet::new(),
                deadline,
                status: BarrierStatus::Open,
            },
        );
        id
    }

    /// Idempotently records an acknowledgement. Releases the barrier if this
    /// was the last required participant.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `barrier_id` is unknown.
    pub fn record_ack(&self, barrier_id: BarrierId, agent_id: AgentId) -> Result<BarrierStatus> {
        let mut barrier = self
            .barriers
            .get_mut(&barrier_id)
            .ok_or_else(|| PowerModeError::NotFound(format!("barrier {barrier_id}")))?;
        if barrier.status == BarrierStatus::Open {
            barrier.acknowledged_agent_ids.insert(agent_id);
            if barrier.is_satisfied() {
                barrier.status = BarrierStatus::Released;
            }
        }
        Ok(barrier.status)
    }

    /// Current status of a barrier.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `barrier_id` is unknown.
    pub fn status(&self, barrier_id: BarrierId) -> Result<BarrierStatus> {
        self.barriers
            .get(&barrier_id)
            .map(|b| b.status)
            .ok_or_else(|| PowerModeError::NotFound(format!("barrier {barrier_id}")))
    }

    /// Forces a barrier to `released` (used when all required participants
    /// have acked, called by [`Self::record_ack`] internally, exposed for
    /// the coordinator's explicit confirmation step).
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `barrier_id` is unknown.
    pub fn release(&self, barrier_id: BarrierId) -> Result<()> {
        let mut barrier = self
            .barriers
            .get_mut(&barrier_id)
            .ok_or_else(|| PowerModeError::NotFound(format!("barrier {barrier_id}")))?;
        barrier.status = BarrierStatus::Released;
        Ok(())
    }

    /// Transitions any `open` barrier whose deadline has passed to
    /// `timed_out`, returning the ones that just transitioned so the caller
    /// can record `barrier-miss` insights for their stragglers.
    #[must_use]
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<Barrier> {
        let mut expired = Vec::new();
        for mut entry in self.barriers.iter_mut() {
            if entry.status == BarrierStatus::Open && entry.deadline <= now {
                entry.status = BarrierStatus::TimedOut;
                expired.push(entry.clone());
            }
        }
        expired
    }

    /// Removes an agent from any still-`open` barrier's required set (called
    /// when the Agent Registry reaps that agent).
    pub fn remove_from_open_barriers(&self, agent_id: AgentId) {
        for mut entry in self.barriers.iter_mut() {
            if entry.status == BarrierStatus::Open {
                entry.required_agent_ids.remove(&agent_id);
                if entry.is_satisfied() {
                    entry.status = BarrierStatus::Released;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_releases_once_all_required_ack() {
        let manager = BarrierManager::new();
        let a1 = AgentId::generate();
        let a2 = AgentId::generate();
        let id = manager.open_barrier(
            0,
            HashSet::from([a1, a2]),
            Utc::now() + chrono::Duration::seconds(120),
        );
        assert_eq!(manager.record_ack(id, a1).unwrap(), BarrierStatus::Open);
        assert_eq!(manager.record_ack(id, a2).unwrap(), BarrierStatus::Released);
    }

    #[test]
    fn record_ack_is_idempotent() {
        let manager = BarrierManager::new();
        let a1 = AgentId::generate();
        let id = manager.open_barrier(0, HashSet::from([a1]), Utc::now());
        manager.record_ack(id, a1).unwrap();
        assert_eq!(manager.record_ack(id, a1).unwrap(), BarrierStatus::Released);
    }

    #[test]
    fn overdue_barrier_times_out_with_stragglers() {
        let manager = BarrierManager::new();
        let a1 = AgentId::generate();
        let a2 = AgentId::generate();
        let id = manager.open_barrier(
            0,
            HashSet::from([a1, a2]),
            Utc::now() - chrono::Duration::seconds(1),
        );
        manager.record_ack(id, a1).unwrap();
        let expired = manager.expire_overdue(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].stragglers(), HashSet::from([a2]));
    }

    #[test]
    fn released_status_implies_required_subset_of_acknowledged() {
        let manager = BarrierManager::new();
        let a1 = AgentId::generate();
        let id = manager.open_barrier(0, HashSet::from([a1]), Utc::now());
        manager.record_ack(id, a1).unwrap();
        let barrier = manager
            .barriers
            .get(&id)
            .map(|b| b.clone())
            .unwrap();
        if barrier.status == BarrierStatus::Released {
            assert!(barrier
                .required_agent_ids
                .is_subset(&barrier.acknowledged_agent_ids));
        }
    }
}
