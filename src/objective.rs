//! Objective Model: the goal, its phases, success criteria and
//! boundaries, and the session identity it is scoped to.

use serde::{Deserialize, Serialize};

use crate::domain_types::SessionId;
use crate::error::{PowerModeError, Result};

/// Lifecycle of an objective: `draft → running → completed | failed | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveLifecycle {
    /// Created but not yet started.
    Draft,
    /// Actively being worked.
    Running,
    /// All success criteria met.
    Completed,
    /// Terminated without meeting all criteria (e.g. session timeout).
    Failed,
    /// Terminated by external request.
    Cancelled,
}

/// One success-criterion predicate and whether it has been met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    /// Human-readable predicate text.
    pub text: String,
    /// Whether this criterion has been satisfied.
    pub met: bool,
}

/// File-glob patterns agents may touch, and tool names they may not invoke.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundaries {
    /// Glob patterns describing the files an agent is permitted to touch.
    pub allowed_path_globs: Vec<String>,
    /// Tool names no agent may invoke for this objective.
    pub forbidden_tools: Vec<String>,
}

/// The goal a session exists to pursue, decomposed into ordered phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    /// The session this objective is scoped to.
    pub session_id: SessionId,
    /// Human-readable description of the goal.
    pub description: String,
    /// Ordered success-criteria predicates.
    pub success_criteria: Vec<SuccessCriterion>,
    /// Non-empty ordered phase names (e.g. explore, design, implement).
    pub phases: Vec<String>,
    /// Always `0 <= current_phase_index < phases.len()`, and monotonic.
    pub current_phase_index: usize,
    /// File-glob and forbidden-tool boundaries agents must respect.
    pub boundaries: Boundaries,
    /// Current lifecycle state.
    pub lifecycle: ObjectiveLifecycle,
}

impl Objective {
    /// Creates a new objective in the `draft` lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::ContractViolation`] if `phases` is empty.
    pub fn create(
        session_id: SessionId,
        description: String,
        criteria: Vec<String>,
        phases: Vec<String>,
        boundaries: Boundaries,
    ) -> Result<Self> {
        if phases.is_empty() {
            return Err(PowerModeError::ContractViolation(
                "an objective must have at least one phase".to_string(),
            ));
        }
        Ok(Self {
            session_id,
            description,
            success_criteria: criteria
                .into_iter()
                .map(|text| SuccessCriterion { text, met: false })
                .collect(),
            phases,
            current_phase_index: 0,
            boundaries,
            lifecycle: ObjectiveLifecycle::Draft,
        })
    }

    /// The name of the current phase.
    #[must_use]
    pub fn current_phase(&self) -> &str {
        &self.phases[self.current_phase_index]
    }

    /// True once `current_phase_index` names the last phase.
    #[must_use]
    pub fn is_final_phase(&self) -> bool {
        self.current_phase_index + 1 >= self.phases.len()
    }

    /// Marks one success criterion met or unmet.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::NotFound`] if `index` is out of range.
    pub fn mark_criterion(&mut self, index: usize, met: bool) -> Result<()> {
        let criterion = self
            .success_criteria
            .get_mut(index)
            .ok_or_else(|| PowerModeError::NotFound(format!("success criterion {index}")))?;
        criterion.met = met;
        Ok(())
    }

    /// True once every success criterion is met.
    #[must_use]
    pub fn all_criteria_met(&self) -> bool {
        self.success_criteria.iter().all(|c| c.met)
    }

    /// Advances to the next phase, provided the current phase's barrier has
    /// released (caller passes the authoritative answer; this model does not
    /// itself track barriers — that is the sync barrier manager's job).
    ///
    /// Enforces monotonic, bounded phase progression: a barrier must be
    /// released or timed out before advancing past its phase.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::InvalidState`] with `BarrierOpen` semantics
    /// if `barrier_released` is false, or if the objective is already past
    /// its final phase.
    pub fn advance(&mut self, barrier_released: bool) -> Result<AdvanceOutcome> {
        if !barrier_released {
            return Err(PowerModeError::InvalidState(
                "BarrierOpen: current phase's barrier has not released".to_string(),
            ));
        }
        if self.is_final_phase() {
            self.lifecycle = ObjectiveLifecycle::Completed;
            return Ok(AdvanceOutcome::ObjectiveComplete);
        }
        self.current_phase_index += 1;
        Ok(AdvanceOutcome::NewPhase(self.current_phase_index))
    }

    /// Serializes for storage under `pop:objective`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes from the `pop:objective` key's bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::Serialization`] if the bytes do not parse.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The result of a successful [`Objective::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Moved to a new, still-in-progress phase.
    NewPhase(usize),
    /// The objective has completed; there is no further phase.
    ObjectiveComplete,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Objective {
        Objective::create(
            SessionId::generate(),
            "prove concept".to_string(),
            vec!["spec written".to_string(), "prototype runs".to_string()],
            vec!["design".to_string(), "build".to_string()],
            Boundaries::default(),
        )
        .unwrap()
    }

    #[test]
    fn create_rejects_empty_phases() {
        let err = Objective::create(
            SessionId::generate(),
            "x".to_string(),
            vec![],
            vec![],
            Boundaries::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PowerModeError::ContractViolation(_)));
    }

    #[test]
    fn advance_fails_while_barrier_open() {
        let mut objective = sample();
        let err = objective.advance(false).unwrap_err();
        assert!(matches!(err, PowerModeError::InvalidState(_)));
        assert_eq!(objective.current_phase_index, 0);
    }

    #[test]
    fn advance_is_monotonic_and_bounded() {
        let mut objective = sample();
        assert_eq!(objective.advance(true).unwrap(), AdvanceOutcome::NewPhase(1));
        assert_eq!(objective.current_phase_index, 1);
        assert_eq!(objective.advance(true).unwrap(), AdvanceOutcome::ObjectiveComplete);
        assert_eq!(objective.lifecycle, ObjectiveLifecycle::Completed);
    }

    #[test]
    fn serialize_round_trips() {
        let objective = sample();
        let bytes = objective.serialize().unwrap();
        let decoded = Objective::deserialize(&bytes).unwrap();
        assert_eq!(objective, decoded);
    }

    proptest! {
        #[test]
        fn advance_is_always_monotonic_and_bounded(releases in proptest::collection::vec(any::<bool>(), 1..20), phase_count in 1usize..6) {
            let mut objective = Objective::create(
                SessionId::generate(),
                "property test".to_string(),
                vec![],
                (0..phase_count).map(|i| format!("phase-{i}")).collect(),
                Boundaries::default(),
            )
            .unwrap();

            let mut last_index = objective.current_phase_index;
            for released in releases {
                let before = objective.current_phase_index;
                match objective.advance(released) {
                    Ok(_) => {
                        prop_assert!(objective.current_phase_index >= before);
                        prop_assert!(objective.current_phase_index < phase_count);
                    }
                    Err(_) => {
                        prop_assert_eq!(objective.current_phase_index, before);
                    }
                }
                prop_assert!(objective.current_phase_index >= last_index);
                last_index = objective.current_phase_index;
                if objective.lifecycle == ObjectiveLifecycle::Completed {
                    break;
                }
            }
        }
    }
}
