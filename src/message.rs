//! Message Codec
//!
//! A closed tagged union for every message that crosses the Store Backend,
//! wrapped in an envelope carrying routing and ordering metadata. Encoding is
//! `serde_json` under the hood; decoding rejects payloads missing a required
//! field for the variant named by `type`, while tolerating unknown top-level
//! fields so that future senders can add optional data without breaking
//! older receivers (schema_version is carried for the same reason).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain_types::{AgentId, BarrierId, InsightId, Seq, SessionId, TaskId};
use crate::error::{PowerModeError, Result};
use crate::insight::{Insight, Tag};

/// The current envelope schema version. Bumped only on a breaking change to
/// a required field of an existing variant.
pub const SCHEMA_VERSION: u32 = 1;

/// Who sent a message: a specific agent, or the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    /// Sent by the named agent.
    Agent(AgentId),
    /// Sent by the coordinator (the lease-holding process).
    Coordinator,
}

impl Sender {
    /// True if this sender is the given agent (used for self-loopback
    /// suppression).
    #[must_use]
    pub fn is_agent(&self, id: AgentId) -> bool {
        matches!(self, Sender::Agent(a) if *a == id)
    }
}

/// The tagged union of every message variant in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePayload {
    /// Agent liveness signal, expected every `heartbeat_seconds`.
    Heartbeat {
        /// The agent's current phase name.
        phase: String,
        /// The agent's monotonic tool-call counter at time of send.
        tool_call_count: u64,
        /// The task the agent is currently working, if any.
        current_task_id: Option<TaskId>,
    },
    /// Periodic progress rendezvous payload.
    Checkin {
        /// Free-text progress description.
        progress_note: String,
        /// Files touched since the agent's last check-in.
        files_touched: Vec<String>,
        /// Insights discovered since the last check-in.
        insights: Vec<Insight>,
    },
    /// A single routable discovery, standalone or echoed from a `Checkin`.
    Insight {
        /// The insight being routed.
        insight: Insight,
    },
    /// Coordinator hands a task to an agent.
    TaskAssign {
        /// Unique id of the task.
        task_id: TaskId,
        /// The agent the task is assigned to.
        agent_id: AgentId,
        /// Opaque task payload.
        payload: serde_json::Value,
        /// Deadline by which the task should complete.
        deadline: DateTime<Utc>,
    },
    /// Agent reports a task's outcome.
    TaskComplete {
        /// The task being reported on.
        task_id: TaskId,
        /// Opaque result payload.
        result: serde_json::Value,
        /// Whether the task succeeded.
        ok: bool,
    },
    /// Coordinator asks agents to rendezvous at a barrier.
    SyncRequest {
        /// The barrier being opened.
        barrier_id: BarrierId,
        /// The phase this barrier gates.
        phase_index: usize,
    },
    /// Agent acknowledges a sync request.
    SyncAck {
        /// The barrier being acknowledged.
        barrier_id: BarrierId,
    },
    /// Coordinator announces the objective has moved to a new phase.
    PhaseAdvance {
        /// The phase index now current.
        new_phase_index: usize,
    },
    /// Coordinator asks an agent to correct course (guardrail violation).
    CourseCorrect {
        /// The agent being corrected.
        agent_id: AgentId,
        /// Human-readable reason.
        reason: String,
    },
    /// Coordinator warns that an agent's activity is drifting from its
    /// declared boundaries.
    DriftAlert {
        /// The drifting agent.
        agent_id: AgentId,
        /// Evidence supporting the drift determination.
        evidence: String,
    },
    /// Coordinator announces an agent has been reaped.
    AgentDown {
        /// The agent that went down.
        agent_id: AgentId,
    },
    /// Either party requests human attention.
    HumanEscalate {
        /// The category of escalation (e.g. `"question"`, `"boundary-violations"`).
        category: String,
        /// Free-form context for the human.
        context: serde_json::Value,
    },
    /// Coordinator announces the objective completed successfully.
    ObjectiveComplete {
        /// Human-readable summary of the run.
        summary: String,
    },
    /// Coordinator announces the objective failed.
    ObjectiveFailed {
        /// Human-readable summary of why the objective failed.
        summary: String,
    },
}

impl MessagePayload {
    /// The tag vocabulary is closed, but downstream code frequently needs a
    /// short name for logging without matching on the whole variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Heartbeat { .. } => "HEARTBEAT",
            MessagePayload::Checkin { .. } => "CHECKIN",
            MessagePayload::Insight { .. } => "INSIGHT",
            MessagePayload::TaskAssign { .. } => "TASK_ASSIGN",
            MessagePayload::TaskComplete { .. } => "TASK_COMPLETE",
            MessagePayload::SyncRequest { .. } => "SYNC_REQUEST",
            MessagePayload::SyncAck { .. } => "SYNC_ACK",
            MessagePayload::PhaseAdvance { .. } => "PHASE_ADVANCE",
            MessagePayload::CourseCorrect { .. } => "COURSE_CORRECT",
            MessagePayload::DriftAlert { .. } => "DRIFT_ALERT",
            MessagePayload::AgentDown { .. } => "AGENT_DOWN",
            MessagePayload::HumanEscalate { .. } => "HUMAN_ESCALATE",
            MessagePayload::ObjectiveComplete { .. } => "OBJECTIVE_COMPLETE",
            MessagePayload::ObjectiveFailed { .. } => "OBJECTIVE_FAILED",
        }
    }

    /// True for the two tags the backpressure policy never drops.
    #[must_use]
    pub fn is_never_dropped(&self) -> bool {
        match self {
            MessagePayload::Insight { insight } => {
                insight.tags.contains(&Tag::Blocker) || insight.tags.contains(&Tag::Question)
            }
            _ => false,
        }
    }
}

/// A message plus its routing envelope. All messages carry `session_id`,
/// `sent_at`, `sender`, and a per-sender monotonic `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema version of this envelope, for forward-compatible decoding.
    pub schema_version: u32,
    /// The session this message belongs to.
    pub session_id: SessionId,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
    /// Who sent it.
    pub sender: Sender,
    /// Monotonic sequence number, scoped to `sender`.
    pub seq: Seq,
    /// Unique per-message id, primarily for idempotent insight tracking.
    #[serde(default = "InsightId::generate")]
    pub message_id: InsightId,
    /// The message body.
    pub payload: MessagePayload,
}

impl Envelope {
    /// Builds a new envelope with the current schema version.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        sender: Sender,
        seq: Seq,
        sent_at: DateTime<Utc>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id,
            sent_at,
            sender,
            seq,
            message_id: InsightId::generate(),
            payload,
        }
    }
}

/// Serializes an envelope to its wire form.
///
/// # Errors
///
/// Returns [`PowerModeError::Serialization`] if the envelope cannot be
/// represented as JSON (this should not happen for well-formed envelopes).
pub fn encode(message: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserializes an envelope from its wire form.
///
/// # Errors
///
/// Returns [`PowerModeError::InvalidMessage`] if the payload is not valid
/// JSON, does not match the envelope shape, or names a variant tag missing
/// one of its required fields.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes).map_err(|e| PowerModeError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::Insight;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn sample_envelope() -> Envelope {
        let session_id = SessionId::generate();
        let agent_id = AgentId::generate();
        Envelope::new(
            session_id,
            Sender::Agent(agent_id),
            Seq::initial(),
            Utc::now(),
            MessagePayload::Heartbeat {
                phase: "design".to_string(),
                tool_call_count: 5,
                current_task_id: None,
            },
        )
    }

    #[test]
    fn round_trip_preserves_fields() {
        let original = sample_envelope();
        let bytes = encode(&original).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        let bad = br#"{"type":"Heartbeat","phase":"design"}"#;
        assert!(decode(bad).is_err());
    }

    #[test]
    fn decode_tolerates_unknown_top_level_fields() {
        let original = sample_envelope();
        let mut value = serde_json::to_value(&original).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("future_field".to_string(), serde_json::json!("ignored"));
        let bytes = serde_json::to_vec(&value).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.session_id, original.session_id);
    }

    #[test]
    fn insight_with_blocker_tag_is_never_dropped() {
        let insight = Insight::new(
            AgentId::generate(),
            "design".to_string(),
            BTreeSet::from([Tag::Blocker]),
            serde_json::json!("stuck"),
        );
        let payload = MessagePayload::Insight { insight };
        assert!(payload.is_never_dropped());
    }

    #[test]
    fn kind_names_match_spec_vocabulary() {
        assert_eq!(
            MessagePayload::ObjectiveComplete {
                summary: "done".to_string()
            }
            .kind(),
            "OBJECTIVE_COMPLETE"
        );
    }

    proptest! {
        #[test]
        fn heartbeat_round_trips_for_arbitrary_fields(
            phase in "[a-z]{1,12}",
            tool_call_count in any::<u64>(),
            seq in 1u64..10_000,
        ) {
            let session_id = SessionId::generate();
            let agent_id = AgentId::generate();
            let original = Envelope::new(
                session_id,
                Sender::Agent(agent_id),
                Seq::new(seq),
                Utc::now(),
                MessagePayload::Heartbeat {
                    phase,
                    tool_call_count,
                    current_task_id: None,
                },
            );
            let bytes = encode(&original).unwrap();
            let decoded = decode(&bytes).unwrap();
            prop_assert_eq!(original, decoded);
        }
    }
}
