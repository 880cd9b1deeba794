//! Insight type shared by the message codec and insight router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain_types::{AgentId, InsightId, TtlSeconds};

/// The fixed tag vocabulary an agent chooses from when emitting an insight.
/// Unknown tags (a future agent's own vocabulary extension) are preserved
/// opaquely via [`Tag::Other`] rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    /// Names a file or path.
    File,
    /// Names a recurring pattern worth recording for future sessions.
    Pattern,
    /// The agent is blocked and needs attention.
    Blocker,
    /// The agent has a question for another agent or a human.
    Question,
    /// The agent considers its assigned work complete.
    Complete,
    /// A security-relevant discovery.
    Security,
    /// Concerns an API surface.
    Api,
    /// Concerns data modeling or storage.
    Data,
    /// Concerns authentication/authorization.
    Auth,
    /// Concerns tests.
    Test,
    /// Concerns deployment.
    Deploy,
    /// Concerns UI.
    Ui,
    /// A barrier participant failed to acknowledge before the deadline.
    /// Not part of the agent-facing vocabulary; written by the coordinator.
    BarrierMiss,
    /// A tag outside the fixed vocabulary, preserved verbatim.
    Other(String),
}

impl Tag {
    /// The wire representation of this tag (the fixed vocabulary's spelling).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Tag::File => "file",
            Tag::Pattern => "pattern",
            Tag::Blocker => "blocker",
            Tag::Question => "question",
            Tag::Complete => "complete",
            Tag::Security => "security",
            Tag::Api => "api",
            Tag::Data => "data",
            Tag::Auth => "auth",
            Tag::Test => "test",
            Tag::Deploy => "deploy",
            Tag::Ui => "ui",
            Tag::BarrierMiss => "barrier-miss",
            Tag::Other(s) => s,
        }
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        match s {
            "file" => Tag::File,
            "pattern" => Tag::Pattern,
            "blocker" => Tag::Blocker,
            "question" => Tag::Question,
            "complete" => Tag::Complete,
            "security" => Tag::Security,
            "api" => Tag::Api,
            "data" => Tag::Data,
            "auth" => Tag::Auth,
            "test" => Tag::Test,
            "deploy" => Tag::Deploy,
            "ui" => Tag::Ui,
            "barrier-miss" => Tag::BarrierMiss,
            other => Tag::Other(other.to_string()),
        }
    }
}

impl Serialize for Tag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Tag::from(s.as_str()))
    }
}

/// A tagged, routable piece of information emitted by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// Unique id, scoped to the session.
    pub id: InsightId,
    /// The agent that produced this insight.
    pub source_agent_id: AgentId,
    /// The phase the source agent was in when it emitted this insight.
    pub phase: String,
    /// When the insight was created.
    pub created_at: DateTime<Utc>,
    /// Non-empty set of tags.
    pub tags: BTreeSet<Tag>,
    /// Opaque text/structured content.
    pub payload: serde_json::Value,
    /// Soft expiry; default 24h.
    pub ttl: TtlSeconds,
}

impl Insight {
    /// Builds a new insight with the default 24h TTL, stamped `now`.
    #[must_use]
    pub fn new(
        source_agent_id: AgentId,
        phase: String,
        tags: BTreeSet<Tag>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: InsightId::generate(),
            source_agent_id,
            phase,
            created_at: Utc::now(),
            tags,
            payload,
            ttl: TtlSeconds::one_day(),
        }
    }

    /// True once `created_at + ttl` has passed relative to `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.created_at + self.ttl.as_duration() < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insight_round_trips_through_json() {
        let insight = Insight::new(
            AgentId::generate(),
            "build".to_string(),
            BTreeSet::from([Tag::File, Tag::Pattern]),
            serde_json::json!({"note": "found a reusable helper"}),
        );
        let json = serde_json::to_vec(&insight).unwrap();
        let decoded: Insight = serde_json::from_slice(&json).unwrap();
        assert_eq!(insight, decoded);
    }

    #[test]
    fn unknown_tag_is_preserved_opaquely() {
        let json = serde_json::json!({
            "id": InsightId::generate(),
            "source_agent_id": AgentId::generate(),
            "phase": "build",
            "created_at": Utc::now(),
            "tags": ["made_up_tag"],
            "payload": "x",
            "ttl": 86400,
        });
        let insight: Insight = serde_json::from_value(json).unwrap();
        assert!(insight.tags.contains(&Tag::Other("made_up_tag".to_string())));
    }
}
