//! Domain types for the Power Mode coordination core
//!
//! Strongly-typed identifiers, counts and durations so that the rest of the
//! crate never passes a bare `String`, `usize` or `u64` where a session id,
//! a tool-call count or a heartbeat interval is meant. Each type validates
//! its own invariants at construction; once you hold one, it is valid.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a session (one execution of an objective).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an agent, scoped to a session.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random agent id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Opaque role label for an agent (e.g. `"researcher"`, `"implementer"`).
///
/// Never interpreted by the core itself; the Insight Router uses it only as
/// a routing hint supplied by the caller.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentType(String);

/// Unique identifier for an insight, scoped to a session.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct InsightId(Uuid);

impl InsightId {
    /// Creates a new random insight id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a sync barrier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct BarrierId(Uuid);

impl BarrierId {
    /// Creates a new random barrier id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a task assignment.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Monotonic per-sender message sequence number.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Default,
    TryFrom,
    Into
))]
pub struct Seq(u64);

impl Seq {
    /// The first sequence number a sender emits.
    #[must_use]
    pub fn initial() -> Self {
        Self::new(1)
    }

    /// Returns the next sequence number after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// Non-negative count of tool calls observed since agent registration.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Default,
    TryFrom,
    Into
))]
pub struct ToolCallCount(u64);

impl ToolCallCount {
    /// Increments the counter by one.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// True if this count is a positive multiple of `n`.
    #[must_use]
    pub fn is_multiple_of(self, n: CheckinIntervalTools) -> bool {
        let n = n.into_inner();
        n > 0 && self.into_inner() > 0 && self.into_inner() % n == 0
    }
}

/// `checkin_every_n_tools`: number of tool calls between agent check-ins.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct CheckinIntervalTools(u64);

/// `heartbeat_seconds`: agent-side heartbeat cadence.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 15
)]
pub struct HeartbeatSeconds(u64);

impl HeartbeatSeconds {
    /// The reap window: three consecutive missed heartbeats.
    #[must_use]
    pub fn reap_grace(self) -> Duration {
        Duration::from_secs(self.into_inner() * 3)
    }

    /// The interval as a [`Duration`].
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// `max_parallel_agents`: coordinator admission cap.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 6
)]
pub struct MaxParallelAgents(usize);

/// `max_runtime_minutes`: session hard cap.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct MaxRuntimeMinutes(u64);

impl MaxRuntimeMinutes {
    /// The cap as a [`Duration`].
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner() * 60)
    }
}

/// `barrier_deadline_seconds`: per-barrier acknowledgement deadline.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 120
)]
pub struct BarrierDeadlineSeconds(u64);

impl BarrierDeadlineSeconds {
    /// The deadline as a [`Duration`].
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// `lease_ttl_seconds`: coordinator lease time-to-live.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct LeaseTtlSeconds(u64);

impl LeaseTtlSeconds {
    /// The conventional renewal interval: a third of the TTL.
    #[must_use]
    pub fn renewal_interval(self) -> Duration {
        Duration::from_secs(self.into_inner() / 3)
    }

    /// The TTL as a [`Duration`].
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// `file_lock_timeout_seconds`: file-mode advisory lock acquire timeout.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct FileLockTimeoutSeconds(u64);

impl FileLockTimeoutSeconds {
    /// The timeout as a [`Duration`].
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// `file_poll_interval_ms`: file-mode subscribe polling interval.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct FilePollIntervalMs(u64);

impl FilePollIntervalMs {
    /// The interval as a [`Duration`].
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// `max_messages_per_channel`: file-mode ring buffer size.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct MaxMessagesPerChannel(usize);

/// Soft expiry on an [`crate::insight::Insight`]; default 24h.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    ),
    default = 86400
)]
pub struct TtlSeconds(u64);

impl TtlSeconds {
    /// The default 24-hour TTL used for orphan lists, completion and pattern keys.
    #[must_use]
    pub fn one_day() -> Self {
        Self::default()
    }

    /// The TTL as a [`Duration`].
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// A bounded count of accumulated guardrail violations for one agent.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Default,
    TryFrom,
    Into
))]
pub struct ViolationCount(u8);

impl ViolationCount {
    /// The threshold at which the coordinator escalates and pauses dispatch.
    pub const ESCALATION_THRESHOLD: u8 = 3;

    /// Increments the violation counter by one.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// True once the accumulated violations reach the escalation threshold.
    #[must_use]
    pub fn has_escalated(self) -> bool {
        self.into_inner() >= Self::ESCALATION_THRESHOLD
    }
}

/// A count of consecutive missed heartbeats.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Default,
    TryFrom,
    Into
))]
pub struct MissedHeartbeats(u8);

impl MissedHeartbeats {
    /// The threshold at which an agent is reaped and marked `down`.
    pub const REAP_THRESHOLD: u8 = 3;

    /// Increments the missed-heartbeat counter by one.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// True once consecutive misses reach the reap threshold.
    #[must_use]
    pub fn should_reap(self) -> bool {
        self.into_inner() >= Self::REAP_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_count_multiple_of_interval() {
        let n = CheckinIntervalTools::try_new(5).unwrap();
        assert!(!ToolCallCount::new(0).is_multiple_of(n));
        assert!(ToolCallCount::new(5).is_multiple_of(n));
        assert!(ToolCallCount::new(10).is_multiple_of(n));
        assert!(!ToolCallCount::new(7).is_multiple_of(n));
    }

    #[test]
    fn missed_heartbeats_reap_threshold() {
        let mut m = MissedHeartbeats::default();
        assert!(!m.should_reap());
        m = m.increment();
        m = m.increment();
        assert!(!m.should_reap());
        m = m.increment();
        assert!(m.should_reap());
    }

    #[test]
    fn violation_count_escalation_threshold() {
        let mut v = ViolationCount::default();
        for _ in 0..2 {
            v = v.increment();
            assert!(!v.has_escalated());
        }
        v = v.increment();
        assert!(v.has_escalated());
    }

    #[test]
    fn seq_starts_at_one_and_increments() {
        let s = Seq::initial();
        assert_eq!(s.into_inner(), 1);
        assert_eq!(s.next().into_inner(), 2);
    }

    #[test]
    fn lease_renewal_is_a_third_of_ttl() {
        let ttl = LeaseTtlSeconds::try_new(30).unwrap();
        assert_eq!(ttl.renewal_interval(), Duration::from_secs(10));
    }
}
