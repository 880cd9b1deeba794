//! Insight Router: tag-based routing of discoveries to interested
//! agents, with special-cased handling for `blocker`, `question` and
//! `pattern` tags.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::domain_types::AgentId;
use crate::insight::{Insight, Tag};

/// Where a routed insight ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered directly to the listed agents (excluding the source).
    Delivered(Vec<AgentId>),
    /// No subscriber matched; appended to the orphan list.
    Orphaned,
    /// Routed to the coordinator as a `question` escalation because no
    /// agent's declared tags intersected the insight's subject tags.
    EscalatedAsQuestion,
}

/// Tracks each agent's declared tag interest and routes incoming insights.
#[derive(Default)]
pub struct InsightRouter {
    interests: DashMap<AgentId, HashSet<Tag>>,
}

impl InsightRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interests: DashMap::new(),
        }
    }

    /// Registers (or replaces) an agent's declared tag interest.
    pub fn declare_interest(&self, agent_id: AgentId, tags: HashSet<Tag>) {
        self.interests.insert(agent_id, tags);
    }

    /// Removes an agent's declared interest (called when it is retired).
    pub fn remove_interest(&self, agent_id: AgentId) {
        self.interests.remove(&agent_id);
    }

    /// Routes one insight, applying the special-tag rules ahead of ordinary
    /// subject-tag matching:
    ///
    /// - `blocker` is always additionally delivered to the coordinator.
    /// - `question` routes to agents whose declared interest intersects the
    ///   insight's tags; if none match, it escalates as a question instead
    ///   of orphaning.
    /// - `pattern` is broadcast to every active agent.
    ///
    /// `active_agents` is the full roster to broadcast `pattern` insights to;
    /// it need not include the source (self-loopback is excluded
    /// regardless).
    #[must_use]
    pub fn route(&self, insight: &Insight, active_agents: &[AgentId]) -> RouteOutcome {
        let source = insight.source_agent_id;

        if insight.tags.contains(&Tag::Pattern) {
            let targets: Vec<AgentId> = active_agents
                .iter()
                .copied()
                .filter(|a| *a != source)
                .collect();
            return if targets.is_empty() {
                RouteOutcome::Orphaned
            } else {
                RouteOutcome::Delivered(targets)
            };
        }

        if insight.tags.contains(&Tag::Question) {
            let targets: Vec<AgentId> = self
                .interests
                .iter()
                .filter(|entry| *entry.key() != source)
                .filter(|entry| entry.value().intersection(&insight.tags).next().is_some())
                .map(|entry| *entry.key())
                .collect();
            return if targets.is_empty() {
                RouteOutcome::EscalatedAsQuestion
            } else {
                RouteOutcome::Delivered(targets)
            };
        }

        // `blocker` is always additionally routed to the coordinator; callers
        // observe this via `insight.tags.contains(&Tag::Blocker)` directly
        // since the coordinator is not a registrable subscriber here.
        let targets: Vec<AgentId> = self
            .interests
            .iter()
            .filter(|entry| *entry.key() != source)
            .filter(|entry| {
                entry
                    .value()
                    .iter()
                    .any(|interest_tag| insight.tags.contains(interest_tag))
            })
            .map(|entry| *entry.key())
            .collect();

        if targets.is_empty() {
            RouteOutcome::Orphaned
        } else {
            RouteOutcome::Delivered(targets)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::InsightId;
    use crate::domain_types::TtlSeconds;
    use chrono::Utc;
    use proptest::prelude::*;

    fn insight(source: AgentId, tags: &[Tag]) -> Insight {
        Insight {
            id: InsightId::generate(),
            source_agent_id: source,
            phase: "build".to_string(),
            created_at: Utc::now(),
            tags: tags.iter().cloned().collect(),
            payload: serde_json::json!("x"),
            ttl: TtlSeconds::one_day(),
        }
    }

    #[test]
    fn matching_subscriber_receives_direct_copy() {
        let router = InsightRouter::new();
        let source = AgentId::generate();
        let subscriber = AgentId::generate();
        router.declare_interest(subscriber, HashSet::from([Tag::File]));
        let outcome = router.route(&insight(source, &[Tag::File]), &[]);
        assert_eq!(outcome, RouteOutcome::Delivered(vec![subscriber]));
    }

    #[test]
    fn no_match_is_orphaned() {
        let router = InsightRouter::new();
        let source = AgentId::generate();
        let outcome = router.route(&insight(source, &[Tag::Security]), &[]);
        assert_eq!(outcome, RouteOutcome::Orphaned);
    }

    #[test]
    fn pattern_broadcasts_to_all_active_agents_excluding_source() {
        let router = InsightRouter::new();
        let source = AgentId::generate();
        let other = AgentId::generate();
        let outcome = router.route(&insight(source, &[Tag::Pattern]), &[source, other]);
        assert_eq!(outcome, RouteOutcome::Delivered(vec![other]));
    }

    #[test]
    fn question_with_no_interested_agent_escalates() {
        let router = InsightRouter::new();
        let source = AgentId::generate();
        let outcome = router.route(&insight(source, &[Tag::Question, Tag::Api]), &[]);
        assert_eq!(outcome, RouteOutcome::EscalatedAsQuestion);
    }

    #[test]
    fn source_never_receives_its_own_insight() {
        let router = InsightRouter::new();
        let source = AgentId::generate();
        router.declare_interest(source, HashSet::from([Tag::File]));
        let outcome = router.route(&insight(source, &[Tag::File]), &[]);
        assert_eq!(outcome, RouteOutcome::Orphaned);
    }

    fn tag_strategy() -> impl Strategy<Value = Tag> {
        prop_oneof![
            Just(Tag::File),
            Just(Tag::Security),
            Just(Tag::Api),
            Just(Tag::Data),
            Just(Tag::Auth),
            Just(Tag::Test),
            Just(Tag::Deploy),
            Just(Tag::Ui),
        ]
    }

    proptest! {
        #[test]
        fn disjoint_subject_tags_always_orphan(
            subscriber_tags in proptest::collection::hash_set(tag_strategy(), 0..4),
            insight_tags in proptest::collection::hash_set(tag_strategy(), 1..4),
        ) {
            let router = InsightRouter::new();
            let source = AgentId::generate();
            let subscriber = AgentId::generate();
            router.declare_interest(subscriber, subscriber_tags.clone());

            let disjoint = subscriber_tags.is_disjoint(&insight_tags);
            let outcome = router.route(
                &insight(source, &insight_tags.into_iter().collect::<Vec<_>>()),
                &[],
            );
            if disjoint {
                prop_assert_eq!(outcome, RouteOutcome::Orphaned);
            }
        }
    }
}
