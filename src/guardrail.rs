//! Guardrail & Drift Engine: protected paths, forbidden tools, drift
//! detection by Jaccard distance, and accumulated-violation escalation.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::domain_types::{AgentId, ViolationCount};

const DRIFT_WINDOW: usize = 5;
const DRIFT_THRESHOLD: f64 = 0.3;

/// Categories that always require a human decision before the coordinator
/// proceeds (e.g. production deploy, secret access, bulk deletion).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanRequiredCategories(pub HashSet<String>);

impl Default for HumanRequiredCategories {
    fn default() -> Self {
        Self(HashSet::from([
            "production-deploy".to_string(),
            "secret-access".to_string(),
            "bulk-deletion".to_string(),
        ]))
    }
}

/// Configuration for one session's guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Glob patterns an agent must never touch, regardless of declared
    /// boundaries (defaults include dot-env and key directories).
    pub protected_paths: Vec<String>,
    /// Tool names no agent may invoke.
    pub forbidden_tools: HashSet<String>,
    /// Categories that always require a human decision.
    pub human_required_categories: HumanRequiredCategories,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            protected_paths: vec![
                "**/.env*".to_string(),
                "**/keys/**".to_string(),
                "**/secrets/**".to_string(),
            ],
            forbidden_tools: HashSet::new(),
            human_required_categories: HumanRequiredCategories::default(),
        }
    }
}

/// The result of checking one check-in or insight against the guardrails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailOutcome {
    /// No violation found.
    Clean,
    /// A `COURSE_CORRECT` should be dispatched to the named agent for the
    /// given reason; the violation counter was incremented.
    CourseCorrect { agent_id: AgentId, reason: String },
    /// Accumulated violations crossed the threshold: a `HUMAN_ESCALATE`
    /// should be raised and the agent's dispatch paused.
    Escalate { agent_id: AgentId },
    /// The agent's recent file activity has drifted from its declared
    /// boundaries. Distinct from a boundary violation: does not touch the
    /// violation counter, and is reported via `DRIFT_ALERT` rather than
    /// `COURSE_CORRECT`.
    DriftAlert { agent_id: AgentId, evidence: String },
}

/// A per-agent sliding window of touched-files sets, used for drift
/// detection, plus the running violation counter.
#[derive(Debug, Default)]
struct AgentDriftState {
    recent_windows: VecDeque<HashSet<String>>,
    consecutive_drift_hits: u8,
    violations: ViolationCount,
}

/// Stateful guardrail engine for one session.
pub struct GuardrailEngine {
    config: GuardrailConfig,
    protected_patterns: Vec<Pattern>,
    state: DashMap<AgentId, AgentDriftState>,
}

impl GuardrailEngine {
    /// Builds an engine from a configuration, pre-compiling glob patterns.
    #[must_use]
    pub fn new(config: GuardrailConfig) -> Self {
        let protected_patterns = config
            .protected_paths
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();
        Self {
            config,
            protected_patterns,
            state: DashMap::new(),
        }
    }

    fn touches_protected_path(&self, files_touched: &[String]) -> bool {
        files_touched
            .iter()
            .any(|f| self.protected_patterns.iter().any(|p| p.matches(f)))
    }

    fn names_forbidden_tool(&self, tool_names: &[String]) -> bool {
        tool_names
            .iter()
            .any(|t| self.config.forbidden_tools.contains(t))
    }

    /// Checks a `CHECKIN`'s touched files (and any tool names it mentions)
    /// against protected paths and forbidden tools, and folds the touched
    /// set into the agent's drift window.
    #[must_use]
    pub fn check_checkin(
        &self,
        agent_id: AgentId,
        files_touched: &[String],
        tool_names_mentioned: &[String],
        boundaries: &HashSet<String>,
    ) -> GuardrailOutcome {
        let mut violated = false;
        let mut reason = String::new();

        if self.touches_protected_path(files_touched) {
            violated = true;
            reason = "touched a protected path".to_string();
        } else if self.names_forbidden_tool(tool_names_mentioned) {
            violated = true;
            reason = "invoked a forbidden tool".to_string();
        }

        let drift_evidence = self.record_window_and_check_drift(agent_id, files_touched, boundaries);

        if violated {
            return self.register_violation(agent_id, reason);
        }
        if let Some(evidence) = drift_evidence {
            return GuardrailOutcome::DriftAlert { agent_id, evidence };
        }
        GuardrailOutcome::Clean
    }

    /// Checks a standalone `INSIGHT` for forbidden-tool mentions (insights
    /// do not carry `files_touched`, so only the tool check applies).
    #[must_use]
    pub fn check_insight_tool_mentions(
        &self,
        agent_id: AgentId,
        tool_names_mentioned: &[String],
    ) -> GuardrailOutcome {
        if self.names_forbidden_tool(tool_names_mentioned) {
            return self.register_violation(agent_id, "invoked a forbidden tool".to_string());
        }
        GuardrailOutcome::Clean
    }

    fn record_window_and_check_drift(
        &self,
        agent_id: AgentId,
        files_touched: &[String],
        boundaries: &HashSet<String>,
    ) -> Option<String> {
        let mut state = self.state.entry(agent_id).or_default();
        let window: HashSet<String> = files_touched.iter().cloned().collect();
        state.recent_windows.push_back(window);
        if state.recent_windows.len() > DRIFT_WINDOW {
            state.recent_windows.pop_front();
        }

        let touched: HashSet<String> = state.recent_windows.iter().flatten().cloned().collect();
        let distance = jaccard_distance(&touched, boundaries);
        if distance > DRIFT_THRESHOLD {
            state.consecutive_drift_hits = state.consecutive_drift_hits.saturating_add(1);
        } else {
            state.consecutive_drift_hits = 0;
        }
        if state.consecutive_drift_hits >= 2 {
            Some(format!(
                "recent activity diverged from declared boundaries (jaccard distance {distance:.2} over last {} windows)",
                state.recent_windows.len()
            ))
        } else {
            None
        }
    }

    fn register_violation(&self, agent_id: AgentId, reason: String) -> GuardrailOutcome {
        let mut state = self.state.entry(agent_id).or_default();
        state.violations = state.violations.increment();
        if state.violations.has_escalated() {
            GuardrailOutcome::Escalate { agent_id }
        } else {
            GuardrailOutcome::CourseCorrect { agent_id, reason }
        }
    }
}

/// Jaccard distance: `1 - |A ∩ B| / |A ∪ B|`. Two empty sets are defined as
/// distance 0 (no divergence to measure).
fn jaccard_distance(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    1.0 - (intersection / union)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_path_triggers_course_correct() {
        let engine = GuardrailEngine::new(GuardrailConfig::default());
        let agent_id = AgentId::generate();
        let outcome = engine.check_checkin(
            agent_id,
            &[".env.production".to_string()],
            &[],
            &HashSet::new(),
        );
        assert!(matches!(outcome, GuardrailOutcome::CourseCorrect { .. }));
    }

    #[test]
    fn three_violations_escalate() {
        let engine = GuardrailEngine::new(GuardrailConfig::default());
        let agent_id = AgentId::generate();
        for _ in 0..2 {
            let outcome = engine.check_checkin(
                agent_id,
                &[".env".to_string()],
                &[],
                &HashSet::new(),
            );
            assert!(matches!(outcome, GuardrailOutcome::CourseCorrect { .. }));
        }
        let outcome = engine.check_checkin(agent_id, &[".env".to_string()], &[], &HashSet::new());
        assert!(matches!(outcome, GuardrailOutcome::Escalate { .. }));
    }

    #[test]
    fn forbidden_tool_mention_in_insight_triggers_violation() {
        let mut config = GuardrailConfig::default();
        config.forbidden_tools.insert("delete_all".to_string());
        let engine = GuardrailEngine::new(config);
        let agent_id = AgentId::generate();
        let outcome = engine.check_insight_tool_mentions(agent_id, &["delete_all".to_string()]);
        assert!(matches!(outcome, GuardrailOutcome::CourseCorrect { .. }));
    }

    #[test]
    fn jaccard_distance_of_disjoint_sets_is_one() {
        let a = HashSet::from(["a.rs".to_string()]);
        let b = HashSet::from(["b.rs".to_string()]);
        assert_eq!(jaccard_distance(&a, &b), 1.0);
    }

    #[test]
    fn drift_alert_requires_two_consecutive_high_distance_windows() {
        let engine = GuardrailEngine::new(GuardrailConfig::default());
        let agent_id = AgentId::generate();
        let boundaries = HashSet::from(["src/allowed.rs".to_string()]);
        let first = engine.check_checkin(
            agent_id,
            &["src/unrelated.rs".to_string()],
            &[],
            &boundaries,
        );
        assert_eq!(first, GuardrailOutcome::Clean);
        let second = engine.check_checkin(
            agent_id,
            &["src/also_unrelated.rs".to_string()],
            &[],
            &boundaries,
        );
        assert!(matches!(second, GuardrailOutcome::DriftAlert { .. }));
    }

    #[test]
    fn drift_alert_does_not_increment_violation_counter() {
        let engine = GuardrailEngine::new(GuardrailConfig::default());
        let agent_id = AgentId::generate();
        let boundaries = HashSet::from(["src/allowed.rs".to_string()]);
        engine.check_checkin(agent_id, &["src/unrelated.rs".to_string()], &[], &boundaries);
        engine.check_checkin(
            agent_id,
            &["src/also_unrelated.rs".to_string()],
            &[],
            &boundaries,
        );
        // Two more drifting windows would have escalated if drift shared the
        // violation counter with real boundary violations; it must not.
        let third = engine.check_checkin(
            agent_id,
            &["src/still_unrelated.rs".to_string()],
            &[],
            &boundaries,
        );
        assert!(matches!(third, GuardrailOutcome::DriftAlert { .. }));
        let fourth = engine.check_checkin(
            agent_id,
            &["src/yet_more_unrelated.rs".to_string()],
            &[],
            &boundaries,
        );
        assert!(matches!(fourth, GuardrailOutcome::DriftAlert { .. }));
    }
}
