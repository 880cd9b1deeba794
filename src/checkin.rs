//! Check-in Hook: the agent-side push/pull exchange run every
//! `checkin_every_n_tools` tool calls.
//!
//! Push phase publishes a heartbeat, an optional check-in, and any
//! standalone insights. Pull phase drains up to 32 waiting messages from the
//! agent's direct channel within a 2 s budget, translating coordinator
//! directives into [`AgentDirective`]s the caller acts on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain_types::{AgentId, SessionId, TaskId, ToolCallCount};
use crate::error::Result;
use crate::guardrail::HumanRequiredCategories;
use crate::insight::Insight;
use crate::message::{decode, encode, Envelope, MessagePayload, Sender};
use crate::store::StoreBackend;

const PULL_BUDGET: Duration = Duration::from_secs(2);
const MAX_PULL_MESSAGES: usize = 32;

/// One coordinator directive surfaced to the agent loop after a pull.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentDirective {
    /// The coordinator asked this agent to correct course.
    CourseCorrect {
        /// Human-readable reason.
        reason: String,
    },
    /// The coordinator flagged this agent's activity as drifting.
    DriftAlert {
        /// Evidence supporting the determination.
        evidence: String,
    },
    /// The coordinator assigned a new task.
    TaskAssign {
        /// Unique id of the task.
        task_id: TaskId,
        /// Opaque task payload.
        payload: serde_json::Value,
    },
    /// The coordinator opened a sync barrier this agent must acknowledge.
    SyncRequest {
        /// The barrier being opened.
        barrier_id: crate::domain_types::BarrierId,
    },
    /// A directive whose payload required a human decision before reaching
    /// the agent (e.g. a `human_required` category check-in response);
    /// surfaced so the agent loop can pause rather than act.
    HumanEscalation {
        /// The escalation category.
        category: String,
    },
}

/// What the agent reports about itself on a check-in.
#[derive(Debug, Clone, Default)]
pub struct CheckinReport {
    /// Free-text progress description.
    pub progress_note: String,
    /// Files touched since the last check-in.
    pub files_touched: Vec<String>,
    /// Insights discovered since the last check-in.
    pub insights: Vec<Insight>,
}

/// Runs the agent side of one check-in cycle: push (heartbeat + optional
/// check-in + standalone insights, filtered through the escalation check),
/// then pull (drain and translate directives).
///
/// Before anything from `report`'s insights reaches `pop:results`/
/// `pop:insights`, each insight's payload is checked against
/// `human_required_categories` (matched on a `"category"` field). Any insight
/// that matches is withheld from the normal channels entirely; a
/// `HUMAN_ESCALATE` is published on `pop:human` in its place and the call
/// returns immediately with the resulting [`AgentDirective::HumanEscalation`]s
/// instead of proceeding to the pull phase — the agent pauses rather than
/// acting on anything else this cycle.
///
/// When `cancelled` is true, only the heartbeat is pushed and the pull phase
/// is skipped; this is the "hard stop flushes only the heartbeat" behavior
/// of cooperative cancellation.
///
/// # Errors
///
/// Propagates any [`crate::error::PowerModeError`] raised by the store
/// backend while publishing or reading the agent's direct channel.
pub async fn run_checkin(
    store: &Arc<dyn StoreBackend>,
    session_id: SessionId,
    agent_id: AgentId,
    seq: &mut crate::domain_types::Seq,
    phase: &str,
    tool_call_count: ToolCallCount,
    current_task_id: Option<TaskId>,
    report: Option<CheckinReport>,
    human_required_categories: &HumanRequiredCategories,
    cancelled: bool,
) -> Result<Vec<AgentDirective>> {
    push_heartbeat(
        store,
        session_id,
        agent_id,
        seq,
        phase,
        tool_call_count,
        current_task_id,
    )
    .await?;

    if cancelled {
        return Ok(Vec::new());
    }

    if let Some(report) = report {
        let escalations =
            push_checkin(store, session_id, agent_id, seq, report, human_required_categories)
                .await?;
        if !escalations.is_empty() {
            return Ok(escalations);
        }
    }

    pull_directives(store, agent_id).await
}

async fn push_heartbeat(
    store: &Arc<dyn StoreBackend>,
    session_id: SessionId,
    agent_id: AgentId,
    seq: &mut crate::domain_types::Seq,
    phase: &str,
    tool_call_count: ToolCallCount,
    current_task_id: Option<TaskId>,
) -> Result<()> {
    let envelope = Envelope::new(
        session_id,
        Sender::Agent(agent_id),
        *seq,
        Utc::now(),
        MessagePayload::Heartbeat {
            phase: phase.to_string(),
            tool_call_count: tool_call_count.into_inner(),
            current_task_id,
        },
    );
    *seq = seq.next();
    store.publish("pop:heartbeat", &encode(&envelope)?).await
}

/// Returns the category a payload would escalate under, if any.
fn escalation_category(
    payload: &serde_json::Value,
    categories: &HumanRequiredCategories,
) -> Option<String> {
    payload
        .get("category")
        .and_then(serde_json::Value::as_str)
        .filter(|c| categories.0.contains(*c))
        .map(ToString::to_string)
}

async fn push_checkin(
    store: &Arc<dyn StoreBackend>,
    session_id: SessionId,
    agent_id: AgentId,
    seq: &mut crate::domain_types::Seq,
    report: CheckinReport,
    human_required_categories: &HumanRequiredCategories,
) -> Result<Vec<AgentDirective>> {
    let mut clean = Vec::new();
    let mut escalated = Vec::new();
    for insight in report.insights {
        match escalation_category(&insight.payload, human_required_categories) {
            Some(category) => escalated.push((category, insight)),
            None => clean.push(insight),
        }
    }

    let envelope = Envelope::new(
        session_id,
        Sender::Agent(agent_id),
        *seq,
        Utc::now(),
        MessagePayload::Checkin {
            progress_note: report.progress_note,
            files_touched: report.files_touched,
            insights: clean.clone(),
        },
    );
    *seq = seq.next();
    store.publish("pop:results", &encode(&envelope)?).await?;

    for insight in clean {
        let envelope = Envelope::new(
            session_id,
            Sender::Agent(agent_id),
            *seq,
            Utc::now(),
            MessagePayload::Insight { insight },
        );
        *seq = seq.next();
        store.publish("pop:insights", &encode(&envelope)?).await?;
    }

    let mut directives = Vec::new();
    for (category, insight) in escalated {
        let envelope = Envelope::new(
            session_id,
            Sender::Agent(agent_id),
            *seq,
            Utc::now(),
            MessagePayload::HumanEscalate {
                category: category.clone(),
                context: insight.payload,
            },
        );
        *seq = seq.next();
        store.publish("pop:human", &encode(&envelope)?).await?;
        directives.push(AgentDirective::HumanEscalation { category });
    }
    Ok(directives)
}

async fn pull_directives(
    store: &Arc<dyn StoreBackend>,
    agent_id: AgentId,
) -> Result<Vec<AgentDirective>> {
    let channel = format!("pop:agent:{agent_id}");
    let client_id = agent_id.to_string();
    let mut cursor = store.subscribe(&channel, &client_id).await?;

    let drain = async {
        let mut directives = Vec::new();
        while directives.len() < MAX_PULL_MESSAGES {
            let batch = cursor.poll().await?;
            if batch.is_empty() {
                break;
            }
            for stored in batch {
                if directives.len() >= MAX_PULL_MESSAGES {
                    break;
                }
                if let Ok(envelope) = decode(&stored.data) {
                    if let Some(directive) = translate(envelope) {
                        directives.push(directive);
                    }
                }
            }
        }
        Ok(directives)
    };

    match tokio::time::timeout(PULL_BUDGET, drain).await {
        Ok(result) => result,
        Err(_) => Ok(Vec::new()),
    }
}

fn translate(envelope: Envelope) -> Option<AgentDirective> {
    match envelope.payload {
        MessagePayload::CourseCorrect { reason, .. } => {
            Some(AgentDirective::CourseCorrect { reason })
        }
        MessagePayload::DriftAlert { evidence, .. } => {
            Some(AgentDirective::DriftAlert { evidence })
        }
        MessagePayload::TaskAssign {
            task_id, payload, ..
        } => Some(AgentDirective::TaskAssign { task_id, payload }),
        MessagePayload::SyncRequest { barrier_id, .. } => {
            Some(AgentDirective::SyncRequest { barrier_id })
        }
        MessagePayload::HumanEscalate { category, .. } => {
            Some(AgentDirective::HumanEscalation { category })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{FileLockTimeoutSeconds, MaxMessagesPerChannel, Seq};
    use crate::store::file::FileStore;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> Arc<dyn StoreBackend> {
        Arc::new(FileStore::new(
            dir.path(),
            FileLockTimeoutSeconds::try_new(5).unwrap(),
            MaxMessagesPerChannel::try_new(100).unwrap(),
        ))
    }

    #[tokio::test]
    async fn push_heartbeat_then_pull_sees_no_directives() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let mut seq = Seq::initial();
        let directives = run_checkin(
            &store,
            SessionId::generate(),
            AgentId::generate(),
            &mut seq,
            "build",
            ToolCallCount::default(),
            None,
            None,
            &HumanRequiredCategories::default(),
            false,
        )
        .await
        .unwrap();
        assert!(directives.is_empty());
    }

    #[tokio::test]
    async fn cancelled_checkin_skips_pull() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let agent_id = AgentId::generate();
        let session_id = SessionId::generate();

        // Pre-seed a directive the agent would otherwise see.
        let envelope = Envelope::new(
            session_id,
            Sender::Coordinator,
            Seq::initial(),
            Utc::now(),
            MessagePayload::CourseCorrect {
                agent_id,
                reason: "test".to_string(),
            },
        );
        store
            .publish(&format!("pop:agent:{agent_id}"), &encode(&envelope).unwrap())
            .await
            .unwrap();

        let mut seq = Seq::initial();
        let directives = run_checkin(
            &store,
            session_id,
            agent_id,
            &mut seq,
            "build",
            ToolCallCount::default(),
            None,
            None,
            &HumanRequiredCategories::default(),
            true,
        )
        .await
        .unwrap();
        assert!(directives.is_empty());
    }

    #[tokio::test]
    async fn course_correct_directive_is_translated() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let agent_id = AgentId::generate();
        let session_id = SessionId::generate();

        let envelope = Envelope::new(
            session_id,
            Sender::Coordinator,
            Seq::initial(),
            Utc::now(),
            MessagePayload::CourseCorrect {
                agent_id,
                reason: "touched a protected path".to_string(),
            },
        );
        store
            .publish(&format!("pop:agent:{agent_id}"), &encode(&envelope).unwrap())
            .await
            .unwrap();

        let mut seq = Seq::initial();
        let directives = run_checkin(
            &store,
            session_id,
            agent_id,
            &mut seq,
            "build",
            ToolCallCount::default(),
            None,
            None,
            &HumanRequiredCategories::default(),
            false,
        )
        .await
        .unwrap();
        assert_eq!(
            directives,
            vec![AgentDirective::CourseCorrect {
                reason: "touched a protected path".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn checkin_with_human_required_category_escalates_and_pauses() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let agent_id = AgentId::generate();
        let session_id = SessionId::generate();

        let insight = Insight::new(
            agent_id,
            "build".to_string(),
            std::collections::BTreeSet::from([crate::insight::Tag::Other(
                "deploy-plan".to_string(),
            )]),
            serde_json::json!({ "category": "production-deploy", "detail": "roll out to prod" }),
        );
        let report = CheckinReport {
            progress_note: "about to deploy".to_string(),
            files_touched: vec!["deploy.sh".to_string()],
            insights: vec![insight],
        };

        let mut seq = Seq::initial();
        let directives = run_checkin(
            &store,
            session_id,
            agent_id,
            &mut seq,
            "build",
            ToolCallCount::default(),
            None,
            Some(report),
            &HumanRequiredCategories::default(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(
            directives,
            vec![AgentDirective::HumanEscalation {
                category: "production-deploy".to_string()
            }]
        );

        let mut results = store.subscribe("pop:results", "test").await.unwrap();
        let messages = results.poll().await.unwrap();
        let envelope = decode(&messages[0].data).unwrap();
        match envelope.payload {
            MessagePayload::Checkin { insights, .. } => {
                assert!(insights.is_empty(), "escalated insight must not reach pop:results");
            }
            other => panic!("expected Checkin, got {other:?}"),
        }
    }
}
