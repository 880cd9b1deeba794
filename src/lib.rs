//! # Power Mode - multi-agent orchestration core
//!
//! Power Mode lets several independently running AI agents collaborate on a
//! shared objective: parallel work, periodic synchronization at phase
//! boundaries, tag-routed insight sharing, drift/guardrail enforcement, and
//! failover of unresponsive agents. The core works identically over a
//! networked Redis-Streams-backed store or a single-process file-based
//! fallback — callers only ever see the [`store::StoreBackend`] trait.
//!
//! ## Architecture
//!
//! ```text
//! checkin (agent side)  --publish-->  Store Backend  --subscribe-->  Coordinator
//!                                            ^                            |
//!                                            |                  Agent Registry
//!                                            |                  Insight Router
//!                                            |                  Sync Barrier Manager
//!                                            |                  Guardrail & Drift Engine
//!                                            +--------- Objective owns session state
//! ```

pub mod agent_registry;
pub mod barrier;
pub mod checkin;
pub mod config;
pub mod coordinator;
pub mod domain_types;
pub mod error;
pub mod guardrail;
pub mod insight;
pub mod insight_router;
pub mod message;
pub mod objective;
pub mod store;

pub use crate::agent_registry::{AgentDownEvent, AgentRecord, AgentRegistry, AgentState};
pub use crate::barrier::{Barrier, BarrierManager, BarrierStatus};
pub use crate::checkin::{run_checkin, AgentDirective, CheckinReport};
pub use crate::config::{BackendMode, LogFormat, PowerModeConfig, PowerModeConfigBuilder};
pub use crate::coordinator::{CompletionSummary, Coordinator};
pub use crate::domain_types::*;
pub use crate::error::{PowerModeError, Result};
pub use crate::guardrail::{GuardrailConfig, GuardrailEngine, GuardrailOutcome, HumanRequiredCategories};
pub use crate::insight::{Insight, Tag};
pub use crate::insight_router::{InsightRouter, RouteOutcome};
pub use crate::message::{decode, encode, Envelope, MessagePayload, Sender, SCHEMA_VERSION};
pub use crate::objective::{AdvanceOutcome, Boundaries, Objective, ObjectiveLifecycle, SuccessCriterion};
pub use crate::store::file::FileStore;
pub use crate::store::remote::RemoteStore;
pub use crate::store::{StoreBackend, StoredMessage, SubscriptionCursor};

// Common re-exports, for convenient single-import access to the core types.
pub use ::tracing::{debug, error, info, instrument, warn};
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use thiserror::Error;
pub use tokio::time::timeout;
pub use uuid::Uuid;
