//! Power Mode configuration, including ambient logging and backend options.
//!
//! Named presets, a fluent validating builder, and JSON load/save so an
//! operator's chosen configuration can travel with a session.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain_types::{
    BarrierDeadlineSeconds, CheckinIntervalTools, FileLockTimeoutSeconds, FilePollIntervalMs,
    HeartbeatSeconds, LeaseTtlSeconds, MaxMessagesPerChannel, MaxParallelAgents,
    MaxRuntimeMinutes,
};
use crate::error::{PowerModeError, Result};

/// Which store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Remote iff credentials are set and a ping succeeds within 2s,
    /// otherwise file.
    Auto,
    /// Always use the Redis-Streams-backed remote store.
    Remote,
    /// Always use the JSON file-based store.
    File,
}

/// Log output format for the ambient `tracing-subscriber` setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, for local development.
    Pretty,
    /// Newline-delimited JSON, for production log aggregation.
    Json,
}

/// Full Power Mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerModeConfig {
    /// `checkin_every_n_tools`.
    pub checkin_every_n_tools: CheckinIntervalTools,
    /// `heartbeat_seconds`.
    pub heartbeat_seconds: HeartbeatSeconds,
    /// `max_parallel_agents`.
    pub max_parallel_agents: MaxParallelAgents,
    /// `max_runtime_minutes`.
    pub max_runtime_minutes: MaxRuntimeMinutes,
    /// `barrier_deadline_seconds`.
    pub barrier_deadline_seconds: BarrierDeadlineSeconds,
    /// `lease_ttl_seconds`.
    pub lease_ttl_seconds: LeaseTtlSeconds,
    /// `file_lock_timeout_seconds`.
    pub file_lock_timeout_seconds: FileLockTimeoutSeconds,
    /// `file_poll_interval_ms`.
    pub file_poll_interval_ms: FilePollIntervalMs,
    /// `max_messages_per_channel`.
    pub max_messages_per_channel: MaxMessagesPerChannel,
    /// `backend_mode`.
    pub backend_mode: BackendMode,
    /// Ambient logging level passed to `EnvFilter` when no `RUST_LOG` is set.
    pub log_level: String,
    /// Ambient logging output format.
    pub log_format: LogFormat,
}

impl Default for PowerModeConfig {
    fn default() -> Self {
        Self {
            checkin_every_n_tools: CheckinIntervalTools::default(),
            heartbeat_seconds: HeartbeatSeconds::default(),
            max_parallel_agents: MaxParallelAgents::default(),
            max_runtime_minutes: MaxRuntimeMinutes::default(),
            barrier_deadline_seconds: BarrierDeadlineSeconds::default(),
            lease_ttl_seconds: LeaseTtlSeconds::default(),
            file_lock_timeout_seconds: FileLockTimeoutSeconds::default(),
            file_poll_interval_ms: FilePollIntervalMs::default(),
            max_messages_per_channel: MaxMessagesPerChannel::default(),
            backend_mode: BackendMode::Auto,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl PowerModeConfig {
    /// A configuration tuned for local development: file-mode backend,
    /// pretty logs, shorter barrier deadline for fast iteration.
    #[must_use]
    pub fn development() -> Self {
        let mut cfg = Self::default();
        cfg.backend_mode = BackendMode::File;
        cfg.log_format = LogFormat::Pretty;
        cfg.log_level = "debug".to_string();
        cfg
    }

    /// A configuration tuned for production: remote backend, JSON logs.
    #[must_use]
    pub fn production() -> Self {
        let mut cfg = Self::default();
        cfg.backend_mode = BackendMode::Remote;
        cfg.log_format = LogFormat::Json;
        cfg.log_level = "info".to_string();
        cfg
    }

    /// A configuration tuned for fast, deterministic tests: file-mode,
    /// short timeouts.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            checkin_every_n_tools: CheckinIntervalTools::try_new(1).unwrap(),
            heartbeat_seconds: HeartbeatSeconds::try_new(1).unwrap(),
            max_parallel_agents: MaxParallelAgents::try_new(6).unwrap(),
            max_runtime_minutes: MaxRuntimeMinutes::try_new(1).unwrap(),
            barrier_deadline_seconds: BarrierDeadlineSeconds::try_new(2).unwrap(),
            lease_ttl_seconds: LeaseTtlSeconds::try_new(3).unwrap(),
            file_lock_timeout_seconds: FileLockTimeoutSeconds::try_new(1).unwrap(),
            file_poll_interval_ms: FilePollIntervalMs::try_new(10).unwrap(),
            max_messages_per_channel: MaxMessagesPerChannel::try_new(100).unwrap(),
            backend_mode: BackendMode::File,
            log_level: "trace".to_string(),
            log_format: LogFormat::Pretty,
        }
    }

    /// Cross-field validation beyond what each `nutype` field already
    /// enforces on its own.
    ///
    /// # Errors
    ///
    /// Returns [`PowerModeError::Config`] if the barrier deadline is not at
    /// least as long as one heartbeat interval (a barrier that cannot
    /// outlive a single heartbeat tick can never observe a timely ack), or
    /// if the lease TTL is not at least three times its own renewal cadence
    /// headroom.
    pub fn validate(&self) -> Result<()> {
        if self.barrier_deadline_seconds.into_inner() < self.heartbeat_seconds.into_inner() {
            return Err(PowerModeError::Config(
                "barrier_deadline_seconds must be >= heartbeat_seconds".to_string(),
            ));
        }
        if self.lease_ttl_seconds.into_inner() < 3 {
            return Err(PowerModeError::Config(
                "lease_ttl_seconds must be >= 3 to allow at least one renewal before expiry"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Serializes to pretty JSON and writes it to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads and validates a configuration previously written by
    /// [`Self::save_to_file`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or
    /// fails [`Self::validate`].
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&json)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Fluent builder for [`PowerModeConfig`], validating on [`Self::build`].
#[derive(Debug, Clone, Default)]
pub struct PowerModeConfigBuilder {
    config: PowerModeConfig,
}

impl PowerModeConfigBuilder {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PowerModeConfig::default(),
        }
    }

    /// Sets `checkin_every_n_tools`.
    #[must_use]
    pub fn checkin_every_n_tools(mut self, value: CheckinIntervalTools) -> Self {
        self.config.checkin_every_n_tools = value;
        self
    }

    /// Sets `heartbeat_seconds`.
    #[must_use]
    pub fn heartbeat_seconds(mut self, value: HeartbeatSeconds) -> Self {
        self.config.heartbeat_seconds = value;
        self
    }

    /// Sets `max_parallel_agents`.
    #[must_use]
    pub fn max_parallel_agents(mut self, value: MaxParallelAgents) -> Self {
        self.config.max_parallel_agents = value;
        self
    }

    /// Sets `barrier_deadline_seconds`.
    #[must_use]
    pub fn barrier_deadline_seconds(mut self, value: BarrierDeadlineSeconds) -> Self {
        self.config.barrier_deadline_seconds = value;
        self
    }

    /// Sets `backend_mode`.
    #[must_use]
    pub fn backend_mode(mut self, value: BackendMode) -> Self {
        self.config.backend_mode = value;
        self
    }

    /// Validates and produces the final configuration.
    ///
    /// # Errors
    ///
    /// See [`PowerModeConfig::validate`].
    pub fn build(self) -> Result<PowerModeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(PowerModeConfig::default().validate().is_ok());
    }

    #[test]
    fn presets_validate() {
        assert!(PowerModeConfig::development().validate().is_ok());
        assert!(PowerModeConfig::production().validate().is_ok());
        assert!(PowerModeConfig::testing().validate().is_ok());
    }

    #[test]
    fn builder_rejects_barrier_shorter_than_heartbeat() {
        let result = PowerModeConfigBuilder::new()
            .heartbeat_seconds(HeartbeatSeconds::try_new(30).unwrap())
            .barrier_deadline_seconds(BarrierDeadlineSeconds::try_new(5).unwrap())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = PowerModeConfig::production();
        cfg.save_to_file(&path).unwrap();
        let loaded = PowerModeConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.backend_mode, BackendMode::Remote);
    }
}
