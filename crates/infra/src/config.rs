//! Pipeline configuration loaded from `ANNOTATOR_*` environment variables.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use annotator_core::GracePolicy;
use annotator_events::MAX_LEASE;

pub const KEY_PREFIX_VAR: &str = "ANNOTATOR_KEY_PREFIX";
pub const WORK_DIR_VAR: &str = "ANNOTATOR_WORK_DIR";
pub const DATA_DIR_VAR: &str = "ANNOTATOR_DATA_DIR";
pub const POLL_WAIT_VAR: &str = "ANNOTATOR_POLL_WAIT_SECS";
pub const DEFAULT_LEASE_VAR: &str = "ANNOTATOR_DEFAULT_LEASE_SECS";
pub const GRACE_PERIOD_VAR: &str = "ANNOTATOR_GRACE_PERIOD_SECS";
pub const THAW_BACKOFF_VAR: &str = "ANNOTATOR_THAW_BACKOFF_SECS";
pub const ANNOTATOR_CMD_VAR: &str = "ANNOTATOR_CMD";

/// Longest long-poll a single receive may block for.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a whole number of seconds, got `{value}`")]
    InvalidSeconds { var: &'static str, value: String },

    #[error("{var} must be between {min} and {max} seconds, got {value}")]
    OutOfRange {
        var: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}

/// Runtime settings shared by all workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// First segment of every object key.
    pub key_prefix: String,
    /// Root of the per-job working directories.
    pub work_dir: PathBuf,
    /// Root of the filesystem object store (local node).
    pub data_dir: PathBuf,
    /// Long-poll wait per receive.
    pub poll_wait: Duration,
    /// Lease granted by a receive.
    pub default_lease: Duration,
    /// Free-tier grace period before archival.
    pub grace_period: Duration,
    /// Lease applied while a cold retrieval is in progress.
    pub thaw_backoff: Duration,
    /// External annotator program and leading arguments; `None` uses the
    /// built-in annotator.
    pub annotator_cmd: Option<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "annotator".to_string(),
            work_dir: std::env::temp_dir().join("annotator-jobs"),
            data_dir: PathBuf::from("annotator-data"),
            poll_wait: Duration::from_secs(5),
            default_lease: Duration::from_secs(30),
            grace_period: Duration::from_secs(300),
            thaw_backoff: Duration::from_secs(900),
            annotator_cmd: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup(KEY_PREFIX_VAR) {
            let prefix = prefix.trim().trim_matches('/').to_string();
            if prefix.is_empty() {
                return Err(ConfigError::Empty { var: KEY_PREFIX_VAR });
            }
            config.key_prefix = prefix;
        }
        if let Some(dir) = lookup(WORK_DIR_VAR) {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(DATA_DIR_VAR) {
            config.data_dir = PathBuf::from(dir);
        }
        // Leases and the thaw backoff are lease extensions; the grace deferral
        // is one too, so all three share the queue's lease ceiling.
        let lease = 1..=MAX_LEASE.as_secs();
        if let Some(secs) = seconds(&lookup, POLL_WAIT_VAR, 0..=MAX_POLL_WAIT.as_secs())? {
            config.poll_wait = secs;
        }
        if let Some(secs) = seconds(&lookup, DEFAULT_LEASE_VAR, lease.clone())? {
            config.default_lease = secs;
        }
        if let Some(secs) = seconds(&lookup, GRACE_PERIOD_VAR, 0..=MAX_LEASE.as_secs())? {
            config.grace_period = secs;
        }
        if let Some(secs) = seconds(&lookup, THAW_BACKOFF_VAR, lease)? {
            config.thaw_backoff = secs;
        }
        if let Some(cmd) = lookup(ANNOTATOR_CMD_VAR) {
            let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err(ConfigError::Empty { var: ANNOTATOR_CMD_VAR });
            }
            config.annotator_cmd = Some(parts);
        }

        Ok(config)
    }

    pub fn grace_policy(&self) -> GracePolicy {
        GracePolicy::new(self.grace_period)
    }
}

fn seconds<F>(
    lookup: &F,
    var: &'static str,
    range: RangeInclusive<u64>,
) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidSeconds { var, value: raw.clone() })?;
    if !range.contains(&value) {
        return Err(ConfigError::OutOfRange {
            var,
            value,
            min: *range.start(),
            max: *range.end(),
        });
    }
    Ok(Some(Duration::from_secs(value)))
}
