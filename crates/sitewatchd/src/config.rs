use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sitewatch_core::geometry::RoiConfig;
use sitewatch_core::{RouterConfig, TrackerConfig, UnresolvedPolicy};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: TOML file (optional) with `SITEWATCH_*`
/// environment overrides on top, validated before any frame is processed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Minimum primary-detector confidence for direct evidence.
    pub tau_primary: f32,
    /// Minimum IoU to re-associate a detection with a live track.
    pub iou_threshold: f32,
    /// Seconds before a standing violation may re-alert.
    pub cooldown_secs: u64,
    /// Seconds of absence before a track is deleted.
    pub track_timeout_secs: u64,
    /// Head ROI: top fraction of the person box height.
    pub head_frac: f32,
    /// Torso ROI: starting fraction of the person box height.
    pub torso_start: f32,
    /// Minimum usable ROI side length.
    pub min_roi_side: f32,
    /// How to rule when the verifier cannot answer.
    pub unresolved_policy: UnresolvedPolicy,
    /// Per-stream frame queue depth.
    pub stream_queue_depth: usize,
    /// Append emitted events to this JSONL file; log them when unset.
    pub events_path: Option<PathBuf>,
    pub verifier: VerifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifierConfig {
    /// When false the verifier answers `unknown` and the fallback policy
    /// rules every rescue path.
    pub enabled: bool,
    /// Backend name; `static` is the only built-in.
    pub backend: String,
    /// Fixed answer of the `static` backend.
    pub static_outcome: String,
    /// Worker threads. Keep low; the backend is the expensive resource.
    pub workers: usize,
    /// Pending-request bound; requests beyond it are rejected, not queued.
    pub queue_depth: usize,
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tau_primary: 0.25,
            iou_threshold: 0.3,
            cooldown_secs: 300,
            track_timeout_secs: 30,
            head_frac: 0.4,
            torso_start: 0.2,
            min_roi_side: 20.0,
            unresolved_policy: UnresolvedPolicy::AssumeViolation,
            stream_queue_depth: 8,
            events_path: None,
            verifier: VerifierConfig::default(),
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "static".to_string(),
            static_outcome: "unknown".to_string(),
            workers: 2,
            queue_depth: 8,
            timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, apply environment overrides,
    /// then validate. Any failure here is fatal by design.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override individual fields from `SITEWATCH_*` environment variables.
    fn apply_env(&mut self) {
        env_override("SITEWATCH_TAU_PRIMARY", &mut self.tau_primary);
        env_override("SITEWATCH_IOU_THRESHOLD", &mut self.iou_threshold);
        env_override("SITEWATCH_COOLDOWN_SECS", &mut self.cooldown_secs);
        env_override("SITEWATCH_TRACK_TIMEOUT_SECS", &mut self.track_timeout_secs);
        env_override("SITEWATCH_VERIFIER_TIMEOUT_MS", &mut self.verifier.timeout_ms);
        env_override("SITEWATCH_VERIFIER_WORKERS", &mut self.verifier.workers);
        if let Ok(v) = std::env::var("SITEWATCH_VERIFIER_ENABLED") {
            self.verifier.enabled = v != "0";
        }
        if let Ok(v) = std::env::var("SITEWATCH_EVENTS_PATH") {
            self.events_path = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn unit_interval(name: &str, value: f32) -> Result<(), ConfigError> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )))
            }
        }

        unit_interval("tau_primary", self.tau_primary)?;
        unit_interval("iou_threshold", self.iou_threshold)?;
        if !(self.head_frac > 0.0 && self.head_frac <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "head_frac must be within (0, 1], got {}",
                self.head_frac
            )));
        }
        if !(self.torso_start >= 0.0 && self.torso_start < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "torso_start must be within [0, 1), got {}",
                self.torso_start
            )));
        }
        if self.min_roi_side <= 0.0 {
            return Err(ConfigError::Invalid(
                "min_roi_side must be positive".to_string(),
            ));
        }
        if self.cooldown_secs == 0 || self.track_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "cooldown_secs and track_timeout_secs must be nonzero".to_string(),
            ));
        }
        if self.stream_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "stream_queue_depth must be nonzero".to_string(),
            ));
        }
        if self.verifier.workers == 0 || self.verifier.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "verifier.workers and verifier.queue_depth must be nonzero".to_string(),
            ));
        }
        if self.verifier.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "verifier.timeout_ms must be nonzero".to_string(),
            ));
        }
        if self.verifier.enabled {
            if self.verifier.backend != "static" {
                return Err(ConfigError::Invalid(format!(
                    "unknown verifier backend '{}' (built-in: static)",
                    self.verifier.backend
                )));
            }
            if !matches!(
                self.verifier.static_outcome.as_str(),
                "present" | "absent" | "unknown"
            ) {
                return Err(ConfigError::Invalid(format!(
                    "invalid static verifier outcome '{}'",
                    self.verifier.static_outcome
                )));
            }
        }
        Ok(())
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            tau_primary: self.tau_primary,
            roi: RoiConfig {
                head_frac: self.head_frac,
                torso_start: self.torso_start,
                min_roi_side: self.min_roi_side,
            },
            unresolved: self.unresolved_policy,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            iou_threshold: self.iou_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            track_timeout: Duration::from_secs(self.track_timeout_secs),
        }
    }

    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_millis(self.verifier.timeout_ms)
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        } else {
            tracing::warn!(key, raw, "ignoring unparseable environment override");
        }
    }
}
