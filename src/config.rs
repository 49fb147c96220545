//! TOML configuration for the Pythia pipeline.
//!
//! Layered model: compiled-in defaults, an optional TOML file, then
//! `PYTHIA_*` environment overrides for the handful of knobs operators tune
//! most often.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::privacy::{Mechanism, NoiseConfig};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse config file {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `PYTHIA_CONFIG` environment variable.
    /// 2. `/etc/pythia/pythia.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("PYTHIA_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PYTHIA_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/pythia/pythia.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Resolve the full configuration for a process: explicit file (if any),
    /// environment overrides, then validation.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::load_or_default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PYTHIA_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override(&lookup, "PYTHIA_EPSILON")? {
            self.privacy.epsilon = v;
        }
        if let Some(v) = parse_override(&lookup, "PYTHIA_ALERT_THRESHOLD")? {
            self.detection.threshold = v;
        }
        if let Some(v) = parse_override(&lookup, "PYTHIA_DEDUP_WINDOW_MINUTES")? {
            self.detection.dedup_window_minutes = v;
        }
        if let Some(v) = parse_override(&lookup, "PYTHIA_BUFFER_SIZE")? {
            self.buffer.size_threshold = v;
        }
        if let Some(v) = parse_override(&lookup, "PYTHIA_FLUSH_MIN_SECS")? {
            self.buffer.flush_min_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "PYTHIA_FLUSH_MAX_SECS")? {
            self.buffer.flush_max_secs = v;
        }
        if let Some(v) = lookup("PYTHIA_FORECAST_URL") {
            self.detection.forecast_url = v;
        }
        if let Some(v) = lookup("PYTHIA_WEBHOOK_URL") {
            self.notify.webhook_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("PYTHIA_INGEST_URL") {
            self.buffer.endpoint = v;
        }
        Ok(())
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if !(self.privacy.epsilon > 0.0) {
            return Err(Error::Config(format!(
                "privacy.epsilon must be positive, got {}",
                self.privacy.epsilon
            )));
        }
        self.privacy.noise_config().validate()?;

        if self.buffer.size_threshold == 0 {
            return Err(Error::Config("buffer.size_threshold must be at least 1".into()));
        }
        if self.buffer.max_pending < self.buffer.size_threshold {
            return Err(Error::Config(format!(
                "buffer.max_pending ({}) is below buffer.size_threshold ({})",
                self.buffer.max_pending, self.buffer.size_threshold
            )));
        }
        if self.buffer.flush_min_secs > self.buffer.flush_max_secs {
            return Err(Error::Config(format!(
                "buffer.flush_min_secs ({}) exceeds buffer.flush_max_secs ({})",
                self.buffer.flush_min_secs, self.buffer.flush_max_secs
            )));
        }
        if !(self.detection.threshold > 0.0) {
            return Err(Error::Config(format!(
                "detection.threshold must be positive, got {}",
                self.detection.threshold
            )));
        }
        cron::Schedule::from_str(&self.detection.schedule).map_err(|e| {
            Error::Config(format!(
                "invalid detection.schedule '{}': {e}",
                self.detection.schedule
            ))
        })?;
        Ok(())
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}='{raw}' is invalid: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub db_path: PathBuf,
    /// Largest batch the ingestion endpoint accepts.
    pub max_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("data/pythia.db"),
            max_batch: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Privacy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub mechanism: Mechanism,
    pub epsilon: f64,
    pub delta: Option<f64>,
    pub sensitivity: f64,
    /// When set, the buffer holds events back instead of exceeding this
    /// cumulative epsilon.
    pub max_epsilon: Option<f64>,
    pub max_delta: f64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            mechanism: Mechanism::Laplace,
            epsilon: 1.0,
            delta: None,
            sensitivity: 1.0,
            max_epsilon: None,
            max_delta: 1e-5,
        }
    }
}

impl PrivacyConfig {
    pub fn noise_config(&self) -> NoiseConfig {
        NoiseConfig {
            mechanism: self.mechanism,
            epsilon: self.epsilon,
            delta: self.delta,
            sensitivity: self.sensitivity,
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// Client-side event buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Ingestion endpoint URL.
    pub endpoint: String,
    /// Pending-event count that forces an immediate flush.
    pub size_threshold: usize,
    pub flush_min_secs: u64,
    pub flush_max_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter added to each backoff.
    pub max_jitter_ms: u64,
    pub request_timeout_secs: u64,
    pub session_ttl_hours: i64,
    /// Most events held in memory. Newer events are discarded beyond it.
    pub max_pending: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/api/v1/events".to_string(),
            size_threshold: 50,
            flush_min_secs: 5,
            flush_max_secs: 15,
            max_retries: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 1000,
            request_timeout_secs: 10,
            session_ttl_hours: 24,
            max_pending: 1000,
        }
    }
}

impl BufferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Relative deviation from the forecast that raises an alert (strict `>`).
    pub threshold: f64,
    pub dedup_window_minutes: i64,
    pub window_days: i64,
    /// Maximum rows fetched per detection cycle.
    pub fetch_limit: usize,
    pub forecast_url: String,
    pub forecast_timeout_secs: u64,
    /// Six-field cron expression driving the detection loop.
    pub schedule: String,
    /// Run a detection cycle after every accepted ingestion batch.
    pub detect_on_ingest: bool,
    /// Skip the cycle when the forecast service reports a fallback value.
    pub skip_fallback_forecast: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.20,
            dedup_window_minutes: 15,
            window_days: 7,
            fetch_limit: 1000,
            forecast_url: "http://127.0.0.1:8000/forecast".to_string(),
            forecast_timeout_secs: 5,
            schedule: "0 */5 * * * *".to_string(),
            detect_on_ingest: false,
            skip_fallback_forecast: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Incoming-webhook URL. Alerts are only logged when unset.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
