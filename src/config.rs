//! Runtime configuration surface: every tunable named in the external
//! interfaces, loadable from a TOML file with environment-variable
//! overrides.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferCoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default = "default_worker_thread_count")]
    pub worker_thread_count: usize,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_max_operation_duration_secs")]
    pub max_operation_duration_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_total_available_bandwidth")]
    pub total_available_bandwidth: u64,
    #[serde(default = "default_minimum_allowed_bytes")]
    pub minimum_allowed_bytes: u64,
    #[serde(default = "default_max_throttle_delay_ms")]
    pub max_throttle_delay_ms: u64,
    #[serde(default = "default_adaptation_interval_secs")]
    pub adaptation_interval_secs: u64,
    #[serde(default = "default_max_resume_age_secs")]
    pub max_resume_age_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    /// Directory holding `<transfer-id>.json` resume records. Defaults to
    /// `<app-local-data>/TransferStates` at runtime if left unset.
    #[serde(default)]
    pub resume_directory: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_concurrent_transfers() -> usize {
    8
}
fn default_worker_thread_count() -> usize {
    num_cpus_fallback()
}
fn default_max_retry_attempts() -> u32 {
    5
}
fn default_max_retry_delay_secs() -> u64 {
    300
}
fn default_max_operation_duration_secs() -> u64 {
    3600
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_timeout_secs() -> u64 {
    90
}
fn default_inactivity_timeout_secs() -> u64 {
    600
}
fn default_total_available_bandwidth() -> u64 {
    10 * 1024 * 1024
}
fn default_minimum_allowed_bytes() -> u64 {
    1024
}
fn default_max_throttle_delay_ms() -> u64 {
    5000
}
fn default_adaptation_interval_secs() -> u64 {
    10
}
fn default_max_resume_age_secs() -> u64 {
    7 * 24 * 3600
}
fn default_chunk_size() -> u64 {
    64 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

/// std has no portable core-count query outside `available_parallelism`;
/// fall back to a sane constant if the platform can't answer.
fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent_transfers(),
            worker_thread_count: default_worker_thread_count(),
            max_retry_attempts: default_max_retry_attempts(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            max_operation_duration_secs: default_max_operation_duration_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            total_available_bandwidth: default_total_available_bandwidth(),
            minimum_allowed_bytes: default_minimum_allowed_bytes(),
            max_throttle_delay_ms: default_max_throttle_delay_ms(),
            adaptation_interval_secs: default_adaptation_interval_secs(),
            max_resume_age_secs: default_max_resume_age_secs(),
            default_chunk_size: default_chunk_size(),
            resume_directory: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| anyhow::anyhow!(e))?;
        let config: Config = toml::from_str(&content).map_err(|e| anyhow::anyhow!(e))?;
        config.validate()?;
        Ok(config)
    }

    /// Save this configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| anyhow::anyhow!(e))?;
        fs::write(path, content).map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    /// Overrides a subset of fields from `TRANSFER_CORE_*` environment
    /// variables, for operational tuning without editing the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("TRANSFER_CORE_TOTAL_BANDWIDTH") {
            self.total_available_bandwidth = v;
        }
        if let Some(v) = env_usize("TRANSFER_CORE_MAX_CONCURRENT_TRANSFERS") {
            self.max_concurrent_transfers = v;
        }
        if let Some(v) = env_usize("TRANSFER_CORE_WORKER_THREADS") {
            self.worker_thread_count = v;
        }
        if let Ok(v) = env::var("TRANSFER_CORE_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    /// Generates a commented sample configuration file.
    pub fn generate_sample() -> String {
        let sample = Self::default();
        let body = toml::to_string_pretty(&sample)
            .unwrap_or_else(|_| "# failed to generate sample configuration".to_string());
        format!("# transfer-core configuration\n{body}")
    }

    /// Rejects configurations that cannot produce a working engine.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_transfers == 0 {
            return Err(TransferCoreError::Configuration {
                reason: "max_concurrent_transfers must be at least 1".into(),
            });
        }
        if self.worker_thread_count == 0 {
            return Err(TransferCoreError::Configuration {
                reason: "worker_thread_count must be at least 1".into(),
            });
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(TransferCoreError::Configuration {
                reason: "heartbeat_timeout_secs must exceed heartbeat_interval_secs".into(),
            });
        }
        if self.minimum_allowed_bytes == 0 {
            return Err(TransferCoreError::Configuration {
                reason: "minimum_allowed_bytes must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn max_operation_duration(&self) -> Duration {
        Duration::from_secs(self.max_operation_duration_secs)
    }

    pub fn max_resume_age(&self) -> Duration {
        Duration::from_secs(self.max_resume_age_secs)
    }

    pub fn adaptation_interval(&self) -> Duration {
        Duration::from_secs(self.adaptation_interval_secs)
    }

    pub fn max_throttle_delay(&self) -> Duration {
        Duration::from_millis(self.max_throttle_delay_ms)
    }

    /// Resolves the directory resume records are written to, defaulting to
    /// the platform's local-data directory.
    pub fn resolved_resume_directory(&self) -> std::path::PathBuf {
        match &self.resume_directory {
            Some(dir) => std::path::PathBuf::from(dir),
            None => dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("TransferStates"),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
