//! Runtime configuration of the `trellis` binary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::extensions::{DEFAULT_INTERVAL, DEFAULT_SEVERE_THRESHOLD, DEFAULT_TIMEOUT, WaitOptions};

pub const ENV_CONFIG: &str = "TRELLIS_CONFIG";
pub const ENV_BIND_ADDR: &str = "TRELLIS_BIND_ADDR";
pub const ENV_NAMESPACE: &str = "TRELLIS_NAMESPACE";
pub const ENV_BUCKET_DIR: &str = "TRELLIS_BUCKET_DIR";
pub const ENV_STATE_KEY_FILE: &str = "TRELLIS_STATE_KEY_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub bind_addr: String,
    /// Namespace whose extension objects are observed.
    pub namespace: String,
    /// Backing directory of the local relay agent. The agent only runs
    /// when set.
    pub bucket_dir: Option<PathBuf>,
    pub log_level: String,
    pub wait: WaitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            namespace: "default".to_string(),
            bucket_dir: None,
            log_level: "info".to_string(),
            wait: WaitConfig::default(),
        }
    }
}

/// Polling parameters in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WaitConfig {
    pub interval: u64,
    pub severe_threshold: u64,
    pub timeout: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL.as_millis() as u64,
            severe_threshold: DEFAULT_SEVERE_THRESHOLD.as_millis() as u64,
            timeout: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl WaitConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval == 0 {
            return Err(Error::Config("wait.interval must be positive".into()));
        }
        if self.timeout < self.interval {
            return Err(Error::Config(format!(
                "wait.timeout ({}ms) must not be shorter than wait.interval ({}ms)",
                self.timeout, self.interval
            )));
        }
        Ok(())
    }

    pub fn options(&self) -> WaitOptions {
        WaitOptions {
            interval: Duration::from_millis(self.interval),
            severe_threshold: Duration::from_millis(self.severe_threshold),
            timeout: Duration::from_millis(self.timeout),
        }
    }
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    /// Loads the file named by `TRELLIS_CONFIG`, or the defaults, then
    /// applies environment overrides.
    pub fn load() -> Result<Self, Error> {
        let mut config = match std::env::var_os(ENV_CONFIG) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("failed reading {}: {e}", PathBuf::from(&path).display()))
                })?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.bind_addr = addr;
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.namespace = namespace;
        }
        if let Some(dir) = lookup(ENV_BUCKET_DIR) {
            self.bucket_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".into()));
        }
        self.wait.validate()
    }
}
