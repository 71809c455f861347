/// runtime configuration, read from json
///
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::CacheError;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 250;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// capacity of every worker mailbox
    pub channel_capacity: usize,
    /// caller-side timeout for request/reply exchanges
    pub request_timeout_ms: u64,
    pub log_level: String,
    pub restart: RestartPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            log_level: "info".to_string(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Restart behavior layered on top of the supervisor's state machine.
///
/// The default restarts unconditionally, immediately and forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// restarts allowed per child; `None` is unlimited
    pub max_restarts: Option<u32>,
    /// delay before a crashed child is rebuilt
    pub backoff_ms: u64,
    /// delay between attempts when a rebuilt store connector cannot connect
    pub reconnect_interval_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            max_restarts: None,
            backoff_ms: 0,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
        }
    }
}

impl RestartPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// true when a child that has already been restarted `count` times may be restarted again
    pub fn allows(&self, count: u32) -> bool {
        match self.max_restarts {
            Some(max) => count < max,
            None => true,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Config::from_json(&text)
    }

    /// install the console logger at the configured level
    pub fn init_logging(&self) -> Result<()> {
        crate::logging::init_logging(&self.log_level)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), CacheError> {
        if self.channel_capacity == 0 {
            return Err(CacheError::Config(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(CacheError::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(CacheError::Config(format!(
                "unknown log level: {}",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
