use core_config::{env_parse, ConfigError, FromEnv};
use std::time::Duration;

const DEFAULT_HEALTH_PORT: u16 = 8083;
const DEFAULT_STARTUP_DELAY_MS: u64 = 5000;

/// Worker process settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub health_port: u16,
    pub startup_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            health_port: DEFAULT_HEALTH_PORT,
            startup_delay: Duration::from_millis(DEFAULT_STARTUP_DELAY_MS),
        }
    }
}

impl FromEnv for WorkerSettings {
    /// Checks FAREWELL_WORKER_HEALTH_PORT first, then HEALTH_PORT, then the default
    fn from_env() -> Result<Self, ConfigError> {
        let fallback = env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT)?;
        let health_port = env_parse("FAREWELL_WORKER_HEALTH_PORT", fallback)?;
        let delay_ms = env_parse("FAREWELL_WORKER_STARTUP_DELAY_MS", DEFAULT_STARTUP_DELAY_MS)?;

        Ok(Self {
            health_port,
            startup_delay: Duration::from_millis(delay_ms),
        })
    }
}
