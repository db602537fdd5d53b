//! Process configuration.
//!
//! Everything is driven by environment variables with documented defaults;
//! the only file-based input is the optional JSON init config applied at
//! startup (see `crate::init`).

use std::env;

use crate::arn::DEFAULT_REGION;

/// Environment variable for the listen port.
pub const PORT_ENV_VAR: &str = "MINICLOUD_PORT";
/// Environment variable for the externally visible host used in queue URLs.
pub const HOST_ENV_VAR: &str = "MINICLOUD_HOST";
/// Environment variable for the default region.
pub const REGION_ENV_VAR: &str = "MINICLOUD_DEFAULT_REGION";
/// Environment variable for logging configuration (env-filter syntax).
pub const LOG_ENV_VAR: &str = "MINICLOUD_LOG";
/// Environment variable for the path to a JSON init config.
pub const INIT_CONFIG_ENV_VAR: &str = "MINICLOUD_INIT_CONFIG";
/// Environment variable for the spy ring capacity.
pub const SPY_CAPACITY_ENV_VAR: &str = "MINICLOUD_SPY_CAPACITY";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 4566;
/// Default spy ring capacity.
pub const DEFAULT_SPY_CAPACITY: usize = 100;

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Port the HTTP endpoint binds to.
    pub port: u16,
    /// Externally visible host for constructed queue URLs. When unset the
    /// request's Host header is reused.
    pub external_host: Option<String>,
    /// Region applied when a request carries no credential scope.
    pub default_region: String,
    /// Path to a JSON init config applied before serving.
    pub init_config_path: Option<String>,
    /// Capacity of the spy event ring.
    pub spy_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            external_host: None,
            default_region: DEFAULT_REGION.to_string(),
            init_config_path: None,
            spy_capacity: DEFAULT_SPY_CAPACITY,
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var(PORT_ENV_VAR)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            external_host: env::var(HOST_ENV_VAR).ok().filter(|v| !v.is_empty()),
            default_region: env::var(REGION_ENV_VAR)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_region),
            init_config_path: env::var(INIT_CONFIG_ENV_VAR).ok().filter(|v| !v.is_empty()),
            spy_capacity: env::var(SPY_CAPACITY_ENV_VAR)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.spy_capacity),
        }
    }
}
