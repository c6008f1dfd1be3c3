use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub pool: PoolConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DRAINPOOL_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("DRAINPOOL_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            pool: PoolConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject values the pool cannot be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  pool:        name={}, capacity={}", self.pool.name, self.pool.capacity);
    }
}

// ── Pool ──────────────────────────────────────────────────────

/// Default number of concurrently in-flight jobs.
pub const DEFAULT_POOL_CAPACITY: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Label used in log fields.
    pub name: String,
    /// Maximum number of jobs running at once.
    pub capacity: usize,
}

impl PoolConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            name: profiled_env_or(p, "POOL_NAME", "default"),
            capacity: profiled_env_usize(p, "POOL_CAPACITY", DEFAULT_POOL_CAPACITY),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "POOL_CAPACITY".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "POOL_NAME".to_string(),
                reason: "must not be blank".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}
