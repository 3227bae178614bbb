//! Orchestrator configuration from environment variables and CLI flags.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::executor::RetryPolicy;
use crate::manager::ProviderConfig;

pub const ENV_STATE_DIR: &str = "TESTENV_VM_STATE_DIR";
pub const ENV_IMAGE_CACHE_DIR: &str = "TESTENV_VM_IMAGE_CACHE_DIR";
pub const ENV_CLEANUP_ON_FAILURE: &str = "TESTENV_VM_CLEANUP_ON_FAILURE";

pub const DEFAULT_STATE_DIR: &str = ".forge/testenv-vm/state";

#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub image_cache_dir: Option<PathBuf>,
    /// Roll back every ready resource when a phase fails.
    pub cleanup_on_failure: bool,
    /// Provider subprocesses to spawn for each environment.
    pub providers: Vec<ProviderConfig>,
    pub retry: RetryPolicy,
    /// Maximum concurrent requests routed to one provider within a
    /// phase. `None` means unbounded.
    pub per_provider_limit: Option<usize>,
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            image_cache_dir: None,
            cleanup_on_failure: true,
            providers: Vec::new(),
            retry: RetryPolicy::default(),
            per_provider_limit: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Resolve configuration from the `TESTENV_VM_*` environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = env::var(ENV_STATE_DIR) {
            if !dir.is_empty() {
                config.state_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = env::var(ENV_IMAGE_CACHE_DIR) {
            if !dir.is_empty() {
                config.image_cache_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(value) = env::var(ENV_CLEANUP_ON_FAILURE) {
            config.cleanup_on_failure = parse_bool(&value).unwrap_or(true);
        }
        config
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert!(config.cleanup_on_failure);
        assert!(config.image_cache_dir.is_none());
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("whatever"), None);
    }
}
