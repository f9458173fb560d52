//! Build configuration
//!
//! File-backed defaults (`stagecraft.toml` under the user config dir, or an
//! explicit `--config` path) merged with CLI flags. Missing file means
//! defaults; a present but invalid file is an error.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::cache::EvictionPolicy;
use crate::compose::PatternPolicy;
use crate::error::{StagecraftError, StagecraftResult};

/// Number of parallel stage executions when neither the file nor the CLI
/// sets one
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Options the scheduler runs under
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Concurrency limit for stage execution
    pub jobs: usize,

    /// Behavior for copy patterns that match nothing
    pub pattern_policy: PatternPolicy,

    /// Eviction bounds applied after the build
    pub eviction: EvictionPolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            pattern_policy: PatternPolicy::default(),
            eviction: EvictionPolicy::unbounded(),
        }
    }
}

/// On-disk configuration schema
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default concurrency limit
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Default pattern policy ("fatal" or "warn")
    #[serde(default)]
    pub pattern_policy: Option<PatternPolicy>,

    /// Cache eviction bounds
    #[serde(default)]
    pub cache: EvictionPolicy,
}

impl Config {
    /// Turn file values into build options, CLI overrides applied on top
    pub fn into_options(self, jobs_flag: Option<usize>) -> BuildOptions {
        BuildOptions {
            jobs: jobs_flag.or(self.jobs).unwrap_or_else(default_jobs).max(1),
            pattern_policy: self.pattern_policy.unwrap_or_default(),
            eviction: self.cache,
        }
    }
}

/// Loads configuration from a fixed path
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Manager pointed at the default config path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Manager pointed at an explicit path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stagecraft")
            .join("config.toml")
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration, using defaults when the file does not exist
    pub async fn load(&self) -> StagecraftResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&self.config_path).await.map_err(|e| {
            StagecraftError::io(
                format!("reading config from {}", self.config_path.display()),
                e,
            )
        })?;

        toml::from_str(&content).map_err(|e| StagecraftError::ConfigInvalid {
            path: self.config_path.clone(),
            reason: e.to_string(),
        })
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("absent.toml"));
        let config = manager.load().await.unwrap();
        assert!(config.jobs.is_none());
        assert_eq!(config.cache, EvictionPolicy::unbounded());
    }

    #[tokio::test]
    async fn file_values_parse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "jobs = 2\npattern_policy = \"warn\"\n\n[cache]\nmax_entries = 64\n",
        )
        .unwrap();

        let config = ConfigManager::with_path(path).load().await.unwrap();
        assert_eq!(config.jobs, Some(2));
        assert_eq!(config.pattern_policy, Some(PatternPolicy::Warn));
        assert_eq!(config.cache.max_entries, Some(64));
    }

    #[tokio::test]
    async fn invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "jobs = \"lots\"").unwrap();

        let err = ConfigManager::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StagecraftError::ConfigInvalid { .. }));
    }

    #[test]
    fn cli_flag_wins_over_file() {
        let config = Config {
            jobs: Some(8),
            ..Config::default()
        };
        let options = config.into_options(Some(2));
        assert_eq!(options.jobs, 2);
    }
}
