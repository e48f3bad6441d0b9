// Harness configuration management for the runner
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use trialbench_common::config::HarnessConfig;

/// Values given on the command line, applied on top of the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub timeout_secs: Option<u64>,
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub work_root: Option<PathBuf>,
}

/// Validated configuration plus the lookup tables derived from it
#[derive(Debug, Clone)]
pub struct HarnessConfigManager {
    config: HarnessConfig,
    group_index: BTreeMap<String, String>,
    task_pattern: Regex,
}

impl HarnessConfigManager {
    /// Load from a JSON file, falling back to defaults when it does not exist
    pub fn load(config_path: &Path) -> Result<Self> {
        let (config, loaded) = HarnessConfig::load_or_default(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;

        if loaded {
            info!(path = %config_path.display(), "Loaded harness configuration");
        } else {
            info!(path = %config_path.display(), "No configuration file, using defaults");
        }

        Self::from_config(config)
    }

    pub fn from_config(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let task_pattern = Regex::new(&config.layout.task_pattern)
            .with_context(|| format!("Invalid task_pattern '{}'", config.layout.task_pattern))?;
        let group_index = config.group_index();

        Ok(Self {
            config,
            group_index,
            task_pattern,
        })
    }

    pub fn with_overrides(self, overrides: &Overrides) -> Result<Self> {
        let mut config = self.config;
        if let Some(timeout) = overrides.timeout_secs {
            config.timeout_secs = timeout;
        }
        if let Some(concurrency) = overrides.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(batch_size) = overrides.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(work_root) = &overrides.work_root {
            config.work_root = work_root.clone();
        }
        Self::from_config(config)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Group label of a variant identifier, if it belongs to one
    pub fn group_of(&self, variant_id: &str) -> Option<&str> {
        self.group_index.get(variant_id).map(String::as_str)
    }

    pub fn is_task_dir_name(&self, name: &str) -> bool {
        self.task_pattern.is_match(name)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.config.kill_grace_ms)
    }

    /// List all configured group labels
    pub fn list_groups(&self) -> Vec<String> {
        self.config.groups.keys().cloned().collect()
    }
}
