//! System configuration loaded with Figment.
//!
//! Configuration is read from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RUST_SWATCH_`, nested keys separated by `__`
//!    (e.g. `RUST_SWATCH_SYSTEM__LOG_LEVEL=debug`)
//!
//! # Example
//! ```rust,ignore
//! use rust_swatch::config::SystemConfig;
//!
//! let config = SystemConfig::load_from("config/crate1.toml")?;
//! config.validate()?;
//! for child in config.enabled_children() {
//!     println!("{} ({})", child.id, child.r#type);
//! }
//! ```
//!
//! File layout:
//! ```toml
//! [system]
//! id = "crate1"
//! log_level = "info"
//!
//! [thread_pool]
//! workers = 4
//!
//! [[children]]
//! id = "proc1"
//! type = "Processor"
//! contexts = ["proc1", "processors"]
//! params = { slot = 3 }
//! ```

use crate::error::{ActionError, ActionResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Valid values of `system.log_level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration of a system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// System settings
    pub system: SystemSection,
    /// Worker pool settings
    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,
    /// Child resources
    #[serde(default)]
    pub children: Vec<ChildConfig>,
}

/// `[system]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSection {
    /// System id
    pub id: String,
    /// Human-friendly name
    #[serde(default)]
    pub alias: Option<String>,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// `[thread_pool]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Time granted to running tasks on shutdown, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// One `[[children]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildConfig {
    /// Child id, unique within the system
    pub id: String,
    /// Creator key in the [`CreatorRegistry`](crate::registry::CreatorRegistry)
    pub r#type: String,
    /// Human-friendly name
    #[serde(default)]
    pub alias: Option<String>,
    /// Whether the child takes part in system actions
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Gatekeeper contexts, most specific first; empty means the child id
    #[serde(default)]
    pub contexts: Vec<String>,
    /// Creator-specific settings
    #[serde(default = "default_params")]
    pub params: toml::Value,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    crate::action::thread_pool::DEFAULT_WORKERS
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_enabled() -> bool {
    true
}

fn default_params() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl SystemConfig {
    /// Load configuration from a TOML file, overridden by `RUST_SWATCH_` variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ActionResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_SWATCH_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(text: &str) -> ActionResult<Self> {
        Ok(Figment::new().merge(Toml::string(text)).extract()?)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> ActionResult<()> {
        if !LOG_LEVELS.contains(&self.system.log_level.to_lowercase().as_str()) {
            return Err(ActionError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.system.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.system.id.is_empty() {
            return Err(ActionError::Configuration("System id must not be empty".to_string()));
        }

        if self.thread_pool.workers < 2 {
            return Err(ActionError::Configuration(format!(
                "Invalid thread_pool.workers {}. Must be at least 2",
                self.thread_pool.workers
            )));
        }

        let mut ids = HashSet::new();
        for child in &self.children {
            if child.id.is_empty() {
                return Err(ActionError::Configuration(
                    "Child id must not be empty".to_string(),
                ));
            }
            if !ids.insert(&child.id) {
                return Err(ActionError::Configuration(format!(
                    "Duplicate child ID: {}",
                    child.id
                )));
            }
        }

        Ok(())
    }

    /// Children with `enabled = true`.
    pub fn enabled_children(&self) -> Vec<&ChildConfig> {
        self.children.iter().filter(|child| child.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [system]
        id = "crate1"
        alias = "Crate 1"
        log_level = "debug"

        [thread_pool]
        workers = 3

        [[children]]
        id = "proc1"
        type = "Processor"
        contexts = ["proc1", "processors"]
        params = { slot = 3 }

        [[children]]
        id = "proc2"
        type = "Processor"
        enabled = false
    "#;

    #[test]
    fn test_parse_sample() {
        let config = SystemConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.system.id, "crate1");
        assert_eq!(config.system.alias.as_deref(), Some("Crate 1"));
        assert_eq!(config.thread_pool.workers, 3);
        assert_eq!(config.thread_pool.shutdown_timeout_ms, 5000);
        assert_eq!(config.children.len(), 2);
        assert_eq!(config.children[0].params["slot"].as_integer(), Some(3));
        assert!(config.children[1].contexts.is_empty());
        assert!(config.validate().is_ok());

        let enabled: Vec<&str> = config.enabled_children().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(enabled, vec!["proc1"]);
    }

    #[test]
    fn test_defaults() {
        let config = SystemConfig::from_toml_str("[system]\nid = \"s\"\n").unwrap();
        assert_eq!(config.system.log_level, "info");
        assert_eq!(config.thread_pool.workers, DEFAULT_WORKERS_FOR_TEST);
        assert!(config.children.is_empty());
    }

    const DEFAULT_WORKERS_FOR_TEST: usize = crate::action::thread_pool::DEFAULT_WORKERS;

    #[test]
    fn test_invalid_log_level() {
        let mut config = SystemConfig::from_toml_str(SAMPLE).unwrap();
        config.system.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ActionError::Configuration(_))));
    }

    #[test]
    fn test_too_few_workers() {
        let mut config = SystemConfig::from_toml_str(SAMPLE).unwrap();
        config.thread_pool.workers = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_child_ids() {
        let mut config = SystemConfig::from_toml_str(SAMPLE).unwrap();
        config.children[1].id = "proc1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = SystemConfig::load_from(file.path()).unwrap();
        assert_eq!(config.system.id, "crate1");
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(SystemConfig::load_from("does/not/exist.toml").is_err());
    }
}
