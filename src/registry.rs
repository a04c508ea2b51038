//! Object-creator registry and system assembly.
//!
//! Each `[[children]]` entry names a `type`; the [`CreatorRegistry`] maps that key to a
//! function building the child from its configuration stub. The registry is built by
//! the host application and passed explicitly to [`build_system`].
//!
//! ```rust,ignore
//! let mut creators = CreatorRegistry::new();
//! creators.register("Processor", processor::create)?;
//! let config = SystemConfig::load_from("config/crate1.toml")?;
//! let system = Arc::new(build_system(&config, &creators)?);
//! ```

use crate::action::{ActionableObject, ActionableSystem, TokioThreadPool};
use crate::config::{ChildConfig, SystemConfig};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Builds an object from its configuration stub.
pub type Creator = fn(&ChildConfig) -> Result<ActionableObject>;

/// Map from type key to [`Creator`].
#[derive(Default)]
pub struct CreatorRegistry {
    creators: BTreeMap<String, Creator>,
}

impl CreatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `creator` under `type_key`.
    pub fn register(&mut self, type_key: impl Into<String>, creator: Creator) -> Result<()> {
        let type_key = type_key.into();
        if self.creators.contains_key(&type_key) {
            bail!("Creator for type '{}' is already registered", type_key);
        }
        tracing::debug!("Registered creator for type '{}'", type_key);
        self.creators.insert(type_key, creator);
        Ok(())
    }

    /// Whether `type_key` has a creator.
    pub fn contains(&self, type_key: &str) -> bool {
        self.creators.contains_key(type_key)
    }

    /// Registered type keys.
    pub fn types(&self) -> BTreeSet<String> {
        self.creators.keys().cloned().collect()
    }

    /// Create the object described by `stub`.
    ///
    /// The creator's object is given the stub's alias and gatekeeper contexts when the
    /// stub sets them.
    pub fn create(&self, stub: &ChildConfig) -> Result<ActionableObject> {
        let creator = self.creators.get(&stub.r#type).ok_or_else(|| {
            anyhow!(
                "No creator registered for type '{}' (child '{}')",
                stub.r#type,
                stub.id
            )
        })?;
        let object = creator(stub)
            .with_context(|| format!("Failed to create child '{}' of type '{}'", stub.id, stub.r#type))?;
        if object.id() != stub.id {
            bail!(
                "Creator for type '{}' returned object '{}' instead of '{}'",
                stub.r#type,
                object.id(),
                stub.id
            );
        }

        let object = match &stub.alias {
            Some(alias) => object.with_alias(alias.clone()),
            None => object,
        };
        let object = if stub.contexts.is_empty() {
            object
        } else {
            object.with_gatekeeper_contexts(stub.contexts.iter().cloned())
        };
        Ok(object)
    }
}

/// Build the system described by `config`.
///
/// The system runs on a [`TokioThreadPool`] sized by `[thread_pool] workers`, shared
/// with every child created without a pool of its own. Children with
/// `enabled = false` are added disabled.
pub fn build_system(config: &SystemConfig, creators: &CreatorRegistry) -> Result<ActionableSystem> {
    config.validate()?;

    let pool = TokioThreadPool::new(config.thread_pool.workers)?
        .with_shutdown_timeout(Duration::from_millis(config.thread_pool.shutdown_timeout_ms));
    let mut system = ActionableSystem::new(config.system.id.clone()).with_thread_pool(Arc::new(pool));
    if let Some(alias) = &config.system.alias {
        system = system.with_alias(alias.clone());
    }

    for stub in &config.children {
        let child = system.add_actionable(creators.create(stub)?)?;
        if !stub.enabled {
            child.disable();
        }
        tracing::info!(
            "Created child '{}' of type '{}'{}",
            child.path(),
            stub.r#type,
            if stub.enabled { "" } else { " (disabled)" }
        );
    }

    Ok(system)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_board(stub: &ChildConfig) -> Result<ActionableObject> {
        Ok(ActionableObject::new(stub.id.clone()))
    }

    fn create_misnamed(_stub: &ChildConfig) -> Result<ActionableObject> {
        Ok(ActionableObject::new("other"))
    }

    fn create_failing(_stub: &ChildConfig) -> Result<ActionableObject> {
        bail!("no hardware")
    }

    const CONFIG: &str = r#"
        [system]
        id = "crate1"
        alias = "Crate 1"

        [thread_pool]
        workers = 2

        [[children]]
        id = "proc1"
        type = "Board"
        alias = "Processor 1"
        contexts = ["proc1", "processors"]

        [[children]]
        id = "proc2"
        type = "Board"
        enabled = false
    "#;

    fn registry() -> CreatorRegistry {
        let mut creators = CreatorRegistry::new();
        creators.register("Board", create_board).unwrap();
        creators
    }

    #[test]
    fn test_register_duplicate_fails() {
        let mut creators = registry();
        assert!(creators.register("Board", create_board).is_err());
        assert!(creators.contains("Board"));
        assert_eq!(creators.types(), BTreeSet::from(["Board".to_string()]));
    }

    #[test]
    fn test_create_unknown_type_fails() {
        let config = SystemConfig::from_toml_str(CONFIG).unwrap();
        let mut stub = config.children[0].clone();
        stub.r#type = "Unknown".to_string();
        let err = registry().create(&stub).unwrap_err();
        assert!(err.to_string().contains("Unknown"));
    }

    #[test]
    fn test_create_checks_id_and_propagates_errors() {
        let config = SystemConfig::from_toml_str(CONFIG).unwrap();
        let mut creators = CreatorRegistry::new();
        creators.register("Board", create_misnamed).unwrap();
        assert!(creators.create(&config.children[0]).is_err());

        let mut creators = CreatorRegistry::new();
        creators.register("Board", create_failing).unwrap();
        let err = creators.create(&config.children[0]).unwrap_err();
        assert!(format!("{:#}", err).contains("no hardware"));
    }

    #[test]
    fn test_build_system() {
        let config = SystemConfig::from_toml_str(CONFIG).unwrap();
        let system = build_system(&config, &registry()).unwrap();
        assert_eq!(system.alias(), Some("Crate 1"));

        let proc1 = system.child("proc1").unwrap();
        assert_eq!(proc1.path(), "crate1.proc1");
        assert_eq!(proc1.alias().as_deref(), Some("Processor 1"));
        assert_eq!(proc1.gatekeeper_contexts(), vec!["proc1", "processors"]);
        assert!(proc1.get_status().enabled);

        let proc2 = system.child("proc2").unwrap();
        assert_eq!(proc2.gatekeeper_contexts(), vec!["proc2"]);
        assert!(!proc2.get_status().enabled);
    }

    #[test]
    fn test_build_system_rejects_invalid_config() {
        let mut config = SystemConfig::from_toml_str(CONFIG).unwrap();
        config.thread_pool.workers = 1;
        assert!(build_system(&config, &registry()).is_err());
    }
}
