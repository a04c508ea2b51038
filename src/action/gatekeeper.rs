//! Parameter, mask and monitoring-setting lookup.
//!
//! The gatekeeper is the only source of run-time parameter values for sequences and
//! transitions. Lookups are scoped by an ordered list of context ids supplied by the
//! resource (see [`ActionableObject::gatekeeper_contexts`](super::ActionableObject::gatekeeper_contexts));
//! contexts are tried in order and the first one holding a value wins, so the most
//! specific context goes first.
//!
//! Within a context a parameter is looked up under, in order:
//!
//! 1. `namespace.command.parameter`
//! 2. `command.parameter`
//! 3. `parameter`
//!
//! [`SimpleGateKeeper`] is an in-memory implementation which can also be loaded from a
//! TOML file:
//!
//! ```toml
//! disabled = ["crate2.board9"]
//!
//! [parameters.board]
//! "configure.latency" = 40
//! "setup.configure.latency" = 42
//!
//! [monitoring.board]
//! "running.ttc" = "non-critical"
//!
//! [masks.board]
//! ids = ["inputPorts.Rx07"]
//! ```

use super::monitoring::MonitoringStatus;
use crate::error::{ActionError, ActionResult};
use crate::parameter::{ParameterSet, ParameterValue};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

/// External lookup service consulted by actions and state machines.
pub trait GateKeeper: Send + Sync {
    /// Value of `parameter` for `command` run under `namespace`.
    fn get(
        &self,
        namespace: &str,
        command: &str,
        parameter: &str,
        contexts: &[String],
    ) -> Option<ParameterValue>;

    /// Monitoring status of the item at `path` while in `state`.
    fn get_monitoring_setting(
        &self,
        state: &str,
        path: &str,
        contexts: &[String],
    ) -> Option<MonitoringStatus>;

    /// Whether the item at `path` must be masked.
    fn get_mask(&self, path: &str, contexts: &[String]) -> bool;

    /// Whether the resource at `path` takes part in system actions.
    fn is_enabled(&self, path: &str) -> bool;
}

#[derive(Debug, Default, Deserialize)]
struct MaskContext {
    #[serde(default)]
    ids: BTreeSet<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GateKeeperFile {
    #[serde(default)]
    parameters: BTreeMap<String, ParameterSet>,
    #[serde(default)]
    monitoring: BTreeMap<String, BTreeMap<String, MonitoringStatus>>,
    #[serde(default)]
    masks: BTreeMap<String, MaskContext>,
    #[serde(default)]
    disabled: Vec<String>,
}

/// In-memory gatekeeper.
#[derive(Debug, Default)]
pub struct SimpleGateKeeper {
    parameters: HashMap<String, HashMap<String, ParameterValue>>,
    settings: HashMap<String, HashMap<String, MonitoringStatus>>,
    masks: HashMap<String, HashSet<String>>,
    disabled: HashSet<String>,
}

impl SimpleGateKeeper {
    /// Empty gatekeeper: no values, no masks, everything enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a gatekeeper from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ActionResult<Self> {
        let file: GateKeeperFile = Figment::new().merge(Toml::file(path.as_ref())).extract()?;

        let mut keeper = Self::new();
        for (id, values) in file.parameters {
            keeper.add_parameters_context(&id, values)?;
        }
        for (id, settings) in file.monitoring {
            keeper.add_settings_context(&id, settings)?;
        }
        for (id, masks) in file.masks {
            keeper.add_masks_context(&id, masks.ids)?;
        }
        for path in file.disabled {
            keeper.disable(path);
        }
        Ok(keeper)
    }

    /// Add a context of parameter values.
    pub fn add_parameters_context<I, K>(&mut self, id: &str, values: I) -> ActionResult<()>
    where
        I: IntoIterator<Item = (K, ParameterValue)>,
        K: Into<String>,
    {
        if self.parameters.contains_key(id) {
            return Err(ActionError::ContextWithIdAlreadyExists(format!(
                "Parameter context '{}' already exists",
                id
            )));
        }
        self.parameters.insert(
            id.to_string(),
            values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        );
        Ok(())
    }

    /// Add a context of monitoring settings, keyed `state.path` or `path`.
    pub fn add_settings_context<I, K>(&mut self, id: &str, settings: I) -> ActionResult<()>
    where
        I: IntoIterator<Item = (K, MonitoringStatus)>,
        K: Into<String>,
    {
        if self.settings.contains_key(id) {
            return Err(ActionError::ContextWithIdAlreadyExists(format!(
                "Monitoring settings context '{}' already exists",
                id
            )));
        }
        self.settings.insert(
            id.to_string(),
            settings.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        );
        Ok(())
    }

    /// Add a context listing masked paths.
    pub fn add_masks_context<I, K>(&mut self, id: &str, masked: I) -> ActionResult<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        if self.masks.contains_key(id) {
            return Err(ActionError::ContextWithIdAlreadyExists(format!(
                "Masks context '{}' already exists",
                id
            )));
        }
        self.masks
            .insert(id.to_string(), masked.into_iter().map(Into::into).collect());
        Ok(())
    }

    /// Exclude the resource at `path` from system actions.
    pub fn disable(&mut self, path: impl Into<String>) {
        self.disabled.insert(path.into());
    }
}

impl GateKeeper for SimpleGateKeeper {
    fn get(
        &self,
        namespace: &str,
        command: &str,
        parameter: &str,
        contexts: &[String],
    ) -> Option<ParameterValue> {
        let keys = [
            format!("{}.{}.{}", namespace, command, parameter),
            format!("{}.{}", command, parameter),
            parameter.to_string(),
        ];
        contexts
            .iter()
            .filter_map(|context| self.parameters.get(context))
            .find_map(|values| keys.iter().find_map(|key| values.get(key)))
            .cloned()
    }

    fn get_monitoring_setting(
        &self,
        state: &str,
        path: &str,
        contexts: &[String],
    ) -> Option<MonitoringStatus> {
        let keys = [format!("{}.{}", state, path), path.to_string()];
        contexts
            .iter()
            .filter_map(|context| self.settings.get(context))
            .find_map(|settings| keys.iter().find_map(|key| settings.get(key)))
            .copied()
    }

    fn get_mask(&self, path: &str, contexts: &[String]) -> bool {
        contexts
            .iter()
            .filter_map(|context| self.masks.get(context))
            .any(|masked| masked.contains(path))
    }

    fn is_enabled(&self, path: &str) -> bool {
        !self.disabled.contains(path)
    }
}
