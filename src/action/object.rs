//! Single hardware resource exposing commands, sequences and state machines.
//!
//! An [`ActionableObject`] owns the registries of its actions and the
//! [`ActionableStatus`] that serializes them. Actions do not point back at the object
//! itself; they share its [`ObjectCore`] (identity, status, thread pool, gatekeeper
//! contexts, maskable and monitorable descendants), so there is no reference cycle
//! between an object and the actions it owns.
//!
//! Hardware access is not part of the object: command code captures whatever typed
//! driver handle it needs when the command is built.
//!
//! ```rust,ignore
//! let board = ActionableObject::new("board1")
//!     .with_alias("Processor 1")
//!     .with_gatekeeper_contexts(["board1", "processors"]);
//! let reset = board.register_command(reset_command(driver.clone()))?;
//! let configure = board.register_command(configure_command(driver))?;
//! board.register_sequence("setup", &reset, "")?.then(&configure, "")?;
//! ```

use super::command::Command;
use super::functionoid::Functionoid;
use super::gatekeeper::GateKeeper;
use super::monitoring::{MaskableObject, MonitorableObject, MonitoringStatus};
use super::sequence::CommandSequence;
use super::state_machine::StateMachine;
use super::status::{ActionableSnapshot, ActionableStatus};
use super::thread_pool::{self, ThreadPool};
use crate::error::{ActionError, ActionResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Monitoring statuses to apply when a state is entered.
pub(crate) type MonitoringSettings = Vec<(Arc<MonitorableObject>, MonitoringStatus)>;

// =============================================================================
// Shared core
// =============================================================================

/// Part of a resource shared with the actions registered on it.
pub(crate) struct ObjectCore {
    id: String,
    alias: RwLock<Option<String>>,
    parent_path: RwLock<Option<String>>,
    status: Arc<ActionableStatus>,
    thread_pool: RwLock<Option<Arc<dyn ThreadPool>>>,
    contexts: RwLock<Vec<String>>,
    maskables: RwLock<BTreeMap<String, Arc<MaskableObject>>>,
    monitorables: RwLock<BTreeMap<String, Arc<MonitorableObject>>>,
    monitoring_status: RwLock<MonitoringStatus>,
}

impl fmt::Debug for ObjectCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCore")
            .field("path", &self.path())
            .field("status", &self.status)
            .finish()
    }
}

impl ObjectCore {
    fn new(id: String) -> Self {
        Self {
            contexts: RwLock::new(vec![id.clone()]),
            id,
            alias: RwLock::new(None),
            parent_path: RwLock::new(None),
            status: Arc::new(ActionableStatus::new()),
            thread_pool: RwLock::new(None),
            maskables: RwLock::new(BTreeMap::new()),
            monitorables: RwLock::new(BTreeMap::new()),
            monitoring_status: RwLock::new(MonitoringStatus::Enabled),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn alias(&self) -> Option<String> {
        self.alias.read().clone()
    }

    pub(crate) fn path(&self) -> String {
        match self.parent_path.read().as_deref() {
            Some(parent) => format!("{}.{}", parent, self.id),
            None => self.id.clone(),
        }
    }

    pub(crate) fn status(&self) -> &Arc<ActionableStatus> {
        &self.status
    }

    pub(crate) fn thread_pool(&self) -> Arc<dyn ThreadPool> {
        self.thread_pool
            .read()
            .as_ref()
            .map_or_else(thread_pool::shared, Arc::clone)
    }

    pub(crate) fn gatekeeper_contexts(&self) -> Vec<String> {
        self.contexts.read().clone()
    }

    pub(crate) fn set_monitoring_status(&self, status: MonitoringStatus) {
        *self.monitoring_status.write() = status;
    }

    /// Monitoring status of every monitorable in `state`; Enabled when the gatekeeper
    /// has no setting.
    pub(crate) fn monitoring_settings(&self, state: &str, gk: &dyn GateKeeper) -> MonitoringSettings {
        let contexts = self.gatekeeper_contexts();
        self.monitorables
            .read()
            .values()
            .map(|item| {
                let status = gk
                    .get_monitoring_setting(state, item.id(), &contexts)
                    .unwrap_or(MonitoringStatus::Enabled);
                (Arc::clone(item), status)
            })
            .collect()
    }

    pub(crate) fn apply_monitoring_settings(settings: &MonitoringSettings) {
        for (item, status) in settings {
            item.set_monitoring_status(*status);
        }
    }

    pub(crate) fn reset_and_apply_masks(&self, gk: &dyn GateKeeper) {
        let contexts = self.gatekeeper_contexts();
        for item in self.maskables.read().values() {
            let masked = gk.get_mask(item.id(), &contexts);
            if masked {
                tracing::debug!("Masking '{}.{}'", self.path(), item.id());
            }
            item.set_masked(masked);
        }
    }
}

struct MetricUpdate<'a>(&'a ActionableStatus);

impl Drop for MetricUpdate<'_> {
    fn drop(&mut self) {
        self.0.lock().finish_metric_update();
    }
}

// =============================================================================
// ActionableObject
// =============================================================================

/// Resource with its own commands, sequences and state machines.
pub struct ActionableObject {
    core: Arc<ObjectCore>,
    commands: RwLock<BTreeMap<String, Arc<Command>>>,
    sequences: RwLock<BTreeMap<String, Arc<CommandSequence>>>,
    state_machines: RwLock<BTreeMap<String, Arc<StateMachine>>>,
}

impl fmt::Debug for ActionableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionableObject")
            .field("path", &self.path())
            .field("commands", &self.commands())
            .field("sequences", &self.sequences())
            .field("state_machines", &self.state_machines())
            .finish()
    }
}

impl ActionableObject {
    /// Idle, enabled resource with no actions.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            core: Arc::new(ObjectCore::new(id.into())),
            commands: RwLock::new(BTreeMap::new()),
            sequences: RwLock::new(BTreeMap::new()),
            state_machines: RwLock::new(BTreeMap::new()),
        }
    }

    /// Set the alias.
    pub fn with_alias(self, alias: impl Into<String>) -> Self {
        *self.core.alias.write() = Some(alias.into());
        self
    }

    /// Gatekeeper contexts, most specific first. Defaults to the object id.
    pub fn with_gatekeeper_contexts<I, S>(self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.core.contexts.write() = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Run asynchronous actions on `pool` instead of the shared pool.
    pub fn with_thread_pool(self, pool: Arc<dyn ThreadPool>) -> Self {
        *self.core.thread_pool.write() = Some(pool);
        self
    }

    pub(crate) fn core(&self) -> &Arc<ObjectCore> {
        &self.core
    }

    pub(crate) fn set_parent_path(&self, parent: &str) {
        *self.core.parent_path.write() = Some(parent.to_string());
    }

    pub(crate) fn has_thread_pool(&self) -> bool {
        self.core.thread_pool.read().is_some()
    }

    // -------------------------------------------------------------------------
    // Identity and status
    // -------------------------------------------------------------------------

    /// Object id.
    pub fn id(&self) -> &str {
        self.core.id()
    }

    /// Object alias.
    pub fn alias(&self) -> Option<String> {
        self.core.alias()
    }

    /// Dotted path, prefixed by the owning system if any.
    pub fn path(&self) -> String {
        self.core.path()
    }

    /// Gatekeeper contexts, most specific first.
    pub fn gatekeeper_contexts(&self) -> Vec<String> {
        self.core.gatekeeper_contexts()
    }

    /// Concurrency status.
    pub fn status(&self) -> &Arc<ActionableStatus> {
        self.core.status()
    }

    /// Snapshot of the concurrency status.
    pub fn get_status(&self) -> ActionableSnapshot {
        self.core.status().snapshot()
    }

    /// Accept new top-level actions again.
    pub fn enable(&self) {
        self.core.status().lock().enable();
    }

    /// Refuse new top-level actions. Running ones continue.
    pub fn disable(&self) {
        self.core.status().lock().disable();
    }

    // -------------------------------------------------------------------------
    // Registries
    // -------------------------------------------------------------------------

    /// Register a command. Its parameter schema is fixed from now on.
    pub fn register_command(&self, mut command: Command) -> ActionResult<Arc<Command>> {
        let mut commands = self.commands.write();
        if commands.contains_key(command.id()) {
            return Err(ActionError::CommandAlreadyExistsInActionableObject(format!(
                "Command '{}' already exists in resource '{}'",
                command.id(),
                self.path()
            )));
        }
        command.bind(Arc::clone(&self.core));
        let command = Arc::new(command);
        commands.insert(command.id().to_string(), Arc::clone(&command));
        Ok(command)
    }

    /// Registered command `id`.
    pub fn command(&self, id: &str) -> ActionResult<Arc<Command>> {
        self.commands.read().get(id).cloned().ok_or_else(|| {
            ActionError::CommandNotFoundInActionableObject(format!(
                "Command '{}' not found in resource '{}'",
                id,
                self.path()
            ))
        })
    }

    /// Ids of the registered commands.
    pub fn commands(&self) -> BTreeSet<String> {
        self.commands.read().keys().cloned().collect()
    }

    /// Register a sequence starting with `first`. An empty namespace means the
    /// sequence id.
    pub fn register_sequence(
        &self,
        id: &str,
        first: &Arc<Command>,
        namespace: &str,
    ) -> ActionResult<Arc<CommandSequence>> {
        let mut sequences = self.sequences.write();
        if sequences.contains_key(id) {
            return Err(ActionError::CommandSequenceAlreadyExistsInActionableObject(format!(
                "Command sequence '{}' already exists in resource '{}'",
                id,
                self.path()
            )));
        }
        let sequence = Arc::new(CommandSequence::new(Arc::clone(&self.core), id));
        sequence.run(first, namespace)?;
        sequences.insert(id.to_string(), Arc::clone(&sequence));
        Ok(sequence)
    }

    /// Register a sequence starting with the registered command `first`.
    pub fn register_sequence_of(
        &self,
        id: &str,
        first: &str,
        namespace: &str,
    ) -> ActionResult<Arc<CommandSequence>> {
        let first = self.command(first)?;
        self.register_sequence(id, &first, namespace)
    }

    /// Registered sequence `id`.
    pub fn sequence(&self, id: &str) -> ActionResult<Arc<CommandSequence>> {
        self.sequences.read().get(id).cloned().ok_or_else(|| {
            ActionError::CommandSequenceNotFoundInActionableObject(format!(
                "Command sequence '{}' not found in resource '{}'",
                id,
                self.path()
            ))
        })
    }

    /// Ids of the registered sequences.
    pub fn sequences(&self) -> BTreeSet<String> {
        self.sequences.read().keys().cloned().collect()
    }

    /// Register a state machine with its initial and error states.
    pub fn register_state_machine(
        &self,
        id: &str,
        initial_state: &str,
        error_state: &str,
    ) -> ActionResult<Arc<StateMachine>> {
        let mut machines = self.state_machines.write();
        if machines.contains_key(id) {
            return Err(ActionError::StateMachineAlreadyExistsInActionableObject(format!(
                "State machine '{}' already exists in resource '{}'",
                id,
                self.path()
            )));
        }
        let machine = Arc::new(StateMachine::new(
            Arc::clone(&self.core),
            id,
            initial_state,
            error_state,
        )?);
        machines.insert(id.to_string(), Arc::clone(&machine));
        Ok(machine)
    }

    /// Registered state machine `id`.
    pub fn state_machine(&self, id: &str) -> ActionResult<Arc<StateMachine>> {
        self.state_machines.read().get(id).cloned().ok_or_else(|| {
            ActionError::StateMachineNotFoundInActionableObject(format!(
                "State machine '{}' not found in resource '{}'",
                id,
                self.path()
            ))
        })
    }

    /// Ids of the registered state machines.
    pub fn state_machines(&self) -> BTreeSet<String> {
        self.state_machines.read().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Masks and monitoring
    // -------------------------------------------------------------------------

    /// Declare a maskable descendant at `relative_path`.
    pub fn add_maskable(&self, relative_path: &str) -> ActionResult<Arc<MaskableObject>> {
        let mut maskables = self.core.maskables.write();
        if maskables.contains_key(relative_path) {
            return Err(ActionError::InvalidArgument(format!(
                "Maskable '{}' already declared in resource '{}'",
                relative_path,
                self.path()
            )));
        }
        let item = Arc::new(MaskableObject::new(relative_path));
        maskables.insert(relative_path.to_string(), Arc::clone(&item));
        Ok(item)
    }

    /// Maskable descendants by relative path.
    pub fn maskables(&self) -> BTreeMap<String, Arc<MaskableObject>> {
        self.core.maskables.read().clone()
    }

    /// Declare a monitorable descendant at `relative_path`.
    pub fn add_monitorable(&self, relative_path: &str) -> ActionResult<Arc<MonitorableObject>> {
        let mut monitorables = self.core.monitorables.write();
        if monitorables.contains_key(relative_path) {
            return Err(ActionError::InvalidArgument(format!(
                "Monitorable '{}' already declared in resource '{}'",
                relative_path,
                self.path()
            )));
        }
        let item = Arc::new(MonitorableObject::new(relative_path));
        monitorables.insert(relative_path.to_string(), Arc::clone(&item));
        Ok(item)
    }

    /// Monitorable descendants by relative path.
    pub fn monitorables(&self) -> BTreeMap<String, Arc<MonitorableObject>> {
        self.core.monitorables.read().clone()
    }

    /// Monitoring status of the object itself.
    pub fn monitoring_status(&self) -> MonitoringStatus {
        *self.core.monitoring_status.read()
    }

    /// Change the monitoring status of the object itself.
    pub fn set_monitoring_status(&self, status: MonitoringStatus) {
        self.core.set_monitoring_status(status);
    }

    /// Set every maskable's flag from the gatekeeper.
    pub fn reset_and_apply_masks(&self, gk: &dyn GateKeeper) {
        self.core.reset_and_apply_masks(gk);
    }

    /// Apply the gatekeeper's monitoring settings for `state`; monitorables without a
    /// setting go back to Enabled.
    pub fn apply_monitoring_settings(&self, state: &str, gk: &dyn GateKeeper) {
        ObjectCore::apply_monitoring_settings(&self.core.monitoring_settings(state, gk));
    }

    /// Refresh monitoring data with `update`. New actions wait until it returns.
    pub fn update_metrics<F, R>(&self, update: F) -> R
    where
        F: FnOnce() -> R,
    {
        let status = self.core.status();
        status.lock().begin_metric_update();
        let _updating = MetricUpdate(status);
        update()
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Refuse new actions, wait until running ones finish, then release this handle.
    pub fn delete(self: Arc<Self>) {
        let path = self.path();
        {
            let mut guard = self.core.status().lock();
            guard.kill();
            if guard.is_running() {
                tracing::info!("Waiting for running actions to finish before deleting '{}'", path);
            }
            guard.wait_until_idle();
        }
        tracing::debug!("Deleting resource '{}'", path);
    }
}
