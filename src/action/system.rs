//! Resource owning a set of [`ActionableObject`] children.
//!
//! Children are added while the system is still being built (`&mut self`); once the
//! system is shared behind an `Arc` its membership is fixed, which is what lets
//! [`lock_mutexes`](ActionableSystem::lock_mutexes) lock the system status and every
//! child status in one canonical order.
//!
//! ```rust,ignore
//! let mut system = ActionableSystem::new("crate1");
//! system.add_actionable(processor("proc1")?)?;
//! system.add_actionable(processor("proc2")?)?;
//! let system = Arc::new(system);
//! let fsm = system.register_state_machine("run", "halted", "error")?;
//! ```

use super::object::ActionableObject;
use super::status::{ActionableSnapshot, ActionableStatus, StatusContainer, StatusGuardMap};
use super::system_state_machine::SystemStateMachine;
use super::thread_pool::{self, ThreadPool};
use crate::error::{ActionError, ActionResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// System of actionable children with its own status and state machines.
pub struct ActionableSystem {
    id: String,
    alias: Option<String>,
    status: Arc<ActionableStatus>,
    children: BTreeMap<String, Arc<ActionableObject>>,
    container: StatusContainer,
    state_machines: RwLock<BTreeMap<String, Arc<SystemStateMachine>>>,
    thread_pool: Option<Arc<dyn ThreadPool>>,
}

impl fmt::Debug for ActionableSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionableSystem")
            .field("id", &self.id)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("state_machines", &self.state_machines())
            .finish()
    }
}

impl ActionableSystem {
    /// Empty system.
    pub fn new(id: impl Into<String>) -> Self {
        let status = Arc::new(ActionableStatus::new());
        Self {
            id: id.into(),
            alias: None,
            container: StatusContainer::new(Arc::clone(&status)),
            status,
            children: BTreeMap::new(),
            state_machines: RwLock::new(BTreeMap::new()),
            thread_pool: None,
        }
    }

    /// Set the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Run system transitions, and the actions of children added later without a
    /// pool of their own, on `pool`.
    pub fn with_thread_pool(mut self, pool: Arc<dyn ThreadPool>) -> Self {
        self.thread_pool = Some(pool);
        self
    }

    /// System id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// System alias.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Path of the system (its id).
    pub fn path(&self) -> String {
        self.id.clone()
    }

    pub(crate) fn thread_pool(&self) -> Arc<dyn ThreadPool> {
        self.thread_pool
            .as_ref()
            .map_or_else(thread_pool::shared, Arc::clone)
    }

    // -------------------------------------------------------------------------
    // Children
    // -------------------------------------------------------------------------

    /// Add a child. Its path becomes `<system>.<child>`.
    pub fn add_actionable(&mut self, child: ActionableObject) -> ActionResult<Arc<ActionableObject>> {
        if self.children.contains_key(child.id()) {
            return Err(ActionError::InvalidArgument(format!(
                "System '{}' already contains a child with id '{}'",
                self.id,
                child.id()
            )));
        }
        let child = match &self.thread_pool {
            Some(pool) if !child.has_thread_pool() => child.with_thread_pool(Arc::clone(pool)),
            _ => child,
        };
        child.set_parent_path(&self.id);
        if !self.container.add_child(child.id(), Arc::clone(child.status())) {
            return Err(ActionError::InvalidArgument(format!(
                "Status of child '{}' already registered in system '{}'",
                child.id(),
                self.id
            )));
        }
        tracing::debug!("Added child '{}' to system '{}'", child.path(), self.id);
        let child = Arc::new(child);
        self.children.insert(child.id().to_string(), Arc::clone(&child));
        Ok(child)
    }

    /// Children by id.
    pub fn actionable_children(&self) -> &BTreeMap<String, Arc<ActionableObject>> {
        &self.children
    }

    /// Child `id`.
    pub fn child(&self, id: &str) -> ActionResult<&Arc<ActionableObject>> {
        self.children.get(id).ok_or_else(|| {
            ActionError::InvalidResource(format!(
                "System '{}' has no child with id '{}'",
                self.id, id
            ))
        })
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Concurrency status of the system itself.
    pub fn status(&self) -> &Arc<ActionableStatus> {
        &self.status
    }

    /// Snapshot of the system status.
    pub fn get_status(&self) -> ActionableSnapshot {
        self.status.snapshot()
    }

    /// Lock the system status and every child status, in canonical order.
    pub fn lock_mutexes(&self) -> StatusGuardMap<'_> {
        self.container.lock_mutexes()
    }

    // -------------------------------------------------------------------------
    // State machines
    // -------------------------------------------------------------------------

    /// Register a system state machine with its initial and error states.
    pub fn register_state_machine(
        self: &Arc<Self>,
        id: &str,
        initial_state: &str,
        error_state: &str,
    ) -> ActionResult<Arc<SystemStateMachine>> {
        let mut machines = self.state_machines.write();
        if machines.contains_key(id) {
            return Err(ActionError::StateMachineAlreadyExistsInActionableObject(format!(
                "State machine '{}' already exists in system '{}'",
                id, self.id
            )));
        }
        let machine = Arc::new(SystemStateMachine::new(
            Arc::downgrade(self),
            &self.id,
            id,
            initial_state,
            error_state,
        )?);
        machines.insert(id.to_string(), Arc::clone(&machine));
        Ok(machine)
    }

    /// Registered state machine `id`.
    pub fn state_machine(&self, id: &str) -> ActionResult<Arc<SystemStateMachine>> {
        self.state_machines.read().get(id).cloned().ok_or_else(|| {
            ActionError::StateMachineNotFoundInActionableObject(format!(
                "State machine '{}' not found in system '{}'",
                id, self.id
            ))
        })
    }

    /// Ids of the registered state machines.
    pub fn state_machines(&self) -> BTreeSet<String> {
        self.state_machines.read().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Refuse new actions, wait for running ones on the system and then on every child.
    pub fn delete(self: Arc<Self>) {
        {
            let mut guard = self.status.lock();
            guard.kill();
            if guard.is_running() {
                tracing::info!(
                    "Waiting for running actions to finish before deleting system '{}'",
                    self.id
                );
            }
            guard.wait_until_idle();
        }
        for child in self.children.values() {
            Arc::clone(child).delete();
        }
        tracing::debug!("Deleting system '{}'", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::thread_pool::TokioThreadPool;

    #[test]
    fn test_children_get_system_prefix() {
        let mut system = ActionableSystem::new("crate1").with_alias("Crate 1");
        let child = system.add_actionable(ActionableObject::new("proc1")).unwrap();
        assert_eq!(child.path(), "crate1.proc1");
        assert_eq!(system.alias(), Some("Crate 1"));
        assert!(system.add_actionable(ActionableObject::new("proc1")).is_err());
        assert!(system.child("proc2").is_err());

        let guards = system.lock_mutexes();
        assert_eq!(guards.child_ids().collect::<Vec<_>>(), vec!["proc1"]);
    }

    #[test]
    fn test_children_inherit_thread_pool() {
        let pool = Arc::new(TokioThreadPool::new(2).unwrap());
        let mut system = ActionableSystem::new("crate1").with_thread_pool(pool);
        let child = system.add_actionable(ActionableObject::new("proc1")).unwrap();
        assert!(child.has_thread_pool());
    }

    #[test]
    fn test_state_machine_registry() {
        let system = Arc::new(ActionableSystem::new("crate1"));
        system.register_state_machine("run", "halted", "error").unwrap();
        assert!(matches!(
            system.register_state_machine("run", "halted", "error"),
            Err(ActionError::StateMachineAlreadyExistsInActionableObject(_))
        ));
        assert!(system.state_machine("other").is_err());
        assert_eq!(system.state_machines(), BTreeSet::from(["run".to_string()]));
    }

    #[test]
    fn test_delete_kills_system_and_children() {
        let mut system = ActionableSystem::new("crate1");
        let child = system.add_actionable(ActionableObject::new("proc1")).unwrap();
        let system = Arc::new(system);
        let status = Arc::clone(system.status());
        system.delete();
        assert!(!status.snapshot().alive);
        assert!(!child.get_status().alive);
    }
}
