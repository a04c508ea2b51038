//! Finite state machine of a single resource.
//!
//! A resource is engaged in at most one state machine at a time. While engaged, its
//! current state lives in the resource's [`ActionableStatus`](super::ActionableStatus)
//! (so it is read and changed under the same lock as the running-actions stack), and
//! only the machine's [`Transition`]s starting from that state can run.
//!
//! ```rust,ignore
//! let fsm = board.register_state_machine("run", "halted", "error")?;
//! fsm.add_state("configured")?;
//! fsm.add_transition("configure", "halted", "configured")?
//!     .add(&reset, "")?
//!     .add(&configure, "")?;
//! fsm.engage(&gatekeeper)?;
//! fsm.transition("halted", "configure")?.exec(&gatekeeper, None, true)?;
//! ```

use super::gatekeeper::GateKeeper;
use super::object::ObjectCore;
use super::status::ActionableStatusGuard;
use super::transition::Transition;
use crate::error::{ActionError, ActionResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// State machine registered on an [`ActionableObject`](super::ActionableObject).
pub struct StateMachine {
    id: String,
    owner: Arc<ObjectCore>,
    initial: String,
    error: String,
    states: RwLock<Vec<String>>,
    transitions: RwLock<BTreeMap<String, BTreeMap<String, Arc<Transition>>>>,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("resource", &self.owner.path())
            .field("states", &*self.states.read())
            .finish()
    }
}

impl StateMachine {
    pub(crate) fn new(
        owner: Arc<ObjectCore>,
        id: &str,
        initial: &str,
        error: &str,
    ) -> ActionResult<Self> {
        let machine = Self {
            id: id.to_string(),
            owner,
            initial: initial.to_string(),
            error: error.to_string(),
            states: RwLock::new(Vec::new()),
            transitions: RwLock::new(BTreeMap::new()),
        };
        machine.add_state(initial)?;
        machine.add_state(error)?;
        Ok(machine)
    }

    /// Machine id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path: resource path, then machine id.
    pub fn path(&self) -> String {
        format!("{}.{}", self.owner.path(), self.id)
    }

    /// Id of the owning resource.
    pub fn actionable_id(&self) -> &str {
        self.owner.id()
    }

    /// State entered on engage and reset.
    pub fn initial_state(&self) -> &str {
        &self.initial
    }

    /// State entered when a transition fails.
    pub fn error_state(&self) -> &str {
        &self.error
    }

    pub(crate) fn owner(&self) -> &Arc<ObjectCore> {
        &self.owner
    }

    // -------------------------------------------------------------------------
    // Definition
    // -------------------------------------------------------------------------

    /// Add a state.
    pub fn add_state(&self, state: &str) -> ActionResult<()> {
        let mut states = self.states.write();
        if states.iter().any(|s| s == state) {
            return Err(ActionError::StateAlreadyDefined(format!(
                "State '{}' already defined in state machine '{}'",
                state,
                self.path()
            )));
        }
        states.push(state.to_string());
        self.transitions.write().insert(state.to_string(), BTreeMap::new());
        Ok(())
    }

    /// States, in the order they were added.
    pub fn states(&self) -> Vec<String> {
        self.states.read().clone()
    }

    fn check_state_defined(&self, state: &str) -> ActionResult<()> {
        if self.states.read().iter().any(|s| s == state) {
            Ok(())
        } else {
            Err(ActionError::StateNotDefined(format!(
                "State '{}' not defined in state machine '{}'",
                state,
                self.path()
            )))
        }
    }

    /// Add an empty transition from `from` to `to`.
    pub fn add_transition(&self, id: &str, from: &str, to: &str) -> ActionResult<Arc<Transition>> {
        self.check_state_defined(from)?;
        self.check_state_defined(to)?;

        let mut transitions = self.transitions.write();
        let from_state = transitions.entry(from.to_string()).or_default();
        if from_state.contains_key(id) {
            return Err(ActionError::TransitionAlreadyDefined(format!(
                "Transition '{}' from state '{}' already defined in state machine '{}'",
                id,
                from,
                self.path()
            )));
        }
        let transition = Arc::new(Transition::new(
            Arc::clone(&self.owner),
            &self.id,
            id,
            from,
            to,
            &self.error,
        ));
        from_state.insert(id.to_string(), Arc::clone(&transition));
        Ok(transition)
    }

    /// Transition `id` leaving state `from`.
    pub fn transition(&self, from: &str, id: &str) -> ActionResult<Arc<Transition>> {
        self.check_state_defined(from)?;
        self.transitions
            .read()
            .get(from)
            .and_then(|t| t.get(id))
            .cloned()
            .ok_or_else(|| {
                ActionError::InvalidArgument(format!(
                    "No transition '{}' from state '{}' in state machine '{}'",
                    id,
                    from,
                    self.path()
                ))
            })
    }

    /// Transitions leaving state `from`, by id.
    pub fn transitions(&self, from: &str) -> ActionResult<BTreeMap<String, Arc<Transition>>> {
        self.check_state_defined(from)?;
        Ok(self.transitions.read().get(from).cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Engagement
    // -------------------------------------------------------------------------

    /// Engage the resource in this machine: enter the initial state, apply masks and
    /// the initial state's monitoring settings.
    pub fn engage(&self, gk: &dyn GateKeeper) -> ActionResult<()> {
        let mut guard = self.owner.status().lock();
        if let Some(current) = guard.state_machine() {
            return Err(ActionError::ResourceInWrongStateMachine(format!(
                "Cannot engage state machine '{}'; resource '{}' currently in state machine '{}'",
                self.id,
                self.owner.path(),
                current
            )));
        }
        self.enter_initial(&mut guard, gk, true);
        Ok(())
    }

    /// Release the resource from this machine.
    pub fn disengage(&self) -> ActionResult<()> {
        let mut guard = self.owner.status().lock();
        self.check_engaged_and_idle(&guard, "disengage")?;
        tracing::info!(
            "Disengaging '{}' from state machine '{}'",
            self.owner.path(),
            self.id
        );
        guard.set_no_state_machine();
        Ok(())
    }

    /// Go back to the initial state, re-applying masks and monitoring settings.
    pub fn reset(&self, gk: &dyn GateKeeper) -> ActionResult<()> {
        let mut guard = self.owner.status().lock();
        self.check_engaged_and_idle(&guard, "reset")?;
        self.enter_initial(&mut guard, gk, false);
        Ok(())
    }

    pub(crate) fn check_engaged_and_idle(
        &self,
        guard: &ActionableStatusGuard<'_>,
        action: &str,
    ) -> ActionResult<()> {
        if guard.state_machine() != Some(self.id.as_str()) {
            let current = match guard.state_machine() {
                Some(other) => format!("currently in state machine '{}'", other),
                None => "NOT in any state machine".to_string(),
            };
            return Err(ActionError::ResourceInWrongStateMachine(format!(
                "Cannot {} state machine '{}' of '{}'; {}",
                action,
                self.id,
                self.owner.path(),
                current
            )));
        }
        if let Some(running) = guard.innermost_action() {
            return Err(ActionError::ActionableObjectIsBusy(format!(
                "Cannot {} state machine '{}'; resource '{}' is busy running {}",
                action,
                self.id,
                self.owner.path(),
                running
            )));
        }
        Ok(())
    }

    /// Enter the initial state (engaging this machine if `engage`), then apply masks and
    /// monitoring settings. Caller holds the resource's status lock.
    pub(crate) fn enter_initial(
        &self,
        guard: &mut ActionableStatusGuard<'_>,
        gk: &dyn GateKeeper,
        engage: bool,
    ) {
        if engage {
            tracing::info!(
                "Engaging '{}' in state machine '{}'; entering state '{}'",
                self.owner.path(),
                self.id,
                self.initial
            );
            guard.set_state_machine(&self.id, &self.initial);
        } else {
            tracing::info!(
                "Resetting state machine '{}' of '{}'; entering state '{}'",
                self.id,
                self.owner.path(),
                self.initial
            );
            guard.set_state(&self.initial);
        }
        self.owner.reset_and_apply_masks(gk);
        ObjectCore::apply_monitoring_settings(&self.owner.monitoring_settings(&self.initial, gk));
    }
}
