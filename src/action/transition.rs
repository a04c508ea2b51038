//! Command list moving a resource from one state of a state machine to another.
//!
//! A transition only runs while its resource is engaged in the owning state machine and
//! sits in the transition's start state; both are checked under the status lock at the
//! moment of the claim. When the list finishes the resource enters the end state
//! (`Done`/`Warning`) or the machine's error state (`Error`), and the gatekeeper's
//! monitoring settings for that state are applied.

use super::busy_guard::{BusyGuard, BusyGuardCallback};
use super::command::Command;
use super::command_vec::{
    CommandVec, CommandVecSnapshot, Element, MissingParam, ParamRuleViolationList, PreparedRun,
};
use super::functionoid::{ActionKind, Functionoid, FunctionoidState};
use super::gatekeeper::GateKeeper;
use super::object::{MonitoringSettings, ObjectCore};
use super::sequence::CommandSequence;
use super::status::ActionableStatusGuard;
use crate::error::{ActionError, ActionResult};
use crate::parameter::ParameterSet;
use std::fmt;
use std::sync::Arc;

/// Everything a transition needs to run, gathered before the claim.
#[derive(Debug)]
pub(crate) struct TransitionPlan {
    run: PreparedRun,
    on_success: MonitoringSettings,
    on_error: MonitoringSettings,
}

/// Transition of a [`StateMachine`](super::StateMachine).
pub struct Transition {
    vec: Arc<CommandVec>,
    state_machine: String,
    start: String,
    end: String,
    error_state: String,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("path", &self.path())
            .field("start", &self.start)
            .field("end", &self.end)
            .field("size", &self.size())
            .finish()
    }
}

impl Transition {
    pub(crate) fn new(
        owner: Arc<ObjectCore>,
        state_machine: &str,
        id: &str,
        start: &str,
        end: &str,
        error_state: &str,
    ) -> Self {
        let suffix = format!("{}.{}.{}", state_machine, start, id);
        Self {
            vec: Arc::new(CommandVec::new(owner, id, ActionKind::Transition, suffix)),
            state_machine: state_machine.to_string(),
            start: start.to_string(),
            end: end.to_string(),
            error_state: error_state.to_string(),
        }
    }

    /// Id of the owning state machine.
    pub fn state_machine(&self) -> &str {
        &self.state_machine
    }

    /// State the resource must be in.
    pub fn start_state(&self) -> &str {
        &self.start
    }

    /// State entered on success.
    pub fn end_state(&self) -> &str {
        &self.end
    }

    /// Id of the resource this transition belongs to.
    pub fn actionable_id(&self) -> &str {
        self.vec.owner().id()
    }

    pub(crate) fn owner(&self) -> &Arc<ObjectCore> {
        self.vec.owner()
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    /// Append `command`. An empty namespace means the transition id.
    pub fn add(&self, command: &Arc<Command>, namespace: &str) -> ActionResult<&Self> {
        let namespace = if namespace.is_empty() {
            self.vec.id()
        } else {
            namespace
        };
        self.vec.add(command, namespace)?;
        Ok(self)
    }

    /// Append every step of `sequence`, keeping their namespaces.
    pub fn add_sequence(&self, sequence: &CommandSequence) -> ActionResult<&Self> {
        for element in sequence.elements() {
            self.vec.add(element.command(), element.namespace())?;
        }
        Ok(self)
    }

    /// Number of commands.
    pub fn size(&self) -> usize {
        self.vec.size()
    }

    /// Commands with their namespaces, in order.
    pub fn elements(&self) -> Vec<Element> {
        self.vec.elements()
    }

    /// See [`CommandVec::check_for_missing_parameters`].
    pub fn check_for_missing_parameters(
        &self,
        gk: &dyn GateKeeper,
    ) -> (Vec<ParameterSet>, Vec<MissingParam>) {
        self.vec.check_for_missing_parameters(gk)
    }

    /// See [`CommandVec::check_for_invalid_parameters`].
    pub fn check_for_invalid_parameters(
        &self,
        sets: &[ParameterSet],
    ) -> ActionResult<Vec<ParamRuleViolationList>> {
        self.vec.check_for_invalid_parameters(sets)
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Check that `guard` shows the resource engaged in this machine, in the start state.
    pub(crate) fn check_state(&self, guard: &ActionableStatusGuard<'_>) -> ActionResult<()> {
        let path = self.vec.owner().path();
        if guard.state_machine() != Some(self.state_machine.as_str()) {
            return Err(ActionError::ResourceInWrongStateMachine(format!(
                "Cannot run transition '{}': resource '{}' is not engaged in state machine '{}'",
                self.id(),
                path,
                self.state_machine
            )));
        }
        if guard.state() != Some(self.start.as_str()) {
            return Err(ActionError::ResourceInWrongState(format!(
                "Cannot run transition '{}': resource '{}' is in state '{}', not '{}'",
                self.id(),
                path,
                guard.state().unwrap_or_default(),
                self.start
            )));
        }
        Ok(())
    }

    pub(crate) fn prepare(&self, gk: &dyn GateKeeper) -> ActionResult<TransitionPlan> {
        let owner = self.vec.owner();
        Ok(TransitionPlan {
            run: self.vec.prepare(gk)?,
            on_success: owner.monitoring_settings(&self.end, gk),
            on_error: owner.monitoring_settings(&self.error_state, gk),
        })
    }

    pub(crate) fn launch(
        &self,
        plan: TransitionPlan,
        outer: Option<&BusyGuard>,
        use_pool: bool,
    ) -> ActionResult<()> {
        let TransitionPlan {
            run,
            on_success,
            on_error,
        } = plan;
        let vec = Arc::clone(&self.vec);
        let end = self.end.clone();
        let error_state = self.error_state.clone();
        let callback: BusyGuardCallback = Box::new(
            move |guard: &mut ActionableStatusGuard<'_>, suffix: &mut String| {
                let (state, settings) = if vec.state().is_successful() {
                    (end, on_success)
                } else {
                    (error_state, on_error)
                };
                guard.set_state(&state);
                ObjectCore::apply_monitoring_settings(&settings);
                suffix.push_str(&format!(" Entering state '{}'", state));
            },
        );
        let check = |guard: &ActionableStatusGuard<'_>| self.check_state(guard);
        self.vec
            .launch(run, outer, use_pool, Some(&check), Some(callback))
    }

    /// Look up parameters in `gk`, check them, claim the resource and run the
    /// transition.
    ///
    /// Fails without touching the resource if parameters are missing or invalid, or if
    /// the resource is not in the start state of this transition's machine.
    pub fn exec(
        &self,
        gk: &dyn GateKeeper,
        outer: Option<&BusyGuard>,
        use_pool: bool,
    ) -> ActionResult<()> {
        let plan = self.prepare(gk)?;
        self.launch(plan, outer, use_pool)
    }

    /// Snapshot of the current or last run.
    pub fn get_status(&self) -> CommandVecSnapshot {
        self.vec.get_status()
    }
}

impl Functionoid for Transition {
    fn uid(&self) -> u64 {
        self.vec.uid()
    }

    fn id(&self) -> &str {
        self.vec.id()
    }

    fn alias(&self) -> Option<&str> {
        None
    }

    fn path(&self) -> String {
        self.vec.path()
    }

    fn state(&self) -> FunctionoidState {
        self.vec.state()
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Transition
    }
}
