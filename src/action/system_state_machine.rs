//! State machine of an [`ActionableSystem`], coordinating the state machines of its
//! children.
//!
//! A [`SystemTransition`] is a list of steps; each step holds at most one object-level
//! [`Transition`] per child. Running it:
//!
//! 1. locks the system status and every child status together;
//! 2. checks the parameters of every enabled child's transitions;
//! 3. checks that the system and each enabled participant sit in the right machine and
//!    state;
//! 4. claims the system and its enabled participants atomically ([`SystemBusyGuard`]);
//! 5. runs the steps in order, the child transitions of a step in parallel, stopping
//!    after the first step with an error.
//!
//! Children disabled in the gatekeeper take no part in engage, reset or transitions.

use super::command_vec::CommandVecSnapshot;
use super::functionoid::{next_uid, ActionKind, Functionoid, FunctionoidState};
use super::gatekeeper::GateKeeper;
use super::monitoring::MonitoringStatus;
use super::object::ActionableObject;
use super::state_machine::StateMachine;
use super::status::{ActionableStatusGuard, StatusGuardMap};
use super::system::ActionableSystem;
use super::system_busy_guard::{SystemBusyGuard, SystemBusyGuardCallback};
use super::transition::{Transition, TransitionPlan};
use crate::error::{ActionError, ActionResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Builds the message of a finished system transition from its snapshot.
pub type SnapshotAnalyser =
    Box<dyn Fn(&SystemTransitionSnapshot) -> anyhow::Result<String> + Send + Sync>;

/// Child id to the id of the child state machine taking part.
type Participants = Arc<RwLock<BTreeMap<String, String>>>;

fn upgrade(system: &Weak<ActionableSystem>, path: &str) -> ActionResult<Arc<ActionableSystem>> {
    system.upgrade().ok_or_else(|| {
        ActionError::Runtime(format!("System owning '{}' no longer exists", path))
    })
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time copy of a system transition's run.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemTransitionSnapshot {
    /// Full path of the transition
    pub path: String,
    /// Transition id
    pub id: String,
    /// Id of the system
    pub system_id: String,
    /// Lifecycle state
    pub state: FunctionoidState,
    /// Time spent running so far (or in total, once finished)
    pub running_time: Duration,
    /// Number of steps
    pub total_steps: usize,
    /// Per finished step, one entry per child transition (`None` for disabled children)
    pub completed_steps: Vec<Vec<Option<CommandVecSnapshot>>>,
    /// Same for the step currently running
    pub current_step: Option<Vec<Option<CommandVecSnapshot>>>,
    /// Paths of the children taking part in this run
    pub enabled_children: BTreeSet<String>,
    /// Message of the error or warning analyser
    pub message: String,
}

impl SystemTransitionSnapshot {
    /// Fraction of the transition done, in [0, 1]. A running step counts as far as its
    /// slowest child.
    pub fn progress(&self) -> f32 {
        if self.total_steps == 0 {
            return if self.state == FunctionoidState::Done { 1.0 } else { 0.0 };
        }
        if self.state.is_successful() {
            return 1.0;
        }
        let current = self.current_step.as_ref().map_or(0.0, |step| {
            step.iter()
                .flatten()
                .map(CommandVecSnapshot::progress)
                .fold(1.0_f32, f32::min)
        });
        (self.completed_steps.len() as f32 + current) / self.total_steps as f32
    }
}

// =============================================================================
// SystemTransition
// =============================================================================

#[derive(Debug)]
struct SystemRunState {
    state: FunctionoidState,
    current: Option<usize>,
    completed: Vec<Vec<Option<CommandVecSnapshot>>>,
    enabled_children: BTreeSet<String>,
    message: String,
    started: Option<Instant>,
    finished: Option<Instant>,
}

type Step = Vec<Arc<Transition>>;

/// Transition of a [`SystemStateMachine`].
pub struct SystemTransition {
    uid: u64,
    id: String,
    path: String,
    state_machine: String,
    start: String,
    end: String,
    error_state: String,
    system: Weak<ActionableSystem>,
    participants: Participants,
    steps: RwLock<Vec<Step>>,
    error_analyser: RwLock<Option<SnapshotAnalyser>>,
    warning_analyser: RwLock<Option<SnapshotAnalyser>>,
    run: Mutex<SystemRunState>,
}

impl fmt::Debug for SystemTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemTransition")
            .field("path", &self.path)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("steps", &self.size())
            .finish()
    }
}

impl SystemTransition {
    fn new(machine: &SystemStateMachine, id: &str, start: &str, end: &str) -> Self {
        Self {
            uid: next_uid(),
            id: id.to_string(),
            path: format!("{}.{}.{}", machine.path(), start, id),
            state_machine: machine.id.clone(),
            start: start.to_string(),
            end: end.to_string(),
            error_state: machine.error.clone(),
            system: Weak::clone(&machine.system),
            participants: Arc::clone(&machine.participants),
            steps: RwLock::new(Vec::new()),
            error_analyser: RwLock::new(None),
            warning_analyser: RwLock::new(None),
            run: Mutex::new(SystemRunState {
                state: FunctionoidState::Initial,
                current: None,
                completed: Vec::new(),
                enabled_children: BTreeSet::new(),
                message: String::new(),
                started: None,
                finished: None,
            }),
        }
    }

    /// Id of the owning system state machine.
    pub fn state_machine(&self) -> &str {
        &self.state_machine
    }

    /// State the system must be in.
    pub fn start_state(&self) -> &str {
        &self.start
    }

    /// State entered on success.
    pub fn end_state(&self) -> &str {
        &self.end
    }

    /// Number of steps.
    pub fn size(&self) -> usize {
        self.steps.read().len()
    }

    /// Copy of the steps.
    pub fn steps(&self) -> Vec<Vec<Arc<Transition>>> {
        self.steps.read().clone()
    }

    /// Append a step of child transitions, run in parallel.
    pub fn add(&self, step: Vec<Arc<Transition>>) -> ActionResult<&Self> {
        if step.is_empty() {
            return Err(ActionError::InvalidSystemTransition(format!(
                "Cannot add empty step to system transition '{}'",
                self.path
            )));
        }
        let system = upgrade(&self.system, &self.path)?;
        let mut steps = self.steps.write();
        let mut participants = self.participants.write();

        for (index, transition) in step.iter().enumerate() {
            let child_id = transition.actionable_id();
            let is_child = system
                .child(child_id)
                .is_ok_and(|child| Arc::ptr_eq(child.core(), transition.owner()));
            if !is_child {
                return Err(ActionError::InvalidSystemTransition(format!(
                    "Cannot add transition '{}' of non-child object '{}' to system transition '{}'",
                    transition.id(),
                    child_id,
                    self.path
                )));
            }

            if step[..index].iter().any(|t| t.actionable_id() == child_id) {
                return Err(ActionError::InvalidSystemTransition(format!(
                    "Multiple transitions requested for child '{}' in one step of system transition '{}'",
                    child_id, self.path
                )));
            }

            if let Some(fsm) = participants.get(child_id) {
                if fsm != transition.state_machine() {
                    return Err(ActionError::InvalidSystemTransition(format!(
                        "Transition '{}' of '{}' belongs to state machine '{}', but system state machine '{}' uses '{}'",
                        transition.id(),
                        child_id,
                        transition.state_machine(),
                        self.state_machine,
                        fsm
                    )));
                }
            }

            let previous = steps
                .iter()
                .flatten()
                .filter(|t| t.actionable_id() == child_id)
                .last();
            if let Some(previous) = previous {
                if previous.end_state() != transition.start_state() {
                    return Err(ActionError::InvalidSystemTransition(format!(
                        "Transition '{}' of '{}' starts from '{}', but previous transition '{}' ends in '{}'",
                        transition.id(),
                        child_id,
                        transition.start_state(),
                        previous.id(),
                        previous.end_state()
                    )));
                }
            }
        }

        for transition in &step {
            participants
                .entry(transition.actionable_id().to_string())
                .or_insert_with(|| transition.state_machine().to_string());
        }
        steps.push(step);
        Ok(self)
    }

    /// Build the run message when a step fails.
    pub fn set_error_analyser(&self, analyser: SnapshotAnalyser) {
        *self.error_analyser.write() = Some(analyser);
    }

    /// Build the run message when the transition ends with warnings.
    pub fn set_warning_analyser(&self, analyser: SnapshotAnalyser) {
        *self.warning_analyser.write() = Some(analyser);
    }

    // -------------------------------------------------------------------------
    // Checks
    // -------------------------------------------------------------------------

    fn enabled_children(guards: &StatusGuardMap<'_>, participants: &BTreeMap<String, String>) -> BTreeSet<String> {
        participants
            .keys()
            .filter(|id| guards.child(id).is_some_and(|g| g.is_enabled()))
            .cloned()
            .collect()
    }

    fn check_parameters(
        &self,
        steps: &[Step],
        enabled: &BTreeSet<String>,
        gk: &dyn GateKeeper,
    ) -> ActionResult<()> {
        let mut with_missing = 0;
        let mut with_invalid = 0;
        for transition in steps.iter().flatten() {
            if !enabled.contains(transition.actionable_id()) {
                continue;
            }
            let (sets, missing) = transition.check_for_missing_parameters(gk);
            if !missing.is_empty() {
                for param in &missing {
                    tracing::warn!(
                        "Missing parameter '{}' for transition '{}'",
                        param,
                        transition.path()
                    );
                }
                with_missing += 1;
            } else if !transition.check_for_invalid_parameters(&sets)?.is_empty() {
                with_invalid += 1;
            }
        }
        if with_missing > 0 {
            return Err(ActionError::ParameterNotFound(format!(
                "Could not find value of parameters for {} transitions of system transition '{}'",
                with_missing, self.path
            )));
        }
        if with_invalid > 0 {
            return Err(ActionError::CommandParameterCheckFailed(format!(
                "Parameter values fail rules and/or constraints in {} transitions of system transition '{}'",
                with_invalid, self.path
            )));
        }
        Ok(())
    }

    fn check_states(
        &self,
        system: &ActionableSystem,
        guards: &StatusGuardMap<'_>,
        steps: &[Step],
        enabled: &BTreeSet<String>,
    ) -> ActionResult<()> {
        let system_guard = guards.system();
        if system_guard.state_machine() != Some(self.state_machine.as_str()) {
            return Err(ActionError::ResourceInWrongStateMachine(format!(
                "System '{}' is not engaged in state machine '{}'",
                system.path(),
                self.state_machine
            )));
        }
        if system_guard.state() != Some(self.start.as_str()) {
            return Err(ActionError::ResourceInWrongState(format!(
                "System '{}' is in state '{}'; transition '{}' cannot be run",
                system.path(),
                system_guard.state().unwrap_or_default(),
                self.id
            )));
        }

        let mut checked = BTreeSet::new();
        for transition in steps.iter().flatten() {
            let child_id = transition.actionable_id();
            if !enabled.contains(child_id) || !checked.insert(child_id.to_string()) {
                continue;
            }
            if let Some(guard) = guards.child(child_id) {
                transition.check_state(guard)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run the transition on the system and its enabled children.
    ///
    /// Every check happens before anything is claimed; a failed check leaves all
    /// statuses untouched.
    pub fn exec(self: &Arc<Self>, gk: &dyn GateKeeper, use_pool: bool) -> ActionResult<()> {
        let system = upgrade(&self.system, &self.path)?;
        let steps = self.steps();
        let participants = self.participants.read().clone();
        let mut paths = BTreeMap::new();
        for id in participants.keys() {
            paths.insert(id.clone(), system.child(id)?.path());
        }

        let (busy_guard, enabled, plans) = {
            let guards = system.lock_mutexes();
            let enabled = Self::enabled_children(&guards, &participants);

            self.check_parameters(&steps, &enabled, gk)?;
            self.check_states(&system, &guards, &steps, &enabled)?;

            let mut plans: Vec<Vec<Option<TransitionPlan>>> = Vec::with_capacity(steps.len());
            for step in &steps {
                let mut step_plans = Vec::with_capacity(step.len());
                for transition in step {
                    if enabled.contains(transition.actionable_id()) {
                        step_plans.push(Some(transition.prepare(gk)?));
                    } else {
                        step_plans.push(None);
                    }
                }
                plans.push(step_plans);
            }

            let this = Arc::clone(self);
            let callback: SystemBusyGuardCallback = Box::new(
                move |guard: &mut ActionableStatusGuard<'_>, suffix: &mut String| {
                    let state = if this.state().is_successful() {
                        &this.end
                    } else {
                        &this.error_state
                    };
                    guard.set_state(state);
                    suffix.push_str(&format!(" Entering state '{}'", state));
                },
            );
            let (busy_guard, guards) = SystemBusyGuard::new(
                &system.path(),
                guards,
                self.handle(),
                &paths,
                Some(callback),
            )?;
            drop(guards);
            (busy_guard, enabled, plans)
        };

        {
            let mut run = self.run.lock();
            run.state = FunctionoidState::Initial;
            run.current = None;
            run.completed = Vec::with_capacity(steps.len());
            run.enabled_children = enabled.iter().filter_map(|id| paths.get(id).cloned()).collect();
            run.message.clear();
            run.started = None;
            run.finished = None;
        }

        if use_pool {
            self.run.lock().state = FunctionoidState::Scheduled;
            let this = Arc::clone(self);
            let submitted = system.thread_pool().submit(Box::new(move || {
                this.run_steps(&busy_guard, &steps, plans);
                drop(busy_guard);
            }));
            if let Err(e) = submitted {
                let mut run = self.run.lock();
                run.state = FunctionoidState::Error;
                run.message = e.to_string();
                run.finished = Some(Instant::now());
                return Err(e);
            }
        } else {
            self.run_steps(&busy_guard, &steps, plans);
            drop(busy_guard);
        }
        Ok(())
    }

    fn run_steps(&self, guard: &SystemBusyGuard, steps: &[Step], plans: Vec<Vec<Option<TransitionPlan>>>) {
        {
            let mut run = self.run.lock();
            let now = Instant::now();
            run.started = Some(now);
            if steps.is_empty() {
                run.state = FunctionoidState::Done;
                run.finished = Some(now);
                return;
            }
            run.state = FunctionoidState::Running;
            run.current = Some(0);
        }

        let handle = self.handle();
        let mut warning = false;
        for (index, (step, step_plans)) in steps.iter().zip(plans).enumerate() {
            let mut failed = false;
            let mut launched = Vec::with_capacity(step.len());
            for (transition, plan) in step.iter().zip(step_plans) {
                let Some(plan) = plan else {
                    launched.push(false);
                    continue;
                };
                let outcome = guard
                    .child_guard(transition.actionable_id())
                    .and_then(|child| transition.launch(plan, Some(child), true));
                match outcome {
                    Ok(()) => launched.push(true),
                    Err(e) => {
                        tracing::error!(
                            "Could not start transition '{}' in system transition '{}': {}",
                            transition.path(),
                            self.path,
                            e
                        );
                        failed = true;
                        launched.push(false);
                    }
                }
            }

            for (transition, started) in step.iter().zip(&launched) {
                if *started {
                    transition.owner().status().lock().wait_until_innermost(&handle);
                }
            }

            let snapshots: Vec<Option<CommandVecSnapshot>> = step
                .iter()
                .zip(&launched)
                .map(|(transition, started)| started.then(|| transition.get_status()))
                .collect();
            for snapshot in snapshots.iter().flatten() {
                match snapshot.state {
                    FunctionoidState::Error => failed = true,
                    FunctionoidState::Warning => warning = true,
                    _ => {}
                }
            }

            {
                let mut run = self.run.lock();
                run.completed.push(snapshots);
                if failed {
                    run.state = FunctionoidState::Error;
                    run.current = None;
                    run.finished = Some(Instant::now());
                } else {
                    run.current = (index + 1 < steps.len()).then_some(index + 1);
                }
            }
            if failed {
                self.analyse(&self.error_analyser, "error");
                return;
            }
        }

        {
            let mut run = self.run.lock();
            run.state = if warning {
                FunctionoidState::Warning
            } else {
                FunctionoidState::Done
            };
            run.finished = Some(Instant::now());
        }
        if warning {
            self.analyse(&self.warning_analyser, "warning");
        }
    }

    fn analyse(&self, analyser: &RwLock<Option<SnapshotAnalyser>>, kind: &str) {
        let analyser = analyser.read();
        let Some(analyser) = analyser.as_ref() else {
            return;
        };
        let snapshot = self.get_status();
        let message = match catch_unwind(AssertUnwindSafe(|| analyser(&snapshot))) {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => format!("Error in {} analyser function: {:#}", kind, e),
            Err(_) => format!("The {} analyser function panicked", kind),
        };
        self.run.lock().message = message;
    }

    /// Snapshot of the current or last run.
    pub fn get_status(&self) -> SystemTransitionSnapshot {
        let system_id = self
            .system
            .upgrade()
            .map(|system| system.id().to_string())
            .unwrap_or_default();
        let (state, running_time, current, completed, enabled_children, message) = {
            let run = self.run.lock();
            let running_time = match (run.state, run.started, run.finished) {
                (FunctionoidState::Initial | FunctionoidState::Scheduled, _, _) => Duration::ZERO,
                (_, Some(start), Some(end)) => end.duration_since(start),
                (_, Some(start), None) => start.elapsed(),
                _ => Duration::ZERO,
            };
            (
                run.state,
                running_time,
                run.current,
                run.completed.clone(),
                run.enabled_children.clone(),
                run.message.clone(),
            )
        };

        let steps = self.steps.read().clone();
        let current_step = current
            .filter(|_| state == FunctionoidState::Running)
            .and_then(|index| steps.get(index))
            .map(|step| {
                step.iter()
                    .map(|t| {
                        let path = t.owner().path();
                        enabled_children.contains(&path).then(|| t.get_status())
                    })
                    .collect()
            });

        SystemTransitionSnapshot {
            path: self.path.clone(),
            id: self.id.clone(),
            system_id,
            state,
            running_time,
            total_steps: steps.len(),
            completed_steps: completed,
            current_step,
            enabled_children,
            message,
        }
    }
}

impl Functionoid for SystemTransition {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn alias(&self) -> Option<&str> {
        None
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn state(&self) -> FunctionoidState {
        self.run.lock().state
    }

    fn kind(&self) -> ActionKind {
        ActionKind::SystemTransition
    }
}

// =============================================================================
// SystemStateMachine
// =============================================================================

/// State machine registered on an [`ActionableSystem`].
pub struct SystemStateMachine {
    id: String,
    system_path: String,
    system: Weak<ActionableSystem>,
    initial: String,
    error: String,
    states: RwLock<Vec<String>>,
    transitions: RwLock<BTreeMap<String, BTreeMap<String, Arc<SystemTransition>>>>,
    participants: Participants,
}

impl fmt::Debug for SystemStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemStateMachine")
            .field("path", &self.path())
            .field("states", &*self.states.read())
            .field("participants", &*self.participants.read())
            .finish()
    }
}

/// Child resources paired with the machine they take part with.
type ChildMachines = Vec<(String, Arc<ActionableObject>, Arc<StateMachine>)>;

impl SystemStateMachine {
    pub(crate) fn new(
        system: Weak<ActionableSystem>,
        system_path: &str,
        id: &str,
        initial: &str,
        error: &str,
    ) -> ActionResult<Self> {
        let machine = Self {
            id: id.to_string(),
            system_path: system_path.to_string(),
            system,
            initial: initial.to_string(),
            error: error.to_string(),
            states: RwLock::new(Vec::new()),
            transitions: RwLock::new(BTreeMap::new()),
            participants: Arc::new(RwLock::new(BTreeMap::new())),
        };
        machine.add_state(initial)?;
        machine.add_state(error)?;
        Ok(machine)
    }

    /// Machine id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path: system path, then machine id.
    pub fn path(&self) -> String {
        format!("{}.{}", self.system_path, self.id)
    }

    /// State entered on engage and reset.
    pub fn initial_state(&self) -> &str {
        &self.initial
    }

    /// State entered when a transition fails.
    pub fn error_state(&self) -> &str {
        &self.error
    }

    /// Child id to child state machine id, for every child used by a transition.
    pub fn participants(&self) -> BTreeMap<String, String> {
        self.participants.read().clone()
    }

    // -------------------------------------------------------------------------
    // Definition
    // -------------------------------------------------------------------------

    /// Add a state.
    pub fn add_state(&self, state: &str) -> ActionResult<()> {
        let mut states = self.states.write();
        if states.iter().any(|s| s == state) {
            return Err(ActionError::StateAlreadyDefined(format!(
                "State '{}' already defined in system state machine '{}'",
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
                "State '{}' not defined in system state machine '{}'",
                state,
                self.path()
            )))
        }
    }

    /// Add an empty transition from `from` to `to`.
    pub fn add_transition(
        &self,
        id: &str,
        from: &str,
        to: &str,
    ) -> ActionResult<Arc<SystemTransition>> {
        self.check_state_defined(from)?;
        self.check_state_defined(to)?;

        let mut transitions = self.transitions.write();
        let from_state = transitions.entry(from.to_string()).or_default();
        if from_state.contains_key(id) {
            return Err(ActionError::TransitionAlreadyDefined(format!(
                "Transition '{}' from state '{}' already defined in system state machine '{}'",
                id,
                from,
                self.path()
            )));
        }
        let transition = Arc::new(SystemTransition::new(self, id, from, to));
        from_state.insert(id.to_string(), Arc::clone(&transition));
        Ok(transition)
    }

    /// Transition `id` leaving state `from`.
    pub fn transition(&self, from: &str, id: &str) -> ActionResult<Arc<SystemTransition>> {
        self.check_state_defined(from)?;
        self.transitions
            .read()
            .get(from)
            .and_then(|t| t.get(id))
            .cloned()
            .ok_or_else(|| {
                ActionError::InvalidArgument(format!(
                    "No transition '{}' from state '{}' in system state machine '{}'",
                    id,
                    from,
                    self.path()
                ))
            })
    }

    /// Transitions leaving state `from`, by id.
    pub fn transitions(&self, from: &str) -> ActionResult<BTreeMap<String, Arc<SystemTransition>>> {
        self.check_state_defined(from)?;
        Ok(self.transitions.read().get(from).cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Engagement
    // -------------------------------------------------------------------------

    fn child_machines(&self, system: &ActionableSystem) -> ActionResult<ChildMachines> {
        self.participants
            .read()
            .iter()
            .map(|(child_id, fsm_id)| -> ActionResult<_> {
                let child = system.child(child_id)?;
                let fsm = child.state_machine(fsm_id)?;
                Ok((child_id.clone(), Arc::clone(child), fsm))
            })
            .collect()
    }

    fn disable_children(system: &ActionableSystem, guards: &mut StatusGuardMap<'_>, gk: &dyn GateKeeper) {
        for (id, child) in system.actionable_children() {
            if gk.is_enabled(&child.path()) {
                continue;
            }
            if let Some(guard) = guards.child_mut(id) {
                if guard.is_enabled() {
                    tracing::info!("Disabling '{}'", child.path());
                }
                guard.disable();
            }
        }
    }

    fn check_engaged_and_idle(&self, guards: &StatusGuardMap<'_>, action: &str) -> ActionResult<()> {
        let guard = guards.system();
        if guard.state_machine() != Some(self.id.as_str()) {
            let current = match guard.state_machine() {
                Some(other) => format!("currently in state machine '{}'", other),
                None => "NOT in any state machine".to_string(),
            };
            return Err(ActionError::ResourceInWrongStateMachine(format!(
                "Cannot {} state machine '{}' of system '{}'; {}",
                action, self.id, self.system_path, current
            )));
        }
        if let Some(running) = guard.innermost_action() {
            return Err(ActionError::ActionableSystemIsBusy(format!(
                "Cannot {} state machine '{}'; system '{}' is busy running {}",
                action, self.id, self.system_path, running
            )));
        }
        Ok(())
    }

    /// Engage the system and its enabled participants.
    ///
    /// Children the gatekeeper disables are disabled and set NonCritical; the others
    /// enter their machine's initial state and are set Enabled.
    pub fn engage(&self, gk: &dyn GateKeeper) -> ActionResult<()> {
        let system = upgrade(&self.system, &self.path())?;
        let children = self.child_machines(&system)?;
        let mut guards = system.lock_mutexes();

        if let Some(current) = guards.system().state_machine() {
            return Err(ActionError::ResourceInWrongStateMachine(format!(
                "Cannot engage state machine '{}'; system '{}' currently in state machine '{}'",
                self.id, self.system_path, current
            )));
        }
        if let Some(running) = guards.system().innermost_action() {
            return Err(ActionError::ActionableSystemIsBusy(format!(
                "Cannot engage state machine '{}'; system '{}' is busy running {}",
                self.id, self.system_path, running
            )));
        }
        for (id, child, _) in &children {
            let Some(guard) = guards.child(id) else {
                continue;
            };
            if !guard.is_enabled() || !gk.is_enabled(&child.path()) {
                continue;
            }
            if let Some(current) = guard.state_machine() {
                return Err(ActionError::ResourceInWrongStateMachine(format!(
                    "Cannot engage state machine '{}'; resource '{}' currently in state machine '{}'",
                    self.id,
                    child.path(),
                    current
                )));
            }
            if let Some(running) = guard.innermost_action() {
                return Err(ActionError::ActionableObjectIsBusy(format!(
                    "Cannot engage state machine '{}'; resource '{}' is busy running {}",
                    self.id,
                    child.path(),
                    running
                )));
            }
        }

        tracing::info!(
            "Engaging system '{}' in state machine '{}'; entering state '{}'",
            self.system_path,
            self.id,
            self.initial
        );
        guards.system_mut().set_state_machine(&self.id, &self.initial);
        Self::disable_children(&system, &mut guards, gk);
        Self::enter_children_initial(&mut guards, &children, gk);
        Ok(())
    }

    fn enter_children_initial(guards: &mut StatusGuardMap<'_>, children: &ChildMachines, gk: &dyn GateKeeper) {
        for (id, child, fsm) in children {
            let Some(guard) = guards.child_mut(id) else {
                continue;
            };
            if guard.is_enabled() {
                let engage = guard.state_machine() != Some(fsm.id());
                fsm.enter_initial(guard, gk, engage);
                child.set_monitoring_status(MonitoringStatus::Enabled);
            } else {
                child.set_monitoring_status(MonitoringStatus::NonCritical);
            }
        }
    }

    /// Release the system and its enabled participants from their machines.
    pub fn disengage(&self) -> ActionResult<()> {
        let system = upgrade(&self.system, &self.path())?;
        let children = self.child_machines(&system)?;
        let mut guards = system.lock_mutexes();

        self.check_engaged_and_idle(&guards, "disengage")?;
        for (id, _, fsm) in &children {
            if let Some(guard) = guards.child(id).filter(|g| g.is_enabled()) {
                fsm.check_engaged_and_idle(guard, "disengage")?;
            }
        }

        tracing::info!(
            "Disengaging system '{}' from state machine '{}'",
            self.system_path,
            self.id
        );
        guards.system_mut().set_no_state_machine();
        for (id, child, fsm) in &children {
            if let Some(guard) = guards.child_mut(id) {
                if guard.state_machine() == Some(fsm.id()) {
                    tracing::info!(
                        "Disengaging '{}' from state machine '{}'",
                        child.path(),
                        fsm.id()
                    );
                    guard.set_no_state_machine();
                }
            }
        }
        Ok(())
    }

    /// Put the system and its enabled participants back in their initial states.
    pub fn reset(&self, gk: &dyn GateKeeper) -> ActionResult<()> {
        let system = upgrade(&self.system, &self.path())?;
        let children = self.child_machines(&system)?;
        let mut guards = system.lock_mutexes();

        self.check_engaged_and_idle(&guards, "reset")?;
        for (id, child, fsm) in &children {
            let Some(guard) = guards.child(id) else {
                continue;
            };
            if guard.is_enabled() && gk.is_enabled(&child.path()) {
                fsm.check_engaged_and_idle(guard, "reset")?;
            }
        }

        tracing::info!(
            "Resetting system state machine '{}' of '{}'; entering state '{}'",
            self.id,
            self.system_path,
            self.initial
        );
        guards.system_mut().set_state(&self.initial);
        Self::disable_children(&system, &mut guards, gk);
        Self::enter_children_initial(&mut guards, &children, gk);
        Ok(())
    }
}
