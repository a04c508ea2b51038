//! Ordered list of commands run one after another under a single claim.
//!
//! [`CommandVec`] is the execution engine shared by
//! [`CommandSequence`](super::CommandSequence) and object-level
//! [`Transition`](super::Transition). Each step pairs a command with a namespace which
//! scopes its gatekeeper parameter lookup.
//!
//! A run goes through:
//!
//! 1. parameter extraction from the gatekeeper (missing values are an error);
//! 2. rule and constraint checks of every step;
//! 3. one claim of the owning resource for the whole list;
//! 4. the commands, run inline within that claim, stopping at the first error.
//!
//! Progress of a running list is `(started - 1 + progress of current) / total`.

use super::busy_guard::{BusyGuard, BusyGuardCallback};
use super::command::{Command, CommandSnapshot, ParameterViolation};
use super::functionoid::{next_uid, ActionKind, Functionoid, FunctionoidState};
use super::gatekeeper::GateKeeper;
use super::object::ObjectCore;
use super::status::ActionableStatusGuard;
use crate::error::{ActionError, ActionResult};
use crate::parameter::{ParameterSet, ParameterValue};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Check run under the status lock before a list claims its resource.
pub(crate) type ClaimCheck<'a> = &'a (dyn Fn(&ActionableStatusGuard<'_>) -> ActionResult<()> + 'a);

/// One step: a command and the namespace used to look up its parameters.
#[derive(Debug, Clone)]
pub struct Element {
    command: Arc<Command>,
    namespace: String,
}

impl Element {
    /// The command.
    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    /// Gatekeeper namespace of this step.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Parameter with no gatekeeper value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingParam {
    /// Namespace of the step
    pub namespace: String,
    /// Command id
    pub command: String,
    /// Parameter name
    pub parameter: String,
}

impl fmt::Display for MissingParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.command, self.parameter)
    }
}

/// Rule and constraint violations of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRuleViolationList {
    /// Command id
    pub command: String,
    /// Position of the step
    pub command_index: usize,
    /// Parameters that were checked
    pub parameters: ParameterSet,
    /// What failed
    pub violations: Vec<ParameterViolation>,
}

impl fmt::Display for ParamRuleViolationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let violations: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        write!(
            f,
            "command '{}' (step {}): {}",
            self.command,
            self.command_index,
            violations.join("; ")
        )
    }
}

/// Point-in-time copy of a command list's run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandVecSnapshot {
    /// Full path of the sequence or transition
    pub path: String,
    /// Id of the sequence or transition
    pub id: String,
    /// Alias of the sequence or transition
    pub alias: Option<String>,
    /// Id of the owning resource
    pub actionable_id: String,
    /// Lifecycle state
    pub state: FunctionoidState,
    /// Time spent running so far (or in total, once finished)
    pub running_time: Duration,
    /// Number of steps in this run
    pub total_commands: usize,
    /// Number of steps that finished
    pub completed_commands: usize,
    /// Snapshots of finished steps, then of the running one
    pub command_statuses: Vec<CommandSnapshot>,
    /// Results of the finished steps
    pub results: Vec<Option<ParameterValue>>,
}

impl CommandVecSnapshot {
    /// Fraction of the list done, in [0, 1].
    pub fn progress(&self) -> f32 {
        if self.total_commands == 0 && self.state == FunctionoidState::Done {
            1.0
        } else if self.command_statuses.is_empty() {
            0.0
        } else if self.state.is_successful() {
            1.0
        } else {
            let started = self.command_statuses.len() as f32;
            let current = self
                .command_statuses
                .last()
                .map_or(0.0, |status| status.progress);
            (started - 1.0 + current) / self.total_commands as f32
        }
    }
}

#[derive(Debug)]
struct VecRunState {
    state: FunctionoidState,
    elements: Vec<Element>,
    parameters: Vec<ParameterSet>,
    /// Running step and the number of runs its command had started before it
    current: Option<(usize, u64)>,
    completed: Vec<CommandSnapshot>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// Command list bound to one resource.
pub struct CommandVec {
    uid: u64,
    id: String,
    kind: ActionKind,
    path_suffix: String,
    owner: Arc<ObjectCore>,
    elements: RwLock<Vec<Element>>,
    run: Mutex<VecRunState>,
}

impl fmt::Debug for CommandVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandVec")
            .field("path", &self.path())
            .field("kind", &self.kind)
            .field("size", &self.size())
            .finish()
    }
}

impl CommandVec {
    pub(crate) fn new(
        owner: Arc<ObjectCore>,
        id: impl Into<String>,
        kind: ActionKind,
        path_suffix: impl Into<String>,
    ) -> Self {
        Self {
            uid: next_uid(),
            id: id.into(),
            kind,
            path_suffix: path_suffix.into(),
            owner,
            elements: RwLock::new(Vec::new()),
            run: Mutex::new(VecRunState {
                state: FunctionoidState::Initial,
                elements: Vec::new(),
                parameters: Vec::new(),
                current: None,
                completed: Vec::new(),
                started: None,
                finished: None,
            }),
        }
    }

    pub(crate) fn owner(&self) -> &Arc<ObjectCore> {
        &self.owner
    }

    /// Append a step. The command must belong to the same resource.
    pub fn add(&self, command: &Arc<Command>, namespace: &str) -> ActionResult<()> {
        let same_owner = command
            .owner()
            .is_some_and(|owner| Arc::ptr_eq(owner, &self.owner));
        if !same_owner {
            let resource = command
                .owner()
                .map_or_else(|| "none".to_string(), |owner| owner.path());
            return Err(ActionError::InvalidResource(format!(
                "Cannot add command '{}' (resource: {}) to {} of resource '{}'",
                command.id(),
                resource,
                self.kind,
                self.owner.path()
            )));
        }
        self.elements.write().push(Element {
            command: Arc::clone(command),
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    /// Number of steps.
    pub fn size(&self) -> usize {
        self.elements.read().len()
    }

    /// Copy of the steps.
    pub fn elements(&self) -> Vec<Element> {
        self.elements.read().clone()
    }

    // -------------------------------------------------------------------------
    // Parameters
    // -------------------------------------------------------------------------

    fn survey(
        &self,
        elements: &[Element],
        gk: &dyn GateKeeper,
    ) -> (Vec<ParameterSet>, Vec<MissingParam>) {
        let contexts = self.owner.gatekeeper_contexts();
        let mut sets = Vec::with_capacity(elements.len());
        let mut missing = Vec::new();

        for element in elements {
            let command = &element.command;
            let mut params = ParameterSet::new();
            for name in command.default_parameters().keys() {
                match gk.get(&element.namespace, command.id(), name, &contexts) {
                    Some(value) => {
                        params.insert(name.clone(), value);
                    }
                    None => missing.push(MissingParam {
                        namespace: element.namespace.clone(),
                        command: command.id().to_string(),
                        parameter: name.clone(),
                    }),
                }
            }
            sets.push(params);
        }
        (sets, missing)
    }

    fn extract(&self, elements: &[Element], gk: &dyn GateKeeper) -> ActionResult<Vec<ParameterSet>> {
        let (sets, missing) = self.survey(elements, gk);
        match missing.first() {
            Some(first) => Err(ActionError::ParameterNotFound(format!(
                "Could not find value of parameter '{}' for command '{}' in namespace '{}' of resource '{}'",
                first.parameter,
                first.command,
                first.namespace,
                self.owner.id()
            ))),
            None => Ok(sets),
        }
    }

    /// Look up every step's parameters, collecting the ones the gatekeeper lacks.
    pub fn check_for_missing_parameters(
        &self,
        gk: &dyn GateKeeper,
    ) -> (Vec<ParameterSet>, Vec<MissingParam>) {
        self.survey(&self.elements(), gk)
    }

    /// Look up every step's parameters, failing on the first missing one.
    pub fn extract_parameters(&self, gk: &dyn GateKeeper) -> ActionResult<Vec<ParameterSet>> {
        self.extract(&self.elements(), gk)
    }

    fn invalid_parameters(
        elements: &[Element],
        sets: &[ParameterSet],
    ) -> ActionResult<Vec<ParamRuleViolationList>> {
        if sets.len() < elements.len() {
            return Err(ActionError::ParameterNotFound(format!(
                "Parameters for only {} of {} commands supplied",
                sets.len(),
                elements.len()
            )));
        }
        let mut lists = Vec::new();
        for (index, (element, set)) in elements.iter().zip(sets).enumerate() {
            let merged = element.command.merge_parameters_with_defaults(set);
            let violations = element.command.check_rules_and_constraints(&merged)?;
            if !violations.is_empty() {
                lists.push(ParamRuleViolationList {
                    command: element.command.id().to_string(),
                    command_index: index,
                    parameters: merged,
                    violations,
                });
            }
        }
        Ok(lists)
    }

    /// Check the given per-step parameter sets against each command's rules.
    pub fn check_for_invalid_parameters(
        &self,
        sets: &[ParameterSet],
    ) -> ActionResult<Vec<ParamRuleViolationList>> {
        Self::invalid_parameters(&self.elements(), sets)
    }

    /// Extract and check parameters for a run of the current steps.
    pub(crate) fn prepare(&self, gk: &dyn GateKeeper) -> ActionResult<PreparedRun> {
        let elements = self.elements();
        let parameters = self.extract(&elements, gk)?;
        let violations = Self::invalid_parameters(&elements, &parameters)?;
        if let Some(first) = violations.first() {
            return Err(ActionError::CommandParameterCheckFailed(format!(
                "Invalid parameters for {} '{}': {}",
                self.kind,
                self.path(),
                first
            )));
        }
        Ok(PreparedRun {
            elements,
            parameters,
        })
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Claim the resource and run a prepared list.
    pub(crate) fn launch(
        self: &Arc<Self>,
        prepared: PreparedRun,
        outer: Option<&BusyGuard>,
        use_pool: bool,
        check: Option<ClaimCheck<'_>>,
        callback: Option<BusyGuardCallback>,
    ) -> ActionResult<()> {
        let mut builder = BusyGuard::builder(
            self.owner.path(),
            Arc::clone(self.owner.status()),
            self.handle(),
        )
        .with_outer(outer);
        if let Some(check) = check {
            builder = builder.with_precondition(move |guard| check(guard));
        }
        if let Some(callback) = callback {
            builder = builder.with_callback(callback);
        }
        let guard = builder.claim()?;

        self.reset(prepared);

        if use_pool {
            self.run.lock().state = FunctionoidState::Scheduled;
            let list = Arc::clone(self);
            let submitted = self.owner.thread_pool().submit(Box::new(move || {
                list.run_commands(&guard);
                drop(guard);
            }));
            if let Err(e) = submitted {
                let mut run = self.run.lock();
                run.state = FunctionoidState::Error;
                run.finished = Some(Instant::now());
                return Err(e);
            }
        } else {
            self.run_commands(&guard);
            drop(guard);
        }
        Ok(())
    }

    fn reset(&self, prepared: PreparedRun) {
        let mut run = self.run.lock();
        run.state = FunctionoidState::Initial;
        run.current = None;
        run.completed = Vec::with_capacity(prepared.elements.len());
        run.elements = prepared.elements;
        run.parameters = prepared.parameters;
        run.started = None;
        run.finished = None;
    }

    fn run_commands(&self, guard: &BusyGuard) {
        let (elements, parameters) = {
            let mut run = self.run.lock();
            let now = Instant::now();
            run.started = Some(now);
            if run.elements.is_empty() {
                run.state = FunctionoidState::Done;
                run.finished = Some(now);
                return;
            }
            run.state = FunctionoidState::Running;
            run.current = run.elements.first().map(|e| (0, e.command.run_count()));
            (run.elements.clone(), run.parameters.clone())
        };

        let mut warning = false;
        for (index, (element, params)) in elements.iter().zip(parameters.iter()).enumerate() {
            let outcome = element.command.exec(Some(guard), params, false);
            let snapshot = element.command.get_status();

            let mut run = self.run.lock();
            if let Err(e) = outcome {
                tracing::error!(
                    "Could not run command '{}' in {} '{}': {}",
                    element.command.id(),
                    self.kind,
                    self.path(),
                    e
                );
                run.state = FunctionoidState::Error;
                run.finished = Some(Instant::now());
                return;
            }

            let state = snapshot.state;
            run.completed.push(snapshot);
            if state == FunctionoidState::Error {
                run.state = FunctionoidState::Error;
                run.finished = Some(Instant::now());
                return;
            }
            warning |= state == FunctionoidState::Warning;
            run.current = elements
                .get(index + 1)
                .map(|next| (index + 1, next.command.run_count()));
        }

        let mut run = self.run.lock();
        run.state = if warning {
            FunctionoidState::Warning
        } else {
            FunctionoidState::Done
        };
        run.finished = Some(Instant::now());
    }

    /// Snapshot of the current or last run.
    pub fn get_status(&self) -> CommandVecSnapshot {
        let (state, running_time, total, completed, current) = {
            let run = self.run.lock();
            let running_time = match (run.state, run.started, run.finished) {
                (FunctionoidState::Initial | FunctionoidState::Scheduled, _, _) => Duration::ZERO,
                (_, Some(start), Some(end)) => end.duration_since(start),
                (_, Some(start), None) => start.elapsed(),
                _ => Duration::ZERO,
            };
            let current = match (run.state, run.current) {
                (FunctionoidState::Error, _) | (_, None) => None,
                (_, Some((index, runs))) => run
                    .elements
                    .get(index)
                    .map(|e| (Arc::clone(&e.command), runs)),
            };
            (
                run.state,
                running_time,
                run.elements.len(),
                run.completed.clone(),
                current,
            )
        };

        let results = completed.iter().map(|s| s.result.clone()).collect();
        let completed_commands = completed.len();
        let mut command_statuses = completed;
        // The running step only counts once its command has started this run.
        if let Some(status) = current.and_then(|(command, runs)| command.get_status_after(runs)) {
            command_statuses.push(status);
        }

        CommandVecSnapshot {
            path: self.path(),
            id: self.id.clone(),
            alias: None,
            actionable_id: self.owner.id().to_string(),
            state,
            running_time,
            total_commands: total,
            completed_commands,
            command_statuses,
            results,
        }
    }
}

impl Functionoid for CommandVec {
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
        format!("{}.{}", self.owner.path(), self.path_suffix)
    }

    fn state(&self) -> FunctionoidState {
        self.run.lock().state
    }

    fn kind(&self) -> ActionKind {
        self.kind
    }
}

/// Steps and checked parameters of a run about to start.
#[derive(Debug, Clone)]
pub(crate) struct PreparedRun {
    elements: Vec<Element>,
    parameters: Vec<ParameterSet>,
}
