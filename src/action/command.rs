//! Single unit of work on one resource.
//!
//! A [`Command`] wraps user code with a typed parameter schema, validation and
//! progress/result reporting. Commands are built and given their schema first, then
//! registered on an [`ActionableObject`](super::ActionableObject), which moves them into
//! an `Arc`: from then on the schema (`&mut self` methods) can no longer change.
//!
//! Execution protocol of [`Command::exec`]:
//!
//! 1. merge the supplied parameters over the registered defaults;
//! 2. check every rule and constraint, failing with
//!    [`ActionError::CommandParameterCheckFailed`] before the resource is touched;
//! 3. claim the resource through a [`BusyGuard`];
//! 4. reset the run state (`Scheduled`);
//! 5. run the code inline, or hand code and guard to the resource's thread pool.
//!
//! ```rust,ignore
//! let mut reset = Command::new("reset", |ctx, params| {
//!     ctx.set_progress_with_message(0.5, "Resetting clocks")?;
//!     board.reset(params["clockSource"].as_str().unwrap_or("internal"))?;
//!     Ok(FunctionoidState::Done)
//! });
//! reset.register_parameter("clockSource", "internal")?;
//! let reset = board_object.register_command(reset)?;
//! reset.exec(None, &ParameterSet::new(), true)?;
//! ```

use super::busy_guard::BusyGuard;
use super::functionoid::{next_uid, ActionKind, Functionoid, FunctionoidState};
use super::object::ObjectCore;
use crate::error::{ActionError, ActionResult};
use crate::parameter::{ParameterSet, ParameterType, ParameterValue};
use crate::rules::{default_rule, Constraint, Rule};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// User code run by a command.
pub trait CommandCode: Send + Sync {
    /// Do the work and return `Done`, `Warning` or `Error`. Returning an error or
    /// panicking also puts the command in `Error`.
    fn code(&self, ctx: &CommandContext<'_>, params: &ParameterSet)
        -> anyhow::Result<FunctionoidState>;
}

impl<F> CommandCode for F
where
    F: Fn(&CommandContext<'_>, &ParameterSet) -> anyhow::Result<FunctionoidState> + Send + Sync,
{
    fn code(
        &self,
        ctx: &CommandContext<'_>,
        params: &ParameterSet,
    ) -> anyhow::Result<FunctionoidState> {
        self(ctx, params)
    }
}

/// A rule or constraint that rejected a parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterViolation {
    /// Parameters involved
    pub parameters: Vec<String>,
    /// Description of the rule or constraint
    pub rule: String,
    /// Explanation given by the check, may be empty
    pub details: String,
}

impl fmt::Display for ParameterViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] failed '{}'", self.parameters.join(", "), self.rule)?;
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}

/// Point-in-time copy of a command's run state.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSnapshot {
    /// Full path of the command
    pub path: String,
    /// Command id
    pub id: String,
    /// Command alias
    pub alias: Option<String>,
    /// Id of the owning resource
    pub actionable_id: String,
    /// Alias of the owning resource
    pub actionable_alias: Option<String>,
    /// Lifecycle state
    pub state: FunctionoidState,
    /// Time spent running so far (or in total, once finished)
    pub running_time: Duration,
    /// Fraction of work done, in [0, 1]
    pub progress: f32,
    /// Last status message
    pub status_msg: String,
    /// Parameters of the current or last run, defaults included
    pub parameters: ParameterSet,
    /// Key/value details recorded by the code
    pub execution_details: ParameterSet,
    /// Result; only present once the command has finished
    pub result: Option<ParameterValue>,
    /// Wall-clock start of the current or last run
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct RunState {
    runs: u64,
    state: FunctionoidState,
    progress: f32,
    status_msg: String,
    parameters: ParameterSet,
    execution_details: ParameterSet,
    result: Option<ParameterValue>,
    started: Option<Instant>,
    finished: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
}

/// Handle given to command code for reporting progress and results.
pub struct CommandContext<'a> {
    command: &'a Command,
}

impl CommandContext<'_> {
    /// Id of the running command.
    pub fn command_id(&self) -> &str {
        &self.command.id
    }

    /// Report progress in [0, 1].
    pub fn set_progress(&self, progress: f32) -> ActionResult<()> {
        check_progress(progress)?;
        self.command.run.lock().progress = progress;
        tracing::debug!("Command '{}' progress: {:.2}", self.command.path(), progress);
        Ok(())
    }

    /// Report progress in [0, 1] together with a status message.
    pub fn set_progress_with_message(
        &self,
        progress: f32,
        msg: impl Into<String>,
    ) -> ActionResult<()> {
        check_progress(progress)?;
        let msg = msg.into();
        tracing::debug!(
            "Command '{}' progress: {:.2} ({})",
            self.command.path(),
            progress,
            msg
        );
        let mut run = self.command.run.lock();
        run.progress = progress;
        run.status_msg = msg;
        Ok(())
    }

    /// Replace the status message.
    pub fn set_status_msg(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::debug!("Command '{}': {}", self.command.path(), msg);
        self.command.run.lock().status_msg = msg;
    }

    /// Set the result of this run.
    pub fn set_result(&self, result: impl Into<ParameterValue>) {
        self.command.run.lock().result = Some(result.into());
    }

    /// Record a key/value detail about this run.
    pub fn add_execution_details(&self, key: impl Into<String>, value: impl Into<ParameterValue>) {
        self.command
            .run
            .lock()
            .execution_details
            .insert(key.into(), value.into());
    }
}

fn check_progress(progress: f32) -> ActionResult<()> {
    if (0.0..=1.0).contains(&progress) {
        Ok(())
    } else {
        Err(ActionError::OutOfRange(format!(
            "Progress must be in the [0,1] range, got {}",
            progress
        )))
    }
}

fn coerce(value: ParameterValue, ty: ParameterType) -> ParameterValue {
    match (value, ty) {
        (ParameterValue::Int(i), ParameterType::Float) => ParameterValue::Float(i as f64),
        (ParameterValue::IntList(v), ParameterType::FloatList) => {
            ParameterValue::FloatList(v.into_iter().map(|i| i as f64).collect())
        }
        (value, _) => value,
    }
}

// =============================================================================
// Command
// =============================================================================

/// Unit of work with a typed parameter schema.
pub struct Command {
    uid: u64,
    id: String,
    alias: Option<String>,
    code: Box<dyn CommandCode>,
    defaults: ParameterSet,
    rules: BTreeMap<String, Arc<dyn Rule>>,
    constraints: BTreeMap<String, Box<dyn Constraint>>,
    default_result: Option<ParameterValue>,
    owner: Option<Arc<ObjectCore>>,
    run: Mutex<RunState>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("parameters", &self.defaults)
            .field("constraints", &self.constraints.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Command {
    /// Command running `code`, with no parameters yet.
    pub fn new<F>(id: impl Into<String>, code: F) -> Self
    where
        F: Fn(&CommandContext<'_>, &ParameterSet) -> anyhow::Result<FunctionoidState>
            + Send
            + Sync
            + 'static,
    {
        Self::with_code(id, Box::new(code))
    }

    /// Command running a [`CommandCode`] implementation.
    pub fn with_code(id: impl Into<String>, code: Box<dyn CommandCode>) -> Self {
        Self {
            uid: next_uid(),
            id: id.into(),
            alias: None,
            code,
            defaults: ParameterSet::new(),
            rules: BTreeMap::new(),
            constraints: BTreeMap::new(),
            default_result: None,
            owner: None,
            run: Mutex::new(RunState {
                runs: 0,
                state: FunctionoidState::Initial,
                progress: 0.0,
                status_msg: String::new(),
                parameters: ParameterSet::new(),
                execution_details: ParameterSet::new(),
                result: None,
                started: None,
                finished: None,
                started_at: None,
            }),
        }
    }

    /// Set the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Result reported when the code does not set one.
    pub fn with_default_result(mut self, result: impl Into<ParameterValue>) -> Self {
        self.default_result = Some(result.into());
        self
    }

    // -------------------------------------------------------------------------
    // Schema
    // -------------------------------------------------------------------------

    /// Register a parameter checked by the default rule of its type.
    pub fn register_parameter(
        &mut self,
        name: impl Into<String>,
        default: impl Into<ParameterValue>,
    ) -> ActionResult<()> {
        let default = default.into();
        let rule = default_rule(default.parameter_type());
        self.insert_parameter(name.into(), default, rule)
    }

    /// Register a parameter with an explicit rule.
    pub fn register_parameter_with_rule<R>(
        &mut self,
        name: impl Into<String>,
        default: impl Into<ParameterValue>,
        rule: R,
    ) -> ActionResult<()>
    where
        R: Rule + 'static,
    {
        self.insert_parameter(name.into(), default.into(), Arc::new(rule))
    }

    fn insert_parameter(
        &mut self,
        name: String,
        default: ParameterValue,
        rule: Arc<dyn Rule>,
    ) -> ActionResult<()> {
        if self.defaults.contains_key(&name) {
            return Err(ActionError::CommandParameterRegistrationFailed(format!(
                "Parameter '{}' is already registered in command '{}'",
                name, self.id
            )));
        }
        let ty = default.parameter_type();
        if !rule.accepts(ty) {
            return Err(ActionError::CommandParameterRegistrationFailed(format!(
                "Rule '{}' cannot check parameter '{}' of type '{}' in command '{}'",
                rule, name, ty, self.id
            )));
        }
        self.defaults.insert(name.clone(), default);
        self.rules.insert(name, rule);
        Ok(())
    }

    /// Remove a parameter. Fails if it is unknown or used by a constraint.
    pub fn unregister_parameter(&mut self, name: &str) -> ActionResult<()> {
        if !self.defaults.contains_key(name) {
            return Err(ActionError::CommandParameterRegistrationFailed(format!(
                "Parameter '{}' is not registered in command '{}'",
                name, self.id
            )));
        }
        if let Some((constraint, _)) = self
            .constraints
            .iter()
            .find(|(_, c)| c.parameters().iter().any(|(p, _)| p == name))
        {
            return Err(ActionError::CommandParameterRegistrationFailed(format!(
                "Parameter '{}' of command '{}' is used by constraint '{}'",
                name, self.id, constraint
            )));
        }
        self.defaults.remove(name);
        self.rules.remove(name);
        Ok(())
    }

    /// Add a named constraint over already registered parameters.
    pub fn add_constraint<C>(&mut self, name: impl Into<String>, constraint: C) -> ActionResult<()>
    where
        C: Constraint + 'static,
    {
        let name = name.into();
        if self.constraints.contains_key(&name) {
            return Err(ActionError::CommandConstraintRegistrationFailed(format!(
                "Constraint '{}' is already registered in command '{}'",
                name, self.id
            )));
        }
        for (param, ty) in constraint.parameters() {
            match self.defaults.get(&param) {
                None => {
                    return Err(ActionError::CommandConstraintRegistrationFailed(format!(
                        "Constraint '{}' of command '{}' uses unknown parameter '{}'",
                        name, self.id, param
                    )))
                }
                Some(default) if default.parameter_type() != ty => {
                    return Err(ActionError::CommandConstraintRegistrationFailed(format!(
                        "Constraint '{}' of command '{}' expects parameter '{}' of type '{}', registered as '{}'",
                        name,
                        self.id,
                        param,
                        ty,
                        default.parameter_type()
                    )))
                }
                Some(_) => {}
            }
        }
        self.constraints.insert(name, Box::new(constraint));
        Ok(())
    }

    /// Remove a named constraint.
    pub fn remove_constraint(&mut self, name: &str) -> ActionResult<()> {
        self.constraints.remove(name).map(|_| ()).ok_or_else(|| {
            ActionError::CommandConstraintRegistrationFailed(format!(
                "Constraint '{}' is not registered in command '{}'",
                name, self.id
            ))
        })
    }

    /// Registered parameters and their defaults.
    pub fn default_parameters(&self) -> &ParameterSet {
        &self.defaults
    }

    /// Description of the rule of each parameter.
    pub fn rules(&self) -> BTreeMap<String, String> {
        self.rules
            .iter()
            .map(|(name, rule)| (name.clone(), rule.to_string()))
            .collect()
    }

    /// Description of each named constraint.
    pub fn constraints(&self) -> BTreeMap<String, String> {
        self.constraints
            .iter()
            .map(|(name, c)| (name.clone(), c.to_string()))
            .collect()
    }

    /// Result reported when the code does not set one.
    pub fn default_result(&self) -> Option<&ParameterValue> {
        self.default_result.as_ref()
    }

    // -------------------------------------------------------------------------
    // Parameters
    // -------------------------------------------------------------------------

    /// Registered defaults, overridden by the supplied values. Supplied names that are
    /// not registered are ignored; integers given for float parameters are widened.
    pub fn merge_parameters_with_defaults(&self, params: &ParameterSet) -> ParameterSet {
        self.defaults
            .iter()
            .map(|(name, default)| {
                let value = params
                    .get(name)
                    .cloned()
                    .map(|v| coerce(v, default.parameter_type()))
                    .unwrap_or_else(|| default.clone());
                (name.clone(), value)
            })
            .collect()
    }

    /// Check a full parameter set against every rule and constraint.
    ///
    /// Returns the violations found. Missing parameters and values of the wrong type
    /// are errors.
    pub fn check_rules_and_constraints(
        &self,
        params: &ParameterSet,
    ) -> ActionResult<Vec<ParameterViolation>> {
        let mut violations = Vec::new();

        for (name, default) in &self.defaults {
            let value = params.get(name).ok_or_else(|| {
                ActionError::ParameterNotFound(format!(
                    "Parameter '{}' missing for command '{}'",
                    name,
                    self.path()
                ))
            })?;
            if value.parameter_type() != default.parameter_type() {
                return Err(ActionError::InvalidArgument(format!(
                    "Parameter '{}' of command '{}' has type '{}', expected '{}'",
                    name,
                    self.path(),
                    value.parameter_type(),
                    default.parameter_type()
                )));
            }
            if let Some(rule) = self.rules.get(name) {
                let result = rule.verify(value);
                if !result.ok {
                    violations.push(ParameterViolation {
                        parameters: vec![name.clone()],
                        rule: rule.to_string(),
                        details: result.details,
                    });
                }
            }
        }

        for constraint in self.constraints.values() {
            let result = constraint.verify(params);
            if !result.ok {
                violations.push(ParameterViolation {
                    parameters: constraint.parameters().into_iter().map(|(n, _)| n).collect(),
                    rule: constraint.to_string(),
                    details: result.details,
                });
            }
        }

        Ok(violations)
    }

    fn validate(&self, params: &ParameterSet) -> ActionResult<()> {
        let violations = self.check_rules_and_constraints(params)?;
        if violations.is_empty() {
            return Ok(());
        }
        let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
        Err(ActionError::CommandParameterCheckFailed(format!(
            "Invalid parameters for command '{}': {}",
            self.path(),
            details.join("; ")
        )))
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    pub(crate) fn bind(&mut self, owner: Arc<ObjectCore>) {
        self.owner = Some(owner);
    }

    pub(crate) fn owner(&self) -> Option<&Arc<ObjectCore>> {
        self.owner.as_ref()
    }

    fn bound_owner(&self) -> ActionResult<&Arc<ObjectCore>> {
        self.owner.as_ref().ok_or_else(|| {
            ActionError::Runtime(format!(
                "Command '{}' is not registered on any resource",
                self.id
            ))
        })
    }

    /// Run the command, nested inside `outer` if given.
    ///
    /// Returns once the resource is claimed and the code has run (inline) or has been
    /// handed to the thread pool. Failures of the code itself are reported through the
    /// command state, not through the returned result.
    pub fn exec(
        self: &Arc<Self>,
        outer: Option<&BusyGuard>,
        params: &ParameterSet,
        use_pool: bool,
    ) -> ActionResult<()> {
        let owner = self.bound_owner()?;
        let params = self.merge_parameters_with_defaults(params);
        self.validate(&params)?;

        let guard = BusyGuard::new(
            owner.path(),
            Arc::clone(owner.status()),
            self.handle(),
            outer,
        )?;
        self.reset_for_running(&params);

        if use_pool {
            let command = Arc::clone(self);
            let submitted = owner.thread_pool().submit(Box::new(move || {
                command.run_code(&params);
                drop(guard);
            }));
            if let Err(e) = submitted {
                let mut run = self.run.lock();
                run.state = FunctionoidState::Error;
                run.status_msg = e.to_string();
                return Err(e);
            }
        } else {
            self.run_code(&params);
            drop(guard);
        }
        Ok(())
    }

    fn reset_for_running(&self, params: &ParameterSet) {
        let mut run = self.run.lock();
        run.runs += 1;
        run.state = FunctionoidState::Scheduled;
        run.progress = 0.0;
        run.status_msg = "initialised".to_string();
        run.parameters = params.clone();
        run.execution_details.clear();
        run.result = self.default_result.clone();
        run.started = None;
        run.finished = None;
        run.started_at = None;
    }

    fn run_code(&self, params: &ParameterSet) {
        {
            let mut run = self.run.lock();
            run.state = FunctionoidState::Running;
            run.started = Some(Instant::now());
            run.started_at = Some(Utc::now());
        }

        let ctx = CommandContext { command: self };
        let outcome = catch_unwind(AssertUnwindSafe(|| self.code.code(&ctx, params)));

        let mut run = self.run.lock();
        match outcome {
            Ok(Ok(state @ (FunctionoidState::Done | FunctionoidState::Warning))) => {
                run.state = state;
                run.progress = 1.0;
            }
            Ok(Ok(FunctionoidState::Error)) => {
                run.state = FunctionoidState::Error;
            }
            Ok(Ok(other)) => {
                run.state = FunctionoidState::Error;
                run.status_msg = format!(
                    "Command code returned invalid state '{}' (expected Done, Warning or Error)",
                    other
                );
            }
            Ok(Err(e)) => {
                run.state = FunctionoidState::Error;
                run.status_msg = format!("An error occurred in command code: {:#}", e);
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                run.state = FunctionoidState::Error;
                run.status_msg = format!("Command code panicked: {}", message);
            }
        }
        run.finished = Some(Instant::now());

        match run.state {
            FunctionoidState::Warning => {
                tracing::warn!("Command '{}' finished with warning: {}", self.path(), run.status_msg)
            }
            FunctionoidState::Error => {
                tracing::error!("Command '{}' failed: {}", self.path(), run.status_msg)
            }
            _ => {}
        }
    }

    /// Snapshot of the current or last run.
    pub fn get_status(&self) -> CommandSnapshot {
        let run = self.run.lock();
        self.snapshot(&run)
    }

    /// Number of runs started so far.
    pub(crate) fn run_count(&self) -> u64 {
        self.run.lock().runs
    }

    /// Snapshot of the latest run, if more than `runs` runs have started.
    pub(crate) fn get_status_after(&self, runs: u64) -> Option<CommandSnapshot> {
        let run = self.run.lock();
        (run.runs > runs).then(|| self.snapshot(&run))
    }

    fn snapshot(&self, run: &RunState) -> CommandSnapshot {
        let (actionable_id, actionable_alias) = match &self.owner {
            Some(owner) => (owner.id().to_string(), owner.alias()),
            None => (String::new(), None),
        };
        let running_time = match (run.started, run.finished) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        CommandSnapshot {
            path: self.path(),
            id: self.id.clone(),
            alias: self.alias.clone(),
            actionable_id,
            actionable_alias,
            state: run.state,
            running_time,
            progress: run.progress,
            status_msg: run.status_msg.clone(),
            parameters: run.parameters.clone(),
            execution_details: run.execution_details.clone(),
            result: if run.state.is_finished() {
                run.result.clone()
            } else {
                None
            },
            started_at: run.started_at,
        }
    }
}

impl Functionoid for Command {
    fn uid(&self) -> u64 {
        self.uid
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    fn path(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{}.{}", owner.path(), self.id),
            None => self.id.clone(),
        }
    }

    fn state(&self) -> FunctionoidState {
        self.run.lock().state
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::object::ActionableObject;
    use crate::action::thread_pool::TokioThreadPool;
    use crate::parameter::parameter_set;
    use crate::rules::{FnConstraint, GreaterThan, InRange, Match, NonEmptyString};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn board() -> ActionableObject {
        ActionableObject::new("board")
    }

    fn print_command() -> Command {
        let mut cmd = Command::new("print", |ctx, params| {
            ctx.set_progress_with_message(0.5, "halfway")?;
            let x = params["x"].as_i64().unwrap_or_default();
            ctx.set_result(x * 2);
            ctx.add_execution_details("x", x);
            Ok(FunctionoidState::Done)
        })
        .with_default_result(-1);
        cmd.register_parameter_with_rule("x", 1, InRange::new(0.0, 10.0))
            .unwrap();
        cmd.register_parameter("label", "default").unwrap();
        cmd
    }

    #[test]
    fn test_parameter_registration_errors() {
        let mut cmd = print_command();
        assert!(matches!(
            cmd.register_parameter("x", 2),
            Err(ActionError::CommandParameterRegistrationFailed(_))
        ));
        assert!(matches!(
            cmd.register_parameter_with_rule("flag", true, GreaterThan(0.0)),
            Err(ActionError::CommandParameterRegistrationFailed(_))
        ));
        assert!(matches!(
            cmd.add_constraint(
                "bad",
                FnConstraint::new("x > y", [("y", ParameterType::Int)], |_| Match::pass())
            ),
            Err(ActionError::CommandConstraintRegistrationFailed(_))
        ));
        assert!(matches!(
            cmd.add_constraint(
                "mistyped",
                FnConstraint::new("x", [("x", ParameterType::Float)], |_| Match::pass())
            ),
            Err(ActionError::CommandConstraintRegistrationFailed(_))
        ));
        assert!(cmd.remove_constraint("missing").is_err());
    }

    #[test]
    fn test_constraint_blocks_parameter_removal() {
        let mut cmd = print_command();
        cmd.add_constraint(
            "label-set",
            FnConstraint::new(
                "label not empty when x > 5",
                [("x", ParameterType::Int), ("label", ParameterType::String)],
                |p| {
                    let big = p["x"].as_i64().unwrap_or_default() > 5;
                    let empty = p["label"].as_str().unwrap_or_default().is_empty();
                    if big && empty {
                        Match::fail("label required")
                    } else {
                        Match::pass()
                    }
                },
            ),
        )
        .unwrap();

        assert!(cmd.unregister_parameter("label").is_err());
        cmd.remove_constraint("label-set").unwrap();
        cmd.unregister_parameter("label").unwrap();
        assert!(!cmd.default_parameters().contains_key("label"));
        assert!(cmd.unregister_parameter("label").is_err());
    }

    #[test]
    fn test_merge_and_check() {
        let mut cmd = print_command();
        cmd.register_parameter_with_rule("gain", 1.5, GreaterThan(0.0))
            .unwrap();
        cmd.register_parameter_with_rule("name", "a", NonEmptyString)
            .unwrap();

        let merged = cmd.merge_parameters_with_defaults(&parameter_set([
            ("x", ParameterValue::from(20)),
            ("gain", ParameterValue::from(2)),
            ("unknown", ParameterValue::from(true)),
        ]));
        assert_eq!(merged["gain"], ParameterValue::Float(2.0));
        assert_eq!(merged["label"], ParameterValue::from("default"));
        assert!(!merged.contains_key("unknown"));

        let violations = cmd.check_rules_and_constraints(&merged).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].parameters, vec!["x".to_string()]);
        assert_eq!(violations[0].rule, "x in [0, 10]");

        let mut wrong = merged.clone();
        wrong.insert("name".to_string(), ParameterValue::from(3));
        assert!(matches!(
            cmd.check_rules_and_constraints(&wrong),
            Err(ActionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_exec_inline_success() {
        let object = board();
        let cmd = object.register_command(print_command()).unwrap();
        assert_eq!(cmd.state(), FunctionoidState::Initial);
        assert_eq!(cmd.get_status().result, None);

        cmd.exec(None, &parameter_set([("x", ParameterValue::from(4))]), false)
            .unwrap();

        let status = cmd.get_status();
        assert_eq!(status.state, FunctionoidState::Done);
        assert_eq!(status.progress, 1.0);
        assert_eq!(status.status_msg, "halfway");
        assert_eq!(status.result, Some(ParameterValue::Int(8)));
        assert_eq!(status.execution_details["x"], ParameterValue::Int(4));
        assert_eq!(status.parameters["label"], ParameterValue::from("default"));
        assert_eq!(status.path, "board.print");
        assert_eq!(status.actionable_id, "board");
        assert!(status.started_at.is_some());
        assert!(!object.get_status().is_running());
    }

    #[test]
    fn test_invalid_parameters_leave_status_untouched() {
        let object = board();
        let cmd = object.register_command(print_command()).unwrap();
        let before = object.get_status();

        let err = cmd
            .exec(None, &parameter_set([("x", ParameterValue::from(42))]), false)
            .unwrap_err();

        assert!(matches!(err, ActionError::CommandParameterCheckFailed(_)));
        assert!(err.to_string().contains("x in [0, 10]"));
        assert_eq!(object.get_status(), before);
        assert_eq!(cmd.state(), FunctionoidState::Initial);
    }

    #[test]
    fn test_errors_and_panics_become_error_state() {
        let object = board();
        let failing = object
            .register_command(Command::new("fail", |_, _| {
                Err(anyhow::anyhow!("link down"))
            }))
            .unwrap();
        let panicking = object
            .register_command(Command::new("panic", |_, _| panic!("register mismatch")))
            .unwrap();
        let invalid = object
            .register_command(Command::new("invalid", |_, _| Ok(FunctionoidState::Running)))
            .unwrap();

        failing.exec(None, &ParameterSet::new(), false).unwrap();
        let status = failing.get_status();
        assert_eq!(status.state, FunctionoidState::Error);
        assert!(status.status_msg.contains("link down"));

        panicking.exec(None, &ParameterSet::new(), false).unwrap();
        assert_eq!(panicking.state(), FunctionoidState::Error);
        assert!(panicking.get_status().status_msg.contains("register mismatch"));

        invalid.exec(None, &ParameterSet::new(), false).unwrap();
        assert_eq!(invalid.state(), FunctionoidState::Error);
        assert!(invalid.get_status().status_msg.contains("invalid state"));

        assert!(!object.get_status().is_running());
    }

    #[test]
    fn test_progress_out_of_range() {
        let object = board();
        let cmd = object
            .register_command(Command::new("progress", |ctx, _| {
                let rejected = ctx.set_progress(1.5).is_err();
                ctx.set_result(rejected);
                Ok(FunctionoidState::Warning)
            }))
            .unwrap();
        cmd.exec(None, &ParameterSet::new(), false).unwrap();
        let status = cmd.get_status();
        assert_eq!(status.state, FunctionoidState::Warning);
        assert_eq!(status.result, Some(ParameterValue::Bool(true)));
    }

    #[test]
    fn test_exec_on_pool_holds_claim_until_done() {
        let pool = Arc::new(TokioThreadPool::new(2).unwrap());
        let object = board().with_thread_pool(pool);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cmd = object
            .register_command(Command::new("slow", move |_, _| {
                std::thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(FunctionoidState::Done)
            }))
            .unwrap();

        cmd.exec(None, &ParameterSet::new(), true).unwrap();
        assert!(object.get_status().is_running());

        object.status().lock().wait_until_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let status = cmd.get_status();
        assert_eq!(status.state, FunctionoidState::Done);
        assert!(status.running_time >= Duration::from_millis(50));
    }

    #[test]
    fn test_unregistered_command_cannot_run() {
        let cmd = Arc::new(Command::new("loose", |_, _| Ok(FunctionoidState::Done)));
        assert!(matches!(
            cmd.exec(None, &ParameterSet::new(), false),
            Err(ActionError::Runtime(_))
        ));
    }
}
