//! Named, reusable list of commands of one resource.
//!
//! ```rust,ignore
//! let setup = board.register_sequence("setup", &reset, "")?;
//! setup.then(&configure_tx, "tx")?.then(&configure_rx, "rx")?;
//! setup.exec(&gatekeeper, None, true)?;
//! ```

use super::busy_guard::BusyGuard;
use super::command::Command;
use super::command_vec::{CommandVec, CommandVecSnapshot, Element, MissingParam, ParamRuleViolationList};
use super::functionoid::{ActionKind, Functionoid, FunctionoidState};
use super::gatekeeper::GateKeeper;
use super::object::ObjectCore;
use crate::error::ActionResult;
use crate::parameter::ParameterSet;
use std::fmt;
use std::sync::Arc;

/// Command sequence registered on an [`ActionableObject`](super::ActionableObject).
pub struct CommandSequence {
    vec: Arc<CommandVec>,
}

impl fmt::Debug for CommandSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSequence")
            .field("path", &self.path())
            .field("size", &self.size())
            .finish()
    }
}

impl CommandSequence {
    pub(crate) fn new(owner: Arc<ObjectCore>, id: &str) -> Self {
        Self {
            vec: Arc::new(CommandVec::new(owner, id, ActionKind::Sequence, id)),
        }
    }

    /// Append `command`. An empty namespace means the sequence id.
    pub fn run(&self, command: &Arc<Command>, namespace: &str) -> ActionResult<&Self> {
        let namespace = if namespace.is_empty() {
            self.vec.id()
        } else {
            namespace
        };
        self.vec.add(command, namespace)?;
        Ok(self)
    }

    /// Same as [`run`](Self::run), for chaining.
    pub fn then(&self, command: &Arc<Command>, namespace: &str) -> ActionResult<&Self> {
        self.run(command, namespace)
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

    /// Look up parameters in `gk`, check them, claim the resource and run every command.
    ///
    /// Parameter errors are returned before the resource is touched.
    pub fn exec(
        &self,
        gk: &dyn GateKeeper,
        outer: Option<&BusyGuard>,
        use_pool: bool,
    ) -> ActionResult<()> {
        let prepared = self.vec.prepare(gk)?;
        self.vec.launch(prepared, outer, use_pool, None, None)
    }

    /// Snapshot of the current or last run.
    pub fn get_status(&self) -> CommandVecSnapshot {
        self.vec.get_status()
    }
}

impl Functionoid for CommandSequence {
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
        ActionKind::Sequence
    }
}
