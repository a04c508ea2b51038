//! Shared identity and lifecycle state of every schedulable action.
//!
//! Commands, command sequences, object-level transitions and system transitions all go
//! through the same lifecycle:
//!
//! ```text
//! Initial ──► Scheduled ──► Running ──┬──► Done
//!                                     ├──► Warning
//!                                     └──► Error
//! ```
//!
//! They are long-lived (created at registration and reused for every run), and are
//! identified on a resource's running-actions stack through a cheap [`ActionHandle`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique action identity.
pub(crate) fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionoidState {
    /// Never run, or reset
    Initial,
    /// Claimed the resource, waiting for a worker
    Scheduled,
    /// Executing
    Running,
    /// Finished with an error
    Error,
    /// Finished, with a warning
    Warning,
    /// Finished successfully
    Done,
}

/// Literal printed for state codes outside the known range.
pub const UNKNOWN_STATE: &str = "Unknown value of FunctionoidState enum";

impl FunctionoidState {
    /// All states, in declaration order.
    pub const ALL: [FunctionoidState; 6] = [
        FunctionoidState::Initial,
        FunctionoidState::Scheduled,
        FunctionoidState::Running,
        FunctionoidState::Error,
        FunctionoidState::Warning,
        FunctionoidState::Done,
    ];

    /// Documented name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            FunctionoidState::Initial => "Initial",
            FunctionoidState::Scheduled => "Scheduled",
            FunctionoidState::Running => "Running",
            FunctionoidState::Error => "Error",
            FunctionoidState::Warning => "Warning",
            FunctionoidState::Done => "Done",
        }
    }

    /// State for a numeric code (declaration order), `None` if out of range.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// True once the action finished, whatever the outcome.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            FunctionoidState::Done | FunctionoidState::Warning | FunctionoidState::Error
        )
    }

    /// True for Done and Warning.
    pub fn is_successful(self) -> bool {
        matches!(self, FunctionoidState::Done | FunctionoidState::Warning)
    }
}

impl fmt::Display for FunctionoidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a raw state code, falling back to [`UNKNOWN_STATE`].
pub fn format_state_code(code: u8) -> &'static str {
    FunctionoidState::from_code(code).map_or(UNKNOWN_STATE, FunctionoidState::as_str)
}

/// Closed set of action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Single [`Command`](super::Command)
    Command,
    /// [`CommandSequence`](super::CommandSequence)
    Sequence,
    /// Object-level [`Transition`](super::Transition)
    Transition,
    /// [`SystemTransition`](super::SystemTransition)
    SystemTransition,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Command => "command",
            ActionKind::Sequence => "sequence",
            ActionKind::Transition => "transition",
            ActionKind::SystemTransition => "system transition",
        })
    }
}

/// Entry of a running-actions stack.
///
/// Two handles are equal when they refer to the same action, whatever their
/// recorded path.
#[derive(Debug, Clone)]
pub struct ActionHandle {
    uid: u64,
    id: String,
    path: String,
    kind: ActionKind,
}

impl ActionHandle {
    /// Action id (last path element)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full dotted path at the time the handle was taken
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Kind of action
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Process-unique identity
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl PartialEq for ActionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for ActionHandle {}

impl fmt::Display for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

/// Capability shared by every action type.
pub trait Functionoid: Send + Sync {
    /// Identity on running-actions stacks
    fn uid(&self) -> u64;

    /// Id, unique among siblings
    fn id(&self) -> &str;

    /// Optional human-friendly name
    fn alias(&self) -> Option<&str>;

    /// Full dotted path, derived from the owning resource
    fn path(&self) -> String;

    /// Current lifecycle state
    fn state(&self) -> FunctionoidState;

    /// Kind of action
    fn kind(&self) -> ActionKind;

    /// Handle used to push this action on a running-actions stack.
    fn handle(&self) -> ActionHandle {
        ActionHandle {
            uid: self.uid(),
            id: self.id().to_string(),
            path: self.path(),
            kind: self.kind(),
        }
    }
}
