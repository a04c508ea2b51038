//! Concurrency core for actionable hardware resources.
//!
//! A resource ([`ActionableObject`]) exposes actions ([`Command`], [`CommandSequence`],
//! [`Transition`]) that run one at a time: each run claims the resource through a
//! [`BusyGuard`] pushed on the resource's [`ActionableStatus`]. A system
//! ([`ActionableSystem`]) groups resources and runs [`SystemTransition`]s that claim the
//! system and all its enabled children atomically through a [`SystemBusyGuard`].
//!
//! Parameters come from a [`GateKeeper`], looked up in the resource's contexts; actions run
//! inline on the caller's thread or on a [`ThreadPool`].
//!
//! ```rust,ignore
//! use rust_swatch::action::{ActionableObject, Command, FunctionoidState};
//! use rust_swatch::parameter::{parameter_set, ParameterValue};
//!
//! let board = Arc::new(ActionableObject::new("board1"));
//! let mut reset = Command::new("reset", |ctx, _params| {
//!     ctx.set_status_msg("Resetting");
//!     Ok(FunctionoidState::Done)
//! });
//! reset.register_parameter("clock", "internal")?;
//! let reset = board.register_command(reset)?;
//!
//! reset.exec(None, &parameter_set([("clock", ParameterValue::from("external"))]), true)?;
//! ```

pub mod busy_guard;
pub mod command;
pub mod command_vec;
pub mod functionoid;
pub mod gatekeeper;
pub mod monitoring;
pub mod object;
pub mod sequence;
pub mod state_machine;
pub mod status;
pub mod system;
pub mod system_busy_guard;
pub mod system_state_machine;
pub mod thread_pool;
pub mod transition;

pub use busy_guard::{BusyGuard, BusyGuardBuilder, BusyGuardCallback};
pub use command::{
    Command, CommandCode, CommandContext, CommandSnapshot, ParameterViolation,
};
pub use command_vec::{
    CommandVec, CommandVecSnapshot, Element, MissingParam, ParamRuleViolationList,
};
pub use functionoid::{ActionHandle, ActionKind, Functionoid, FunctionoidState};
pub use gatekeeper::{GateKeeper, SimpleGateKeeper};
pub use monitoring::{MaskableObject, MonitorableObject, MonitoringStatus};
pub use object::ActionableObject;
pub use sequence::CommandSequence;
pub use state_machine::StateMachine;
pub use status::{
    ActionableSnapshot, ActionableStatus, ActionableStatusGuard, Readiness, StatusContainer,
    StatusGuardMap, WaitFailure,
};
pub use system::ActionableSystem;
pub use system_busy_guard::{SystemBusyGuard, SystemBusyGuardCallback};
pub use system_state_machine::{
    SnapshotAnalyser, SystemStateMachine, SystemTransition, SystemTransitionSnapshot,
};
pub use thread_pool::{InlineThreadPool, Task, ThreadPool, TokioThreadPool};
pub use transition::Transition;
