//! # Rust SWATCH Core Library
//!
//! Concurrency core for configuring and operating clusters of programmable electronics
//! boards. Each board is an actionable resource exposing commands, command sequences and
//! state machines; a crate of boards is an actionable system whose transitions drive many
//! boards through their own state machines at once.
//!
//! ## Crate Structure
//!
//! - **`action`**: resources, actions and the guards serializing them. Start with
//!   `ActionableObject`, `Command` and `ActionableSystem`.
//! - **`parameter`**: typed parameter values and parameter sets.
//! - **`rules`**: validation rules for single parameters and constraints across several.
//! - **`error`**: the `ActionError` enum shared by every operation.
//! - **`config`**: TOML/environment configuration of a system.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`registry`**: creator registry building a system from its configuration.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rust_swatch::{build_system, logging, CreatorRegistry, SimpleGateKeeper, SystemConfig};
//!
//! let config = SystemConfig::load_from("config/crate1.toml")?;
//! logging::init_from_config(&config)?;
//!
//! let mut creators = CreatorRegistry::new();
//! creators.register("Processor", processor::create)?;
//! let system = Arc::new(build_system(&config, &creators)?);
//! let fsm = define_run_control(&system)?;
//!
//! let gk = SimpleGateKeeper::load_from("config/gatekeeper.toml")?;
//! fsm.engage(&gk)?;
//! fsm.transition("halted", "configure")?.exec(&gk, true)?;
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod logging;
pub mod parameter;
pub mod registry;
pub mod rules;

pub use action::{
    ActionableObject, ActionableSystem, Command, CommandContext, CommandSequence,
    FunctionoidState, GateKeeper, SimpleGateKeeper, StateMachine, SystemStateMachine,
    SystemTransition, Transition,
};
pub use config::SystemConfig;
pub use error::{ActionError, ActionResult};
pub use parameter::{parameter_set, ParameterSet, ParameterType, ParameterValue};
pub use registry::{build_system, CreatorRegistry};
