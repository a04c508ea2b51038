//! Custom error types for the actionable-resource core.
//!
//! This module defines the primary error type, `ActionError`, raised by every fallible
//! operation in the crate. Using the `thiserror` crate, it provides one variant per error
//! kind so callers can match on the condition (retry after a busy error, report a
//! registration mistake, etc.) instead of parsing messages.
//!
//! ## Error Taxonomy
//!
//! - **Contention** (`ActionableObjectIsBusy`, `ActionableSystemIsBusy`, `WrongBusyGuard`):
//!   raised while claiming a resource. Never retried automatically.
//! - **Registration** (`*AlreadyExistsInActionableObject`, `*NotFoundInActionableObject`,
//!   `CommandParameterRegistrationFailed`, `CommandConstraintRegistrationFailed`, state machine
//!   definition errors): programmer or configuration mistakes.
//! - **Parameters** (`ParameterNotFound`, `CommandParameterCheckFailed`, `InvalidArgument`):
//!   always raised before a resource is claimed or any status is touched.
//! - **State** (`ResourceInWrongStateMachine`, `ResourceInWrongState`): a transition or state
//!   machine operation was requested from the wrong place.
//! - **Infrastructure** (`OperationOnStoppedThreadPool`, `Config`, `Io`, `Runtime`).
//!
//! Failures inside user command code never show up here; they are converted into the
//! `Error` state of the command instead.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ActionResult<T> = std::result::Result<T, ActionError>;

/// Every error condition surfaced by the actionable-resource core.
///
/// Messages always name the resource path and the action involved.
#[derive(Error, Debug)]
pub enum ActionError {
    /// A resource could not be claimed for an action.
    #[error("Resource busy: {0}")]
    ActionableObjectIsBusy(String),

    /// A system could not be claimed for a system-wide action.
    #[error("System busy: {0}")]
    ActionableSystemIsBusy(String),

    /// An outer busy guard did not match the resource state.
    #[error("Wrong busy guard: {0}")]
    WrongBusyGuard(String),

    /// A command id was registered twice on one object.
    #[error("{0}")]
    CommandAlreadyExistsInActionableObject(String),

    /// A sequence id was registered twice on one object.
    #[error("{0}")]
    CommandSequenceAlreadyExistsInActionableObject(String),

    /// A state machine id was registered twice on one resource.
    #[error("{0}")]
    StateMachineAlreadyExistsInActionableObject(String),

    /// No command with the requested id.
    #[error("{0}")]
    CommandNotFoundInActionableObject(String),

    /// No sequence with the requested id.
    #[error("{0}")]
    CommandSequenceNotFoundInActionableObject(String),

    /// No state machine with the requested id.
    #[error("{0}")]
    StateMachineNotFoundInActionableObject(String),

    /// A parameter value could not be found in the gatekeeper.
    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    /// Parameter values failed a rule or constraint.
    #[error("Parameter check failed: {0}")]
    CommandParameterCheckFailed(String),

    /// A parameter could not be registered or unregistered.
    #[error("Parameter registration failed: {0}")]
    CommandParameterRegistrationFailed(String),

    /// A constraint could not be added or removed.
    #[error("Constraint registration failed: {0}")]
    CommandConstraintRegistrationFailed(String),

    /// A numeric value was outside its legal range.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// A value had the wrong type.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An item was attached to a resource it does not belong to.
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// A state was added twice to a state machine.
    #[error("State already defined: {0}")]
    StateAlreadyDefined(String),

    /// A transition referenced an unknown state.
    #[error("State not defined: {0}")]
    StateNotDefined(String),

    /// A transition id was reused from the same state.
    #[error("Transition already defined: {0}")]
    TransitionAlreadyDefined(String),

    /// A step could not be added to a system transition.
    #[error("Invalid system transition: {0}")]
    InvalidSystemTransition(String),

    /// The resource is not engaged in the expected state machine.
    #[error("Resource in wrong state machine: {0}")]
    ResourceInWrongStateMachine(String),

    /// The resource is not in the expected state.
    #[error("Resource in wrong state: {0}")]
    ResourceInWrongState(String),

    /// A task was submitted after the pool was stopped.
    #[error("Thread pool stopped: {0}")]
    OperationOnStoppedThreadPool(String),

    /// A gatekeeper context was added twice.
    #[error("Context already exists: {0}")]
    ContextWithIdAlreadyExists(String),

    /// Unexpected runtime condition (e.g. lookup of a non-participating child guard).
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration file could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Semantic configuration errors caught during validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure while reading files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_keep_context() {
        let err = ActionError::ActionableObjectIsBusy(
            "Action 'reset' is already running on resource 'crate1.board3'".to_string(),
        );
        let text = err.to_string();
        assert!(text.starts_with("Resource busy"));
        assert!(text.contains("crate1.board3"));
        assert!(text.contains("reset"));
    }

    #[test]
    fn test_registration_errors_display_verbatim() {
        let err = ActionError::CommandNotFoundInActionableObject(
            "Unable to find Command with ID 'x' in object 'board'".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "Unable to find Command with ID 'x' in object 'board'"
        );
    }
}
