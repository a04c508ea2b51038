//! Scoped claims on a resource's running-actions stack.
//!
//! A [`BusyGuard`] pushes an action onto an [`ActionableStatus`] when it is built and pops
//! it when dropped, so the claim is released on every exit path, panics included.
//!
//! Three ways to claim:
//!
//! - **Top level** (no outer guard): waits until the resource is idle, then pushes.
//!   Fails at once if the action is already on the stack, or if the resource is killed or
//!   disabled.
//! - **Nested** (`with_outer`): the outer guard must be for the same resource and its
//!   action must be the innermost running one. Pushes without waiting; this is how a
//!   sequence runs its commands "within" its own claim.
//! - **Adopt**: the resource must already run exactly this action and nothing else
//!   (pushed by a system-wide claim). Nothing is pushed, but the guard still pops on drop.
//!
//! ```rust,ignore
//! let outer = BusyGuard::new(board.path(), board.status(), sequence.handle(), None)?;
//! {
//!     let inner = BusyGuard::new(board.path(), board.status(), command.handle(), Some(&outer))?;
//!     // stack: [sequence, command]
//! }
//! // stack: [sequence]
//! ```

use super::functionoid::ActionHandle;
use super::status::{ActionableStatus, ActionableStatusGuard, Readiness};
use crate::error::{ActionError, ActionResult};
use std::fmt;
use std::sync::Arc;

/// Runs under the status lock right after the action is popped; may append text to the
/// completion log line.
pub type BusyGuardCallback = Box<dyn FnOnce(&mut ActionableStatusGuard<'_>, &mut String) + Send>;

type Precondition<'a> = Box<dyn Fn(&ActionableStatusGuard<'_>) -> ActionResult<()> + 'a>;

/// Claim of one resource for one action.
pub struct BusyGuard {
    resource_path: String,
    status: Arc<ActionableStatus>,
    action: ActionHandle,
    callback: Option<BusyGuardCallback>,
}

impl fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyGuard")
            .field("resource_path", &self.resource_path)
            .field("action", &self.action)
            .finish()
    }
}

impl BusyGuard {
    /// Start configuring a claim of `status` (belonging to `resource_path`) for `action`.
    pub fn builder<'a>(
        resource_path: impl Into<String>,
        status: Arc<ActionableStatus>,
        action: ActionHandle,
    ) -> BusyGuardBuilder<'a> {
        BusyGuardBuilder {
            resource_path: resource_path.into(),
            status,
            action,
            outer: None,
            precondition: None,
            callback: None,
        }
    }

    /// Claim with default options, optionally nested inside `outer`.
    pub fn new(
        resource_path: impl Into<String>,
        status: Arc<ActionableStatus>,
        action: ActionHandle,
        outer: Option<&BusyGuard>,
    ) -> ActionResult<Self> {
        Self::builder(resource_path, status, action)
            .with_outer(outer)
            .claim()
    }

    /// Take over a claim already pushed on `status` by a system-wide action.
    ///
    /// `guard` must be the caller's lock on `status`; the stack must contain exactly
    /// `action`.
    pub fn adopt(
        resource_path: impl Into<String>,
        status: Arc<ActionableStatus>,
        guard: &ActionableStatusGuard<'_>,
        action: ActionHandle,
    ) -> ActionResult<Self> {
        let resource_path = resource_path.into();
        if !guard.is_for(&status) {
            return Err(ActionError::WrongBusyGuard(format!(
                "Status guard passed to adopt {} does not lock the status of resource '{}'",
                action, resource_path
            )));
        }
        if guard.running_actions() != [action.clone()] {
            let running: Vec<String> = guard.running_actions().iter().map(ToString::to_string).collect();
            return Err(ActionError::WrongBusyGuard(format!(
                "Cannot adopt {} on resource '{}': running actions are [{}]",
                action,
                resource_path,
                running.join(", ")
            )));
        }

        tracing::debug!("Starting {} on '{}' (adopted)", action, resource_path);
        Ok(Self {
            resource_path,
            status,
            action,
            callback: None,
        })
    }

    /// Action this guard claims the resource for.
    pub fn action(&self) -> &ActionHandle {
        &self.action
    }

    /// Path of the claimed resource.
    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    /// Status of the claimed resource.
    pub fn status(&self) -> &Arc<ActionableStatus> {
        &self.status
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut guard = self.status.lock();
        if guard.innermost_action() == Some(&self.action) {
            guard.pop_action();
            let mut suffix = String::new();
            if let Some(callback) = self.callback.take() {
                callback(&mut guard, &mut suffix);
            }
            drop(guard);
            tracing::info!("Finished {} on '{}'.{}", self.action, self.resource_path, suffix);
        } else {
            let innermost = guard
                .innermost_action()
                .map_or_else(|| "none".to_string(), ToString::to_string);
            drop(guard);
            tracing::error!(
                "Unexpected active action {} on resource '{}' while releasing busy guard for {}",
                innermost,
                self.resource_path,
                self.action
            );
        }
    }
}

/// Options for claiming a resource; see [`BusyGuard::builder`].
pub struct BusyGuardBuilder<'a> {
    resource_path: String,
    status: Arc<ActionableStatus>,
    action: ActionHandle,
    outer: Option<&'a BusyGuard>,
    precondition: Option<Precondition<'a>>,
    callback: Option<BusyGuardCallback>,
}

impl<'a> BusyGuardBuilder<'a> {
    /// Nest the claim inside `outer`.
    pub fn with_outer(mut self, outer: Option<&'a BusyGuard>) -> Self {
        self.outer = outer;
        self
    }

    /// Check run under the status lock right before the action is pushed (after any
    /// wait). An error aborts the claim and leaves the status untouched.
    pub fn with_precondition<F>(mut self, check: F) -> Self
    where
        F: Fn(&ActionableStatusGuard<'_>) -> ActionResult<()> + 'a,
    {
        self.precondition = Some(Box::new(check));
        self
    }

    /// Callback run when the guard releases the resource.
    pub fn with_callback(mut self, callback: BusyGuardCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Claim the resource.
    pub fn claim(self) -> ActionResult<BusyGuard> {
        let BusyGuardBuilder {
            resource_path,
            status,
            action,
            outer,
            precondition,
            callback,
        } = self;

        let mut guard = status.lock();

        if let Some(outer) = outer {
            if !Arc::ptr_eq(&outer.status, &status) {
                return Err(ActionError::WrongBusyGuard(format!(
                    "Outer busy guard for {} on resource '{}' cannot be used for {} on resource '{}'",
                    outer.action, outer.resource_path, action, resource_path
                )));
            }
            match guard.innermost_action() {
                None => {
                    return Err(ActionError::WrongBusyGuard(format!(
                        "Outer busy guard used for {} on resource '{}', but resource is not busy",
                        action, resource_path
                    )))
                }
                Some(innermost) if innermost != &outer.action => {
                    return Err(ActionError::WrongBusyGuard(format!(
                        "Outer busy guard is for {}, but innermost action on resource '{}' is {}",
                        outer.action, resource_path, innermost
                    )))
                }
                Some(_) => {}
            }
        }

        if guard.is_action_running(&action) {
            return Err(ActionError::ActionableObjectIsBusy(format!(
                "Could not run {} on resource '{}': it is already running",
                action, resource_path
            )));
        }

        match outer {
            Some(outer) => {
                if let Some(check) = &precondition {
                    check(&guard)?;
                }
                guard.add_action(action.clone());
                tracing::info!(
                    "Starting {} within {} on '{}'",
                    action,
                    outer.action,
                    resource_path
                );
            }
            None => {
                if let Some(current) = guard.innermost_action() {
                    tracing::debug!(
                        "Resource '{}' busy running {}; {} waits",
                        resource_path,
                        current,
                        action
                    );
                }
                match guard.wait_until_ready() {
                    Readiness::Ready => {}
                    Readiness::Disabled => {
                        return Err(ActionError::ActionableObjectIsBusy(format!(
                            "Could not run {} on resource '{}'. Actions currently disabled on this resource.",
                            action, resource_path
                        )))
                    }
                    Readiness::Killed | Readiness::Busy => {
                        return Err(ActionError::ActionableObjectIsBusy(format!(
                            "Could not run {} on resource '{}'. Resource is being deleted.",
                            action, resource_path
                        )))
                    }
                }
                if let Some(check) = &precondition {
                    check(&guard)?;
                }
                guard.add_action(action.clone());
                tracing::info!("Starting {} on '{}'", action, resource_path);
            }
        }
        drop(guard);

        Ok(BusyGuard {
            resource_path,
            status,
            action,
            callback,
        })
    }
}
