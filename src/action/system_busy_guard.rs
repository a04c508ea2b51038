//! Scoped claim of a system together with its enabled participants.
//!
//! Built from a [`StatusGuardMap`] the caller already holds (the system status and all
//! child statuses locked in canonical order), so the busy checks and the claim see one
//! consistent view of every resource involved:
//!
//! 1. the system must be alive, enabled and idle;
//! 2. every enabled participant must be alive and idle;
//! 3. a single multi-resource wait pushes the action on the system and on all enabled
//!    participants at once;
//! 4. one adopt-mode [`BusyGuard`] per enabled participant takes ownership of the child
//!    claims, so child transitions can nest inside them.
//!
//! If any check fails nothing has been pushed anywhere.

use super::busy_guard::BusyGuard;
use super::functionoid::ActionHandle;
use super::status::{
    ActionableStatus, ActionableStatusGuard, Readiness, StatusGuardMap, WaitFailure,
};
use crate::error::{ActionError, ActionResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Runs under the system status lock after the system action is popped.
pub type SystemBusyGuardCallback =
    Box<dyn FnOnce(&mut ActionableStatusGuard<'_>, &mut String) + Send>;

/// Claim of a system and its enabled participants for one system action.
pub struct SystemBusyGuard {
    system_path: String,
    system_status: Arc<ActionableStatus>,
    action: ActionHandle,
    child_guards: BTreeMap<String, BusyGuard>,
    callback: Option<SystemBusyGuardCallback>,
}

impl fmt::Debug for SystemBusyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemBusyGuard")
            .field("system_path", &self.system_path)
            .field("action", &self.action)
            .field("children", &self.child_guards.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SystemBusyGuard {
    /// Claim the system and the enabled subset of `participants` (child id to child path).
    ///
    /// Consumes the caller's locks and hands them back on success, still held.
    pub fn new<'a>(
        system_path: &str,
        guards: StatusGuardMap<'a>,
        action: ActionHandle,
        participants: &BTreeMap<String, String>,
        callback: Option<SystemBusyGuardCallback>,
    ) -> ActionResult<(Self, StatusGuardMap<'a>)> {
        let container = guards.container();

        match guards.system().readiness() {
            Readiness::Ready => {}
            Readiness::Busy => {
                let running = guards
                    .system()
                    .innermost_action()
                    .map_or_else(|| "metric update".to_string(), ToString::to_string);
                return Err(ActionError::ActionableSystemIsBusy(format!(
                    "Could not run {} on system '{}'. System currently busy running {}.",
                    action, system_path, running
                )));
            }
            Readiness::Disabled | Readiness::Killed => {
                return Err(ActionError::ActionableSystemIsBusy(format!(
                    "Could not run {} on system '{}'. Actions currently disabled on this system.",
                    action, system_path
                )));
            }
        }

        let enabled: Vec<String> = participants
            .keys()
            .filter(|id| guards.child(id).is_some_and(|g| g.is_enabled()))
            .cloned()
            .collect();

        for id in &enabled {
            let Some(child) = guards.child(id) else {
                continue;
            };
            let reason = match child.readiness() {
                Readiness::Ready | Readiness::Disabled => continue,
                Readiness::Killed => "Child is being deleted.".to_string(),
                Readiness::Busy => match child.innermost_action() {
                    Some(running) => format!("Child currently busy running {}.", running),
                    None => "Child currently updating metrics.".to_string(),
                },
            };
            return Err(ActionError::ActionableObjectIsBusy(format!(
                "Could not run {} on system '{}' due to child resource '{}'. {}",
                action, system_path, participants[id], reason
            )));
        }

        tracing::info!("Starting {} on system '{}'", action, system_path);
        let guards = guards
            .wait_until_ready_to_run_action(&enabled, &action)
            .map_err(|failure| wait_failure(failure, &action, system_path, participants))?;

        let mut child_guards = BTreeMap::new();
        let mut adopt_error = None;
        for id in &enabled {
            let (Some(status), Some(child)) = (container.child_status(id), guards.child(id)) else {
                continue;
            };
            match BusyGuard::adopt(participants[id].as_str(), Arc::clone(status), child, action.clone()) {
                Ok(guard) => {
                    child_guards.insert(id.clone(), guard);
                }
                Err(e) => {
                    adopt_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = adopt_error {
            drop(guards);
            drop(child_guards);
            release_unadopted(container.system_status(), &action);
            for id in &enabled {
                if let Some(status) = container.child_status(id) {
                    release_unadopted(status, &action);
                }
            }
            return Err(e);
        }

        Ok((
            Self {
                system_path: system_path.to_string(),
                system_status: Arc::clone(container.system_status()),
                action,
                child_guards,
                callback,
            },
            guards,
        ))
    }

    /// Adopted guard of an enabled participant.
    pub fn child_guard(&self, child_id: &str) -> ActionResult<&BusyGuard> {
        self.child_guards.get(child_id).ok_or_else(|| {
            ActionError::Runtime(format!(
                "Non-participating or disabled object '{}' requested from busy guard of {} on system '{}'",
                child_id, self.action, self.system_path
            ))
        })
    }

    /// Ids of the claimed (enabled) participants.
    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.child_guards.keys().map(String::as_str)
    }

    /// The system action.
    pub fn action(&self) -> &ActionHandle {
        &self.action
    }
}

impl Drop for SystemBusyGuard {
    fn drop(&mut self) {
        self.child_guards.clear();

        let mut guard = self.system_status.lock();
        if guard.innermost_action() == Some(&self.action) {
            guard.pop_action();
            let mut suffix = String::new();
            if let Some(callback) = self.callback.take() {
                callback(&mut guard, &mut suffix);
            }
            drop(guard);
            tracing::info!(
                "Finished {} on system '{}'.{}",
                self.action,
                self.system_path,
                suffix
            );
        } else {
            let innermost = guard
                .innermost_action()
                .map_or_else(|| "none".to_string(), ToString::to_string);
            drop(guard);
            tracing::error!(
                "Unexpected active action {} on system '{}' while releasing busy guard for {}",
                innermost,
                self.system_path,
                self.action
            );
        }
    }
}

fn wait_failure(
    failure: WaitFailure,
    action: &ActionHandle,
    system_path: &str,
    participants: &BTreeMap<String, String>,
) -> ActionError {
    let reason = match failure.readiness {
        Readiness::Killed => "is being deleted",
        _ => "has actions disabled",
    };
    match failure.child {
        None => ActionError::ActionableSystemIsBusy(format!(
            "Could not run {}: system '{}' {}",
            action, system_path, reason
        )),
        Some(id) => ActionError::ActionableObjectIsBusy(format!(
            "Could not run {} on system '{}': child resource '{}' {}",
            action,
            system_path,
            participants.get(&id).map_or(id.as_str(), String::as_str),
            reason
        )),
    }
}

fn release_unadopted(status: &ActionableStatus, action: &ActionHandle) {
    let mut guard = status.lock();
    if guard.innermost_action() == Some(action) {
        guard.pop_action();
    }
}
