//! Per-resource concurrency status.
//!
//! Every [`ActionableObject`](super::ActionableObject) and
//! [`ActionableSystem`](super::ActionableSystem) owns one [`ActionableStatus`]: a mutex
//! protecting the stack of running actions together with the alive/enabled flags, the
//! engaged state machine and the metric-update flag, plus a condition variable signalled
//! on every change that can make a waiter ready.
//!
//! All reads and writes go through an [`ActionableStatusGuard`], which is only obtainable
//! by locking the status it belongs to. Holding the guard is the capability proof for
//! the operation.
//!
//! # Invariants
//!
//! - The stack is empty exactly when the resource is idle; the top is the innermost action.
//! - `alive` goes from true to false once (`kill`) and never back.
//! - Waiting never spins: waiters sleep on the condition variable and re-check their
//!   predicate on wake-up.
//!
//! # Multi-resource claims
//!
//! [`StatusContainer::lock_mutexes`] locks a system status and then every child status in
//! id order, which is the only order in which more than one status is ever held.
//! [`StatusGuardMap::wait_until_ready_to_run_action`] releases all of them while it
//! sleeps and relocks them in that same order, so a system-wide claim is observed either
//! on every participant or on none.

use super::functionoid::{ActionHandle, ActionKind};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time copy of a resource's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionableSnapshot {
    /// False once the resource has been killed
    pub alive: bool,
    /// False while new top-level claims are refused
    pub enabled: bool,
    /// Running actions, outermost first
    pub running_actions: Vec<ActionHandle>,
    /// Engaged state machine, if any
    pub state_machine: Option<String>,
    /// Current state in the engaged state machine
    pub state: Option<String>,
    /// True while monitoring data is being refreshed
    pub updating_metrics: bool,
}

impl ActionableSnapshot {
    /// True when at least one action runs.
    pub fn is_running(&self) -> bool {
        !self.running_actions.is_empty()
    }

    /// True when a state machine is engaged.
    pub fn is_engaged(&self) -> bool {
        self.state_machine.is_some()
    }

    /// Innermost running action.
    pub fn last_running_action(&self) -> Option<&ActionHandle> {
        self.running_actions.last()
    }

    /// Outermost running action of the given kind.
    pub fn first_running_action_of_kind(&self, kind: ActionKind) -> Option<&ActionHandle> {
        self.running_actions.iter().find(|a| a.kind() == kind)
    }
}

// =============================================================================
// ActionableStatus
// =============================================================================

#[derive(Debug)]
struct StatusState {
    alive: bool,
    enabled: bool,
    running: Vec<ActionHandle>,
    state_machine: Option<String>,
    state: Option<String>,
    updating_metrics: bool,
}

/// Whether a status can accept a new top-level action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Alive, enabled and idle
    Ready,
    /// Running an action or refreshing metrics
    Busy,
    /// Not enabled
    Disabled,
    /// Killed
    Killed,
}

/// Mutex-protected concurrency status of one resource.
#[derive(Debug)]
pub struct ActionableStatus {
    state: Mutex<StatusState>,
    changed: Condvar,
}

impl Default for ActionableStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionableStatus {
    /// Alive, enabled, idle status without state machine.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StatusState {
                alive: true,
                enabled: true,
                running: Vec::new(),
                state_machine: None,
                state: None,
                updating_metrics: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Lock the status.
    pub fn lock(&self) -> ActionableStatusGuard<'_> {
        ActionableStatusGuard {
            status: self,
            state: self.state.lock(),
        }
    }

    /// Lock, then return a snapshot.
    pub fn snapshot(&self) -> ActionableSnapshot {
        self.lock().snapshot()
    }
}

/// Lock token for one [`ActionableStatus`].
pub struct ActionableStatusGuard<'a> {
    status: &'a ActionableStatus,
    state: MutexGuard<'a, StatusState>,
}

impl fmt::Debug for ActionableStatusGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActionableStatusGuard").field(&*self.state).finish()
    }
}

impl<'a> ActionableStatusGuard<'a> {
    /// The status this guard locks.
    pub fn status(&self) -> &'a ActionableStatus {
        self.status
    }

    /// True when this guard locks `status`.
    pub fn is_for(&self, status: &ActionableStatus) -> bool {
        std::ptr::eq(self.status, status)
    }

    /// Copy of the current status.
    pub fn snapshot(&self) -> ActionableSnapshot {
        ActionableSnapshot {
            alive: self.state.alive,
            enabled: self.state.enabled,
            running_actions: self.state.running.clone(),
            state_machine: self.state.state_machine.clone(),
            state: self.state.state.clone(),
            updating_metrics: self.state.updating_metrics,
        }
    }

    /// False once killed.
    pub fn is_alive(&self) -> bool {
        self.state.alive
    }

    /// Enabled flag.
    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    /// True when at least one action runs.
    pub fn is_running(&self) -> bool {
        !self.state.running.is_empty()
    }

    /// Running actions, outermost first.
    pub fn running_actions(&self) -> &[ActionHandle] {
        &self.state.running
    }

    /// Innermost running action.
    pub fn innermost_action(&self) -> Option<&ActionHandle> {
        self.state.running.last()
    }

    /// True when `action` is anywhere on the stack.
    pub fn is_action_running(&self, action: &ActionHandle) -> bool {
        self.state.running.contains(action)
    }

    /// Engaged state machine.
    pub fn state_machine(&self) -> Option<&str> {
        self.state.state_machine.as_deref()
    }

    /// Current state in the engaged state machine.
    pub fn state(&self) -> Option<&str> {
        self.state.state.as_deref()
    }

    /// True while metrics are being refreshed.
    pub fn is_updating_metrics(&self) -> bool {
        self.state.updating_metrics
    }

    /// Readiness for a new top-level action.
    pub fn readiness(&self) -> Readiness {
        if !self.state.alive {
            Readiness::Killed
        } else if !self.state.enabled {
            Readiness::Disabled
        } else if !self.state.running.is_empty() || self.state.updating_metrics {
            Readiness::Busy
        } else {
            Readiness::Ready
        }
    }

    /// Accept new top-level actions again.
    pub fn enable(&mut self) {
        self.state.enabled = true;
        self.status.changed.notify_all();
    }

    /// Refuse new top-level actions. Running actions are not affected.
    pub fn disable(&mut self) {
        self.state.enabled = false;
        self.status.changed.notify_all();
    }

    /// Mark the resource as dead. Irreversible; does not touch the stack.
    pub fn kill(&mut self) {
        self.state.alive = false;
        self.status.changed.notify_all();
    }

    /// Push `action` on top of the stack without any check.
    pub fn add_action(&mut self, action: ActionHandle) {
        self.state.running.push(action);
    }

    /// Pop the innermost action. Returns `None` when the stack is empty.
    pub fn pop_action(&mut self) -> Option<ActionHandle> {
        let popped = self.state.running.pop();
        self.status.changed.notify_all();
        popped
    }

    /// Sleep until the status is ready, killed or disabled. Returns the final readiness.
    pub fn wait_until_ready(&mut self) -> Readiness {
        while self.readiness() == Readiness::Busy {
            self.status.changed.wait(&mut self.state);
        }
        self.readiness()
    }

    /// Sleep until ready, then push `action`.
    ///
    /// Returns the blocking readiness (without pushing) if the resource is killed or
    /// disabled before it becomes ready.
    pub fn wait_until_ready_to_run_action(&mut self, action: ActionHandle) -> Result<(), Readiness> {
        match self.wait_until_ready() {
            Readiness::Ready => {
                self.add_action(action);
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Sleep until no action runs.
    pub fn wait_until_idle(&mut self) {
        while !self.state.running.is_empty() {
            self.status.changed.wait(&mut self.state);
        }
    }

    /// Sleep until `action` is the innermost running action (or no longer running).
    pub fn wait_until_innermost(&mut self, action: &ActionHandle) {
        while self.state.running.contains(action) && self.state.running.last() != Some(action) {
            self.status.changed.wait(&mut self.state);
        }
    }

    /// Engage a state machine in the given state.
    pub fn set_state_machine(&mut self, state_machine: &str, state: &str) {
        self.state.state_machine = Some(state_machine.to_string());
        self.state.state = Some(state.to_string());
    }

    /// Disengage any state machine.
    pub fn set_no_state_machine(&mut self) {
        self.state.state_machine = None;
        self.state.state = None;
    }

    /// Change state within the engaged state machine.
    pub fn set_state(&mut self, state: &str) {
        self.state.state = Some(state.to_string());
    }

    /// Mark the start of a metric refresh, waiting for any refresh already in progress.
    pub fn begin_metric_update(&mut self) {
        while self.state.updating_metrics {
            self.status.changed.wait(&mut self.state);
        }
        self.state.updating_metrics = true;
    }

    /// Mark the end of a metric refresh.
    pub fn finish_metric_update(&mut self) {
        self.state.updating_metrics = false;
        self.status.changed.notify_all();
    }
}

// =============================================================================
// Multi-resource locking
// =============================================================================

/// System status plus one status per child, locked together.
#[derive(Debug)]
pub struct StatusContainer {
    system: Arc<ActionableStatus>,
    children: BTreeMap<String, Arc<ActionableStatus>>,
}

impl StatusContainer {
    /// Container for a system status without children.
    pub fn new(system: Arc<ActionableStatus>) -> Self {
        Self {
            system,
            children: BTreeMap::new(),
        }
    }

    /// Add a child status. Returns false if `id` is already present.
    pub fn add_child(&mut self, id: &str, status: Arc<ActionableStatus>) -> bool {
        if self.children.contains_key(id) {
            return false;
        }
        self.children.insert(id.to_string(), status);
        true
    }

    /// System status.
    pub fn system_status(&self) -> &Arc<ActionableStatus> {
        &self.system
    }

    /// Status of child `id`.
    pub fn child_status(&self, id: &str) -> Option<&Arc<ActionableStatus>> {
        self.children.get(id)
    }

    /// Lock the system status, then every child status in id order.
    pub fn lock_mutexes(&self) -> StatusGuardMap<'_> {
        let system = self.system.lock();
        let children = self
            .children
            .iter()
            .map(|(id, status)| (id.clone(), status.lock()))
            .collect();
        StatusGuardMap {
            container: self,
            system,
            children,
        }
    }
}

/// Why a multi-resource wait gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitFailure {
    /// Child id, or `None` for the system itself
    pub child: Option<String>,
    /// Readiness that stopped the wait
    pub readiness: Readiness,
}

/// Guards for a system status and all of its children, held together.
pub struct StatusGuardMap<'a> {
    container: &'a StatusContainer,
    system: ActionableStatusGuard<'a>,
    children: BTreeMap<String, ActionableStatusGuard<'a>>,
}

impl fmt::Debug for StatusGuardMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusGuardMap")
            .field("system", &self.system)
            .field("children", &self.children)
            .finish()
    }
}

impl<'a> StatusGuardMap<'a> {
    /// The container these guards were taken from.
    pub fn container(&self) -> &'a StatusContainer {
        self.container
    }

    /// Guard of the system status.
    pub fn system(&self) -> &ActionableStatusGuard<'a> {
        &self.system
    }

    /// Mutable guard of the system status.
    pub fn system_mut(&mut self) -> &mut ActionableStatusGuard<'a> {
        &mut self.system
    }

    /// Guard of child `id`.
    pub fn child(&self, id: &str) -> Option<&ActionableStatusGuard<'a>> {
        self.children.get(id)
    }

    /// Mutable guard of child `id`.
    pub fn child_mut(&mut self, id: &str) -> Option<&mut ActionableStatusGuard<'a>> {
        self.children.get_mut(id)
    }

    /// Child ids, in lock order.
    pub fn child_ids(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    fn first_blocker(&self, participants: &[String]) -> Option<(Option<String>, Readiness)> {
        let system = self.system.readiness();
        if system != Readiness::Ready {
            return Some((None, system));
        }
        participants.iter().find_map(|id| {
            let readiness = self.children.get(id).map(|g| g.readiness())?;
            (readiness != Readiness::Ready).then(|| (Some(id.clone()), readiness))
        })
    }

    /// Wait until the system and every listed participant are ready at the same time,
    /// then push `action` onto all of them.
    ///
    /// While something is busy, every lock is released and the caller sleeps on the
    /// busy status; all locks are then retaken in the canonical order and the check
    /// starts again. Gives up if a resource is killed or disabled.
    pub fn wait_until_ready_to_run_action(
        mut self,
        participants: &[String],
        action: &ActionHandle,
    ) -> Result<Self, WaitFailure> {
        loop {
            match self.first_blocker(participants) {
                None => break,
                Some((child, Readiness::Busy)) => {
                    let container = self.container;
                    let blocking = match &child {
                        None => container.system_status(),
                        Some(id) => match container.child_status(id) {
                            Some(status) => status,
                            None => break,
                        },
                    };
                    drop(self);
                    // Outcome is re-evaluated under the full lock set below.
                    let _ = blocking.lock().wait_until_ready();
                    self = container.lock_mutexes();
                }
                Some((child, readiness)) => return Err(WaitFailure { child, readiness }),
            }
        }

        self.system.add_action(action.clone());
        for id in participants {
            if let Some(guard) = self.children.get_mut(id) {
                guard.add_action(action.clone());
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::functionoid::{next_uid, Functionoid, FunctionoidState};
    use std::thread;
    use std::time::Duration;

    struct Dummy {
        uid: u64,
        id: &'static str,
    }

    impl Dummy {
        fn new(id: &'static str) -> Self {
            Self { uid: next_uid(), id }
        }
    }

    impl Functionoid for Dummy {
        fn uid(&self) -> u64 {
            self.uid
        }
        fn id(&self) -> &str {
            self.id
        }
        fn alias(&self) -> Option<&str> {
            None
        }
        fn path(&self) -> String {
            format!("dummy.{}", self.id)
        }
        fn state(&self) -> FunctionoidState {
            FunctionoidState::Initial
        }
        fn kind(&self) -> ActionKind {
            ActionKind::Command
        }
    }

    #[test]
    fn test_new_status_is_ready() {
        let status = ActionableStatus::new();
        let snapshot = status.snapshot();
        assert!(snapshot.alive);
        assert!(snapshot.enabled);
        assert!(!snapshot.is_running());
        assert!(!snapshot.is_engaged());
        assert_eq!(status.lock().readiness(), Readiness::Ready);
    }

    #[test]
    fn test_push_pop_lifo() {
        let status = ActionableStatus::new();
        let (a, b) = (Dummy::new("a"), Dummy::new("b"));
        let mut guard = status.lock();
        guard.add_action(a.handle());
        guard.add_action(b.handle());
        assert_eq!(guard.innermost_action(), Some(&b.handle()));
        assert_eq!(guard.pop_action(), Some(b.handle()));
        assert_eq!(guard.pop_action(), Some(a.handle()));
        assert_eq!(guard.pop_action(), None);
    }

    #[test]
    fn test_disable_and_kill() {
        let status = ActionableStatus::new();
        let mut guard = status.lock();
        guard.disable();
        assert_eq!(guard.readiness(), Readiness::Disabled);
        guard.enable();
        guard.kill();
        assert_eq!(guard.readiness(), Readiness::Killed);
        assert_eq!(
            guard.wait_until_ready_to_run_action(Dummy::new("x").handle()),
            Err(Readiness::Killed)
        );
        assert!(!guard.is_running());
    }

    #[test]
    fn test_first_running_action_of_kind() {
        let status = ActionableStatus::new();
        let a = Dummy::new("a");
        status.lock().add_action(a.handle());
        let snapshot = status.snapshot();
        assert_eq!(
            snapshot.first_running_action_of_kind(ActionKind::Command),
            Some(&a.handle())
        );
        assert!(snapshot
            .first_running_action_of_kind(ActionKind::Sequence)
            .is_none());
    }

    #[test]
    fn test_wait_until_ready_wakes_on_pop() {
        let status = Arc::new(ActionableStatus::new());
        let (a, b) = (Dummy::new("a"), Dummy::new("b"));
        status.lock().add_action(a.handle());

        let waiter = {
            let status = Arc::clone(&status);
            let handle = b.handle();
            thread::spawn(move || {
                let mut guard = status.lock();
                guard.wait_until_ready_to_run_action(handle)
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(status.snapshot().running_actions, vec![a.handle()]);
        status.lock().pop_action();

        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(status.snapshot().running_actions, vec![b.handle()]);
    }

    #[test]
    fn test_waiter_gives_up_when_killed() {
        let status = Arc::new(ActionableStatus::new());
        let a = Dummy::new("a");
        status.lock().add_action(a.handle());

        let waiter = {
            let status = Arc::clone(&status);
            let handle = Dummy::new("b").handle();
            thread::spawn(move || {
                let mut guard = status.lock();
                guard.wait_until_ready_to_run_action(handle)
            })
        };

        thread::sleep(Duration::from_millis(50));
        status.lock().kill();
        assert_eq!(waiter.join().unwrap(), Err(Readiness::Killed));
    }

    #[test]
    fn test_metric_update_blocks_claims() {
        let status = Arc::new(ActionableStatus::new());
        status.lock().begin_metric_update();
        assert_eq!(status.lock().readiness(), Readiness::Busy);

        let waiter = {
            let status = Arc::clone(&status);
            let handle = Dummy::new("a").handle();
            thread::spawn(move || {
                let mut guard = status.lock();
                guard.wait_until_ready_to_run_action(handle)
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!status.snapshot().is_running());

        status.lock().finish_metric_update();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    fn container() -> StatusContainer {
        let mut container = StatusContainer::new(Arc::new(ActionableStatus::new()));
        assert!(container.add_child("b", Arc::new(ActionableStatus::new())));
        assert!(container.add_child("a", Arc::new(ActionableStatus::new())));
        assert!(!container.add_child("a", Arc::new(ActionableStatus::new())));
        container
    }

    #[test]
    fn test_lock_mutexes_in_id_order() {
        let container = container();
        let guards = container.lock_mutexes();
        assert_eq!(guards.child_ids().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(guards.system().is_for(container.system_status()));
    }

    #[test]
    fn test_multi_wait_pushes_on_all_participants() {
        let container = container();
        let action = Dummy::new("sys").handle();
        let participants = vec!["a".to_string()];

        let guards = container
            .lock_mutexes()
            .wait_until_ready_to_run_action(&participants, &action)
            .unwrap();
        assert_eq!(guards.system().running_actions(), &[action.clone()]);
        assert_eq!(guards.child("a").unwrap().running_actions(), &[action.clone()]);
        assert!(!guards.child("b").unwrap().is_running());
    }

    #[test]
    fn test_multi_wait_fails_without_partial_claim() {
        let container = container();
        container.child_status("b").unwrap().lock().disable();
        let action = Dummy::new("sys").handle();
        let participants = vec!["a".to_string(), "b".to_string()];

        let failure = container
            .lock_mutexes()
            .wait_until_ready_to_run_action(&participants, &action)
            .err()
            .unwrap();
        assert_eq!(failure.child.as_deref(), Some("b"));
        assert_eq!(failure.readiness, Readiness::Disabled);

        assert!(!container.system_status().snapshot().is_running());
        assert!(!container.child_status("a").unwrap().snapshot().is_running());
    }

    #[test]
    fn test_multi_wait_sleeps_until_metrics_done() {
        let container = Arc::new(container());
        let child = Arc::clone(container.child_status("a").unwrap());
        child.lock().begin_metric_update();

        let action = Dummy::new("sys").handle();
        let waiter = {
            let container = Arc::clone(&container);
            let action = action.clone();
            thread::spawn(move || {
                let participants = vec!["a".to_string(), "b".to_string()];
                let outcome = container
                    .lock_mutexes()
                    .wait_until_ready_to_run_action(&participants, &action);
                outcome.is_ok()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!container.system_status().snapshot().is_running());
        child.lock().finish_metric_update();

        assert!(waiter.join().unwrap());
        assert_eq!(child.snapshot().running_actions, vec![action.clone()]);
        assert_eq!(
            container.system_status().snapshot().running_actions,
            vec![action]
        );
    }
}
