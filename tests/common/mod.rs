//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use rust_swatch::action::{ActionableObject, Command, FunctionoidState, StateMachine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latch that command code blocks on until the test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called from command code: count the entry, then block until opened.
    pub fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Block until `n` callers have reached the gate.
    pub fn wait_entered(&self, n: usize) {
        assert!(
            wait_for(Duration::from_secs(5), || self.entered() >= n),
            "only {} of {} callers reached the gate",
            self.entered(),
            n
        );
    }
}

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Block until no action runs on `object`.
pub fn wait_idle(object: &ActionableObject) {
    object.status().lock().wait_until_idle();
}

/// Command finishing immediately in `state`.
pub fn command_returning(id: &str, state: FunctionoidState) -> Command {
    Command::new(id, move |ctx, _params| {
        ctx.set_status_msg(format!("finished in {}", state));
        Ok(state)
    })
}

/// Command blocking on `gate` before finishing Done.
pub fn gated_command(id: &str, gate: &Arc<Gate>) -> Command {
    let gate = Arc::clone(gate);
    Command::new(id, move |ctx, _params| {
        ctx.set_progress_with_message(0.5, "waiting for gate")?;
        gate.pass();
        Ok(FunctionoidState::Done)
    })
}

/// Board with a `run` machine `halted -> configured -> running`:
/// - `configure` runs `reset` then `configure` (parameter `latency`, default 0);
/// - `start` runs `start`, finishing in `start_state`.
pub fn board(id: &str, start_state: FunctionoidState) -> Arc<ActionableObject> {
    let board = build_board(id, start_state);
    Arc::new(board)
}

/// Same as [`board`], unshared so it can be added to a system.
pub fn build_board(id: &str, start_state: FunctionoidState) -> ActionableObject {
    let board = ActionableObject::new(id).with_gatekeeper_contexts([id, "boards"]);

    let reset = board
        .register_command(command_returning("reset", FunctionoidState::Done))
        .unwrap();
    let mut configure = Command::new("configure", |ctx, params| {
        ctx.set_result(params["latency"].clone());
        Ok(FunctionoidState::Done)
    });
    configure.register_parameter("latency", 0_i64).unwrap();
    let configure = board.register_command(configure).unwrap();
    let start = board
        .register_command(command_returning("start", start_state))
        .unwrap();

    let fsm = board.register_state_machine("run", "halted", "error").unwrap();
    define_run_machine(&fsm, &reset, &configure, &start);
    board
}

fn define_run_machine(
    fsm: &StateMachine,
    reset: &Arc<Command>,
    configure: &Arc<Command>,
    start: &Arc<Command>,
) {
    fsm.add_state("configured").unwrap();
    fsm.add_state("running").unwrap();
    fsm.add_transition("configure", "halted", "configured")
        .unwrap()
        .add(reset, "")
        .unwrap()
        .add(configure, "")
        .unwrap();
    fsm.add_transition("start", "configured", "running")
        .unwrap()
        .add(start, "")
        .unwrap();
}
