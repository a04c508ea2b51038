//! Integration tests for system state machines driving several boards.

mod common;

use common::{build_board, command_returning, gated_command, Gate};
use rust_swatch::action::{
    ActionableObject, ActionableSystem, Command, Functionoid, FunctionoidState, MonitoringStatus,
    SystemStateMachine, SystemTransitionSnapshot,
};
use rust_swatch::{ActionError, ParameterSet, ParameterValue, SimpleGateKeeper};
use std::sync::Arc;

/// System `crate1` with boards `proc1` and `proc2` and a `run` machine
/// `halted -> configured -> running` whose transitions drive the boards' own `run` machines.
fn crate_with_boards(
    proc2_start: FunctionoidState,
) -> (Arc<ActionableSystem>, Arc<SystemStateMachine>) {
    let mut system = ActionableSystem::new("crate1");
    system
        .add_actionable(build_board("proc1", FunctionoidState::Done))
        .unwrap();
    system
        .add_actionable(build_board("proc2", proc2_start))
        .unwrap();
    let system = Arc::new(system);

    let fsm = system
        .register_state_machine("run", "halted", "error")
        .unwrap();
    fsm.add_state("configured").unwrap();
    fsm.add_state("running").unwrap();

    let configure = fsm
        .add_transition("configure", "halted", "configured")
        .unwrap();
    configure
        .add(vec![
            child_transition(&system, "proc1", "halted", "configure"),
            child_transition(&system, "proc2", "halted", "configure"),
        ])
        .unwrap();

    let start = fsm.add_transition("start", "configured", "running").unwrap();
    start
        .add(vec![child_transition(&system, "proc1", "configured", "start")])
        .unwrap()
        .add(vec![child_transition(&system, "proc2", "configured", "start")])
        .unwrap();

    (system, fsm)
}

fn child_transition(
    system: &ActionableSystem,
    child: &str,
    from: &str,
    id: &str,
) -> Arc<rust_swatch::Transition> {
    system
        .child(child)
        .unwrap()
        .state_machine("run")
        .unwrap()
        .transition(from, id)
        .unwrap()
}

fn gatekeeper() -> SimpleGateKeeper {
    let mut gk = SimpleGateKeeper::new();
    gk.add_parameters_context("boards", [("configure.latency", ParameterValue::Int(40))])
        .unwrap();
    gk.add_parameters_context("proc2", [("configure.latency", ParameterValue::Int(44))])
        .unwrap();
    gk
}

fn state_of(object: &ActionableObject) -> (Option<String>, Option<String>) {
    let status = object.get_status();
    (status.state_machine, status.state)
}

fn engaged(state: &str) -> (Option<String>, Option<String>) {
    (Some("run".to_string()), Some(state.to_string()))
}

#[test]
fn test_engage_and_run_transitions() {
    let (system, fsm) = crate_with_boards(FunctionoidState::Done);
    let gk = gatekeeper();
    fsm.engage(&gk).unwrap();

    assert_eq!(system.get_status().state.as_deref(), Some("halted"));
    let proc1 = system.child("proc1").unwrap();
    let proc2 = system.child("proc2").unwrap();
    assert_eq!(state_of(proc1), engaged("halted"));
    assert_eq!(state_of(proc2), engaged("halted"));

    let configure = fsm.transition("halted", "configure").unwrap();
    configure.exec(&gk, false).unwrap();

    let status = configure.get_status();
    assert_eq!(status.state, FunctionoidState::Done);
    assert_eq!(status.progress(), 1.0);
    assert_eq!(status.completed_steps.len(), 1);
    assert_eq!(
        status.enabled_children.iter().cloned().collect::<Vec<_>>(),
        vec!["crate1.proc1".to_string(), "crate1.proc2".to_string()]
    );
    let results: Vec<_> = status.completed_steps[0]
        .iter()
        .map(|snapshot| snapshot.as_ref().unwrap().results[1].clone())
        .collect();
    assert_eq!(
        results,
        vec![Some(ParameterValue::Int(40)), Some(ParameterValue::Int(44))]
    );

    assert_eq!(system.get_status().state.as_deref(), Some("configured"));
    assert_eq!(state_of(proc1), engaged("configured"));
    assert_eq!(state_of(proc2), engaged("configured"));

    let start = fsm.transition("configured", "start").unwrap();
    start.exec(&gk, true).unwrap();
    system.status().lock().wait_until_idle();
    assert_eq!(start.state(), FunctionoidState::Done);
    assert_eq!(start.get_status().completed_steps.len(), 2);
    assert_eq!(system.get_status().state.as_deref(), Some("running"));
    assert_eq!(state_of(proc2), engaged("running"));

    fsm.reset(&gk).unwrap();
    assert_eq!(system.get_status().state.as_deref(), Some("halted"));
    assert_eq!(state_of(proc1), engaged("halted"));

    fsm.disengage().unwrap();
    assert_eq!(state_of(proc1), (None, None));
    assert_eq!(system.get_status().state_machine, None);
}

#[test]
fn test_gatekeeper_disabled_child_is_skipped() {
    let (system, fsm) = crate_with_boards(FunctionoidState::Done);
    let mut gk = gatekeeper();
    gk.disable("crate1.proc2");
    fsm.engage(&gk).unwrap();

    let proc1 = system.child("proc1").unwrap();
    let proc2 = system.child("proc2").unwrap();
    assert!(!proc2.get_status().enabled);
    assert_eq!(state_of(proc2), (None, None));
    assert_eq!(proc2.monitoring_status(), MonitoringStatus::NonCritical);
    assert_eq!(proc1.monitoring_status(), MonitoringStatus::Enabled);

    let configure = fsm.transition("halted", "configure").unwrap();
    configure.exec(&gk, false).unwrap();
    let status = configure.get_status();
    assert_eq!(status.state, FunctionoidState::Done);
    assert!(status.completed_steps[0][1].is_none());
    assert_eq!(
        status.enabled_children.into_iter().collect::<Vec<_>>(),
        vec!["crate1.proc1".to_string()]
    );
    assert_eq!(state_of(proc1), engaged("configured"));
    assert_eq!(state_of(proc2), (None, None));
}

#[test]
fn test_failed_step_enters_error_state() {
    let (system, fsm) = crate_with_boards(FunctionoidState::Error);
    let gk = gatekeeper();
    fsm.engage(&gk).unwrap();

    let start = fsm.transition("configured", "start").unwrap();
    start.set_error_analyser(Box::new(|snapshot: &SystemTransitionSnapshot| -> anyhow::Result<String> {
        Ok(format!(
            "step {} of {} failed",
            snapshot.completed_steps.len(),
            snapshot.total_steps
        ))
    }));

    fsm.transition("halted", "configure")
        .unwrap()
        .exec(&gk, false)
        .unwrap();
    start.exec(&gk, false).unwrap();

    let status = start.get_status();
    assert_eq!(status.state, FunctionoidState::Error);
    assert_eq!(status.message, "step 2 of 2 failed");
    assert_eq!(system.get_status().state.as_deref(), Some("error"));
    assert_eq!(state_of(system.child("proc1").unwrap()), engaged("running"));
    assert_eq!(state_of(system.child("proc2").unwrap()), engaged("error"));
}

#[test]
fn test_failed_step_stops_transition() {
    let mut system = ActionableSystem::new("crate1");
    let proc1 = system
        .add_actionable(build_board("proc1", FunctionoidState::Error))
        .unwrap();
    let proc2 = system
        .add_actionable(build_board("proc2", FunctionoidState::Done))
        .unwrap();
    let system = Arc::new(system);
    let fsm = system.register_state_machine("run", "halted", "error").unwrap();
    fsm.add_state("running").unwrap();
    let sys_start = fsm.add_transition("start", "halted", "running").unwrap();
    let configure1 = child_transition(&system, "proc1", "halted", "configure");
    let configure2 = child_transition(&system, "proc2", "halted", "configure");
    let start1 = child_transition(&system, "proc1", "configured", "start");
    let start2 = child_transition(&system, "proc2", "configured", "start");
    sys_start
        .add(vec![configure1, configure2])
        .unwrap()
        .add(vec![start1])
        .unwrap()
        .add(vec![start2])
        .unwrap();
    sys_start.set_error_analyser(Box::new(
        |_: &SystemTransitionSnapshot| -> anyhow::Result<String> { anyhow::bail!("no diagnosis") },
    ));

    let gk = gatekeeper();
    fsm.engage(&gk).unwrap();
    sys_start.exec(&gk, false).unwrap();

    let status = sys_start.get_status();
    assert_eq!(status.state, FunctionoidState::Error);
    assert_eq!(status.completed_steps.len(), 2);
    assert!(status.message.contains("no diagnosis"));
    assert_eq!(state_of(&proc1), engaged("error"));
    // The third step never ran.
    assert_eq!(state_of(&proc2), engaged("configured"));
}

#[test]
fn test_warning_analyser_sets_message() {
    let (system, fsm) = crate_with_boards(FunctionoidState::Warning);
    let gk = gatekeeper();
    fsm.engage(&gk).unwrap();
    fsm.transition("halted", "configure")
        .unwrap()
        .exec(&gk, false)
        .unwrap();

    let start = fsm.transition("configured", "start").unwrap();
    start.set_warning_analyser(Box::new(|snapshot: &SystemTransitionSnapshot| -> anyhow::Result<String> {
        let warned = snapshot
            .completed_steps
            .iter()
            .flatten()
            .flatten()
            .filter(|s| s.state == FunctionoidState::Warning)
            .count();
        Ok(format!("{} warnings", warned))
    }));
    start.exec(&gk, false).unwrap();

    let status = start.get_status();
    assert_eq!(status.state, FunctionoidState::Warning);
    assert_eq!(status.message, "1 warnings");
    assert_eq!(system.get_status().state.as_deref(), Some("running"));
    assert_eq!(state_of(system.child("proc2").unwrap()), engaged("running"));
}

#[test]
fn test_busy_child_blocks_system_transition() {
    let mut system = ActionableSystem::new("crate1");
    let board = build_board("proc1", FunctionoidState::Done);
    let gate = Gate::new();
    let slow = board.register_command(gated_command("slow", &gate)).unwrap();
    let proc1 = system.add_actionable(board).unwrap();
    let system = Arc::new(system);
    let fsm = system.register_state_machine("run", "halted", "error").unwrap();
    fsm.add_state("configured").unwrap();
    let configure = fsm.add_transition("configure", "halted", "configured").unwrap();
    configure
        .add(vec![child_transition(&system, "proc1", "halted", "configure")])
        .unwrap();

    let gk = gatekeeper();
    fsm.engage(&gk).unwrap();
    slow.exec(None, &ParameterSet::new(), true).unwrap();
    gate.wait_entered(1);

    let err = configure.exec(&gk, false).unwrap_err();
    assert!(matches!(err, ActionError::ActionableObjectIsBusy(_)));
    assert_eq!(configure.state(), FunctionoidState::Initial);
    assert!(!system.get_status().is_running());
    assert_eq!(state_of(&proc1), engaged("halted"));

    let err = fsm.disengage().unwrap_err();
    assert!(matches!(err, ActionError::ActionableObjectIsBusy(_)));

    gate.open();
    proc1.status().lock().wait_until_idle();
    configure.exec(&gk, false).unwrap();
    assert_eq!(state_of(&proc1), engaged("configured"));
}

#[test]
fn test_busy_system_refuses_transition() {
    let mut system = ActionableSystem::new("crate1");
    let board = build_board("proc1", FunctionoidState::Done);
    let gate = Gate::new();
    let slow = board
        .register_command(gated_command("slow", &gate))
        .unwrap();
    board
        .state_machine("run")
        .unwrap()
        .transition("halted", "configure")
        .unwrap()
        .add(&slow, "")
        .unwrap();
    system.add_actionable(board).unwrap();
    let system = Arc::new(system);
    let fsm = system.register_state_machine("run", "halted", "error").unwrap();
    fsm.add_state("configured").unwrap();
    let configure = fsm.add_transition("configure", "halted", "configured").unwrap();
    configure
        .add(vec![child_transition(&system, "proc1", "halted", "configure")])
        .unwrap();

    let gk = gatekeeper();
    fsm.engage(&gk).unwrap();
    configure.exec(&gk, true).unwrap();
    gate.wait_entered(1);

    let err = configure.exec(&gk, false).unwrap_err();
    assert!(matches!(err, ActionError::ActionableSystemIsBusy(_)));
    let err = fsm.reset(&gk).unwrap_err();
    assert!(matches!(err, ActionError::ActionableSystemIsBusy(_)));

    let status = configure.get_status();
    assert_eq!(status.state, FunctionoidState::Running);
    assert!(status.current_step.is_some());
    assert!(status.progress() < 1.0);

    gate.open();
    system.status().lock().wait_until_idle();
    assert_eq!(configure.state(), FunctionoidState::Done);
    assert_eq!(system.get_status().state.as_deref(), Some("configured"));
}

#[test]
fn test_wrong_state_rejected_before_claim() {
    let (system, fsm) = crate_with_boards(FunctionoidState::Done);
    let gk = gatekeeper();

    let configure = fsm.transition("halted", "configure").unwrap();
    let err = configure.exec(&gk, false).unwrap_err();
    assert!(matches!(err, ActionError::ResourceInWrongStateMachine(_)));

    fsm.engage(&gk).unwrap();
    let start = fsm.transition("configured", "start").unwrap();
    let err = start.exec(&gk, false).unwrap_err();
    assert!(matches!(err, ActionError::ResourceInWrongState(_)));
    assert_eq!(start.state(), FunctionoidState::Initial);
    assert!(!system.get_status().is_running());

    let err = fsm.engage(&gk).unwrap_err();
    assert!(matches!(err, ActionError::ResourceInWrongStateMachine(_)));
}

#[test]
fn test_missing_child_parameters_rejected() {
    let (system, fsm) = crate_with_boards(FunctionoidState::Done);
    let gk = SimpleGateKeeper::new();
    fsm.engage(&gk).unwrap();

    let err = fsm
        .transition("halted", "configure")
        .unwrap()
        .exec(&gk, false)
        .unwrap_err();
    assert!(matches!(err, ActionError::ParameterNotFound(_)));
    assert!(err.to_string().contains("2 transitions"));
    assert_eq!(system.get_status().state.as_deref(), Some("halted"));
}

#[test]
fn test_step_validation() {
    let (system, fsm) = crate_with_boards(FunctionoidState::Done);
    let transition = fsm.add_transition("check", "halted", "halted").unwrap();

    let err = transition.add(Vec::new()).unwrap_err();
    assert!(matches!(err, ActionError::InvalidSystemTransition(_)));

    let proc1_configure = child_transition(&system, "proc1", "halted", "configure");
    let err = transition
        .add(vec![Arc::clone(&proc1_configure), Arc::clone(&proc1_configure)])
        .unwrap_err();
    assert!(matches!(err, ActionError::InvalidSystemTransition(_)));

    let outsider = build_board("proc1", FunctionoidState::Done);
    let outsider_configure = outsider
        .state_machine("run")
        .unwrap()
        .transition("halted", "configure")
        .unwrap();
    let err = transition.add(vec![outsider_configure]).unwrap_err();
    assert!(matches!(err, ActionError::InvalidSystemTransition(_)));

    transition.add(vec![Arc::clone(&proc1_configure)]).unwrap();
    let err = transition.add(vec![proc1_configure]).unwrap_err();
    assert!(matches!(err, ActionError::InvalidSystemTransition(_)));

    let other_fsm = system
        .child("proc2")
        .unwrap()
        .register_state_machine("test", "idle", "broken")
        .unwrap();
    other_fsm.add_state("done").unwrap();
    let other = other_fsm.add_transition("go", "idle", "done").unwrap();
    let err = transition.add(vec![other]).unwrap_err();
    assert!(matches!(err, ActionError::InvalidSystemTransition(_)));

    assert_eq!(transition.size(), 1);
    assert_eq!(
        fsm.participants().into_iter().collect::<Vec<_>>(),
        vec![
            ("proc1".to_string(), "run".to_string()),
            ("proc2".to_string(), "run".to_string())
        ]
    );
}

#[test]
fn test_machine_definition_errors() {
    let system = Arc::new(ActionableSystem::new("crate1"));
    let fsm = system.register_state_machine("run", "halted", "error").unwrap();

    assert!(matches!(
        fsm.add_state("halted"),
        Err(ActionError::StateAlreadyDefined(_))
    ));
    assert!(matches!(
        fsm.add_transition("go", "halted", "nowhere"),
        Err(ActionError::StateNotDefined(_))
    ));
    fsm.add_transition("go", "halted", "error").unwrap();
    assert!(matches!(
        fsm.add_transition("go", "halted", "error"),
        Err(ActionError::TransitionAlreadyDefined(_))
    ));
    assert!(matches!(
        fsm.transition("nowhere", "go"),
        Err(ActionError::StateNotDefined(_))
    ));
    assert!(matches!(
        fsm.transition("halted", "stop"),
        Err(ActionError::InvalidArgument(_))
    ));
    assert_eq!(fsm.states(), vec!["halted", "error"]);
    assert_eq!(fsm.path(), "crate1.run");
    assert_eq!(fsm.transitions("halted").unwrap().len(), 1);
}

#[test]
fn test_empty_transition_completes() {
    let system = Arc::new(ActionableSystem::new("crate1"));
    let fsm = system.register_state_machine("run", "halted", "error").unwrap();
    fsm.add_state("ready").unwrap();
    let go = fsm.add_transition("go", "halted", "ready").unwrap();

    let gk = SimpleGateKeeper::new();
    fsm.engage(&gk).unwrap();
    go.exec(&gk, false).unwrap();
    assert_eq!(go.get_status().state, FunctionoidState::Done);
    assert_eq!(go.get_status().progress(), 1.0);
    assert_eq!(system.get_status().state.as_deref(), Some("ready"));
    assert_eq!(go.path(), "crate1.run.halted.go");
}

#[test]
fn test_command_on_child_of_engaged_system() {
    let mut system = ActionableSystem::new("crate1");
    let board = build_board("proc1", FunctionoidState::Done);
    let sensor = board
        .register_command(command_returning("sensor", FunctionoidState::Done))
        .unwrap();
    system.add_actionable(board).unwrap();
    let system = Arc::new(system);
    let fsm = system.register_state_machine("run", "halted", "error").unwrap();
    fsm.add_state("configured").unwrap();
    fsm.add_transition("configure", "halted", "configured")
        .unwrap()
        .add(vec![child_transition(&system, "proc1", "halted", "configure")])
        .unwrap();
    fsm.engage(&gatekeeper()).unwrap();

    // Plain commands still run on engaged children between transitions.
    sensor.exec(None, &ParameterSet::new(), false).unwrap();
    assert_eq!(sensor.state(), FunctionoidState::Done);
    assert_eq!(sensor.path(), "crate1.proc1.sensor");

    let never = Command::new("never", |_ctx, _params| Ok(FunctionoidState::Done));
    let never = Arc::new(never);
    assert!(never.exec(None, &ParameterSet::new(), false).is_err());
}
