use crate::common::launch_hello;
use gumshoe::debugger::{Driver, RunAction, StopReason};
use serial_test::serial;

#[test]
#[serial]
fn test_breakpoint_hit_and_location() {
    let mut debugger = launch_hello();

    let info = debugger.set_breakpoint("hello.c", 9, None).unwrap();
    assert!(info.verified);
    assert_eq!(info.line, Some(9));

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Breakpoint);

    let location = state.location.expect("stop location");
    assert!(location.file.ends_with("hello.c"));
    assert_eq!(location.line, 9);
    assert_eq!(location.function.as_deref(), Some("main"));

    let brkpt = debugger.breakpoints().find_by_number(info.id).unwrap();
    assert_eq!(brkpt.hit_count(), 1);

    debugger.stop().unwrap();
}

#[test]
#[serial]
fn test_continue_does_not_retrigger_same_trap() {
    let mut debugger = launch_hello();
    debugger.set_breakpoint("hello.c", 9, None).unwrap();

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Breakpoint);

    // The step-past protocol must carry execution over the trapped
    // instruction: the next stop is program exit, not the same trap.
    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Exit);
    assert_eq!(state.exit_code, Some(0));
}

#[test]
#[serial]
fn test_locals_at_breakpoint() {
    let mut debugger = launch_hello();
    debugger.set_breakpoint("hello.c", 9, None).unwrap();

    let state = debugger.run(RunAction::Continue, None).unwrap();
    let x = state
        .locals
        .iter()
        .find(|var| var.name == "x")
        .expect("local x visible at line 9");
    assert_eq!(x.value, "42");
    assert_eq!(x.type_name, "int");

    debugger.stop().unwrap();
}

#[test]
#[serial]
fn test_backtrace_through_callee() {
    let mut debugger = launch_hello();
    debugger.set_breakpoint("hello.c", 4, None).unwrap();

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Breakpoint);

    let names: Vec<_> = state
        .stack_trace
        .iter()
        .filter_map(|frame| frame.function_name.as_deref())
        .collect();
    assert_eq!(names, ["greet", "main"]);
    assert_eq!(state.stack_trace[0].frame_index, 0);
    assert_eq!(state.stack_trace[1].frame_index, 1);

    debugger.stop().unwrap();
}

#[test]
#[serial]
fn test_remove_breakpoint_restores_flow() {
    let mut debugger = launch_hello();
    let info = debugger.set_breakpoint("hello.c", 9, None).unwrap();
    debugger.remove_breakpoint(info.id).unwrap();
    assert!(debugger.breakpoints().find_by_number(info.id).is_none());

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Exit);
}

#[test]
#[serial]
fn test_restart_rearms_breakpoints() {
    let mut debugger = launch_hello();
    let info = debugger.set_breakpoint("hello.c", 9, None).unwrap();

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Breakpoint);

    let state = debugger.run(RunAction::Restart, None).unwrap();
    assert_eq!(state.reason, StopReason::Breakpoint);
    let brkpt = debugger.breakpoints().find_by_number(info.id).unwrap();
    assert_eq!(brkpt.hit_count(), 2);

    debugger.stop().unwrap();
}

#[test]
#[serial]
fn test_conditional_breakpoint_false_condition_is_silent() {
    let mut debugger = launch_hello();
    debugger.set_condition_evaluator(Box::new(|brkpt| {
        Ok(brkpt.condition.as_deref() != Some("never"))
    }));
    debugger
        .set_breakpoint("hello.c", 9, Some("never".to_string()))
        .unwrap();

    // Observationally a single continue to exit.
    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Exit);

    // The silent hits were still counted.
    let brkpt = debugger.breakpoints().list().first().unwrap();
    assert_eq!(brkpt.hit_count(), 1);
}

#[test]
#[serial]
fn test_step_over_stays_in_function() {
    let mut debugger = launch_hello();
    debugger.set_breakpoint("hello.c", 8, None).unwrap();

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.location.as_ref().unwrap().line, 8);

    // Step over the call at line 9 without surfacing greet's frames.
    let state = debugger.run(RunAction::StepOver, None).unwrap();
    assert_eq!(state.reason, StopReason::Step);
    let location = state.location.expect("step lands on a source line");
    assert!(location.file.ends_with("hello.c"));
    assert!(location.line > 8 && location.line <= 11, "line {}", location.line);
    assert_eq!(location.function.as_deref(), Some("main"));

    debugger.stop().unwrap();
}

#[test]
#[serial]
fn test_step_out_returns_to_caller() {
    let mut debugger = launch_hello();
    debugger.set_breakpoint("hello.c", 4, None).unwrap();

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.location.as_ref().unwrap().function.as_deref(), Some("greet"));

    let state = debugger.run(RunAction::StepOut, None).unwrap();
    assert_eq!(state.reason, StopReason::Step);
    assert_eq!(
        state.location.expect("caller location").function.as_deref(),
        Some("main")
    );

    debugger.stop().unwrap();
}

#[test]
#[serial]
fn test_no_address_for_unknown_line() {
    let mut debugger = launch_hello();
    assert!(debugger.set_breakpoint("hello.c", 999, None).is_err());
    assert!(debugger.set_breakpoint("missing.c", 9, None).is_err());
}
