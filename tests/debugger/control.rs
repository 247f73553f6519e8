use crate::common::{hello_fixture, launch_hello};
use gumshoe::debugger::{Debugger, Driver, LaunchRequest, RunAction, StepGranularity, StopReason};
use serial_test::serial;
use std::io::Read;

#[test]
#[serial]
fn test_run_to_exit() {
    let mut debugger = launch_hello();
    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Exit);
    assert_eq!(state.exit_code, Some(0));
}

#[test]
#[serial]
fn test_debugee_output_captured() {
    let mut debugger = launch_hello();
    let mut output = debugger.take_output().unwrap();

    let state = debugger.run(RunAction::Continue, None).unwrap();
    assert_eq!(state.reason, StopReason::Exit);

    let mut stdout = String::new();
    output.stdout.read_to_string(&mut stdout).unwrap();
    assert!(stdout.contains("hello, debugger"));
    assert!(stdout.contains("x = 42"));
}

#[test]
#[serial]
fn test_instruction_step_from_entry() {
    let mut debugger = launch_hello();
    let state = debugger
        .run(RunAction::StepInto, Some(StepGranularity::Instruction))
        .unwrap();
    assert_eq!(state.reason, StopReason::Step);

    debugger.stop().unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
#[serial]
fn test_register_access() {
    let debugger = launch_hello();
    let rip = debugger.read_register("rip").unwrap();
    assert_ne!(rip, 0);
    assert!(debugger.read_register("xmm9000").is_err());
}

#[test]
#[serial]
fn test_memory_read_at_pc() {
    let debugger = launch_hello();

    #[cfg(target_arch = "x86_64")]
    let pc = debugger.read_register("rip").unwrap();
    #[cfg(target_arch = "aarch64")]
    let pc = debugger.read_register("pc").unwrap();

    let code = debugger.read_memory(pc, 4).unwrap();
    assert_eq!(code.len(), 4);
}

#[test]
#[serial]
fn test_stop_kills_debugee() {
    let mut debugger = launch_hello();
    debugger.stop().unwrap();
    // The process is gone; further control requests must fail cleanly.
    assert!(debugger.run(RunAction::Continue, None).is_err());
}

#[test]
#[serial]
fn test_attach_and_detach() {
    let mut sleeper = std::process::Command::new("sleep")
        .arg("10")
        .spawn()
        .unwrap();

    {
        let mut debugger = Debugger::new();
        debugger.attach(sleeper.id() as i32).unwrap();
        // Drop path detaches from externally attached processes.
    }

    sleeper.kill().unwrap();
    sleeper.wait().unwrap();
}

#[test]
#[serial]
fn test_launch_twice_is_rejected() {
    let mut debugger = launch_hello();
    let err = debugger.launch(LaunchRequest {
        program: hello_fixture(),
        ..Default::default()
    });
    assert!(err.is_err());
}
