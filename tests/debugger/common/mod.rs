use gumshoe::debugger::{Debugger, Driver, LaunchRequest};
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

/// Compile the C fixture once per test run with frame pointers preserved.
pub fn hello_fixture() -> PathBuf {
    static FIXTURE: OnceLock<PathBuf> = OnceLock::new();
    FIXTURE
        .get_or_init(|| {
            let source = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/hello.c");
            let output = std::env::temp_dir().join(format!("gumshoe_hello_{}", std::process::id()));

            let status = Command::new("cc")
                .args(["-g", "-O0", "-fno-omit-frame-pointer", "-o"])
                .arg(&output)
                .arg(&source)
                .status()
                .expect("cc is required for integration tests");
            assert!(status.success(), "fixture compilation failed");
            output
        })
        .clone()
}

pub fn launch_hello() -> Debugger {
    let mut debugger = Debugger::new();
    debugger
        .launch(LaunchRequest {
            program: hello_fixture(),
            ..Default::default()
        })
        .expect("launch fixture");
    debugger
}
