//! Gumshoe is a native source-level debugger engine: it loads ELF and Mach-O
//! binaries, reads their DWARF debug information, drives the debugee with
//! ptrace (Linux) or Mach task ports (macOS), and resolves breakpoints,
//! stacks and variables back to source level.

pub mod debugger;

pub use debugger::error::Error;
pub use debugger::{Debugger, Driver, StopReason, StopState};
