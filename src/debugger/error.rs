use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::binary::LoadError;
use crate::debugger::dwarf::ParseError;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- setup errors ----------------------------------------------
    #[error("binary load error: {0}")]
    BinaryLoad(#[from] LoadError),
    #[error("spawn debugee: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),

    // --------------------------------- control errors --------------------------------------------
    #[error("program is not being started")]
    NoProcess,
    #[error("debugee already run")]
    AlreadyRun,
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("read {1} bytes at {0}")]
    MemoryRead(RelocatedAddress, usize),
    #[error("write {1} bytes at {0}")]
    MemoryWrite(RelocatedAddress, usize),
    #[error("task_for_pid failed with kern_return {0}")]
    TaskForPid(i32),
    #[error("thread_get_state failed with kern_return {0}")]
    ThreadGetState(i32),

    // --------------------------------- resolution errors -----------------------------------------
    #[error("no address for {0}:{1}")]
    NoAddressForLine(String, u64),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(u32),
    #[error("address {0} not mapped by any segment")]
    AddressNotMapped(RelocatedAddress),
    #[error("source place not found at address {0}")]
    PlaceNotFound(GlobalAddress),
    #[error("function `{0}` not found")]
    FunctionNotFound(String),
    #[error("variable `{0}` not found")]
    VariableNotFound(String),
    #[error("unknown register {0:?}")]
    RegisterNotFound(gimli::Register),
    #[error("unknown register {0:?}")]
    RegisterNameNotFound(String),
    #[error("frame number {0} not found")]
    FrameNotFound(u32),
    #[error("text segment base not found")]
    TextBaseNotFound,

    // --------------------------------- parsing errors --------------------------------------------
    #[error("debug information parsing error: {0}")]
    DwarfParsing(#[from] ParseError),

    // --------------------------------- driver errors ---------------------------------------------
    #[error("operation `{0}` is not supported by this driver")]
    NotSupported(&'static str),
    #[error("breakpoint condition: {0}")]
    Condition(anyhow::Error),
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
