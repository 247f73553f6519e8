#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::DebugeeControl;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::DebugeeControl;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;

/// Decoded `wait` status of the debugee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// Stopped in a trace-stop by this signal.
    Stopped(i32),
    /// Exited normally with this code.
    Exited(i32),
    /// Terminated by this signal.
    Signaled(i32),
    Unknown(i32),
}

/// Address-space access of a stopped tracee. Implemented by the live process
/// controllers and by the core-dump loader.
pub trait TraceeMemory {
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error>;
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;

    fn read_u64(&self, addr: RelocatedAddress) -> Result<u64, Error> {
        let bytes = self.read_memory(addr, 8)?;
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::MemoryRead(addr, 8))?;
        Ok(u64::from_le_bytes(bytes))
    }
}
