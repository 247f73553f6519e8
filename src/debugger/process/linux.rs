use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Syscall, Waitpid};
use crate::debugger::process::{StopStatus, TraceeMemory};
use crate::debugger::register::RegisterMap;
use nix::libc::{c_long, c_void};
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use os_pipe::PipeWriter;
use std::mem;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Debugee process controller on top of `ptrace`.
///
/// The child enters a trace-stop before `execvp` via `PTRACE_TRACEME`;
/// every later interaction assumes the tracee is stopped.
pub struct DebugeeControl {
    pid: Pid,
    program: PathBuf,
    /// Attached to an already running process (detach instead of kill on drop
    /// paths that preserve the debugee).
    external: bool,
}

impl DebugeeControl {
    /// Fork the debugee in a stopped state.
    ///
    /// The pre-exec hook disables address-space randomization (the slide
    /// reconciler still runs for non-PIE layouts and attached processes) and
    /// marks the child traced, so the parent observes a stop at `execvp`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        env: &[(String, String)],
        cwd: Option<&Path>,
        stdout: PipeWriter,
        stderr: PipeWriter,
    ) -> Result<Self, Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdout(stdout).stderr(stderr);
        cmd.envs(env.iter().map(|(key, value)| (key, value)));
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        unsafe {
            cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                sys::ptrace::traceme()?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(Error::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);

        match waitpid(pid, None).map_err(Waitpid)? {
            WaitStatus::Stopped(_, _) => Ok(Self {
                pid,
                program: program.to_path_buf(),
                external: false,
            }),
            status => {
                log::warn!(target: "debugger", "debugee not stopped after exec: {status:?}");
                Err(Error::NoProcess)
            }
        }
    }

    /// Attach to a running process; the tracee stops once the attach lands.
    pub fn attach(pid: Pid) -> Result<Self, Error> {
        let program = std::fs::read_link(format!("/proc/{pid}/exe"))
            .map_err(|_| Error::AttachedProcessNotFound(pid))?;
        sys::ptrace::attach(pid).map_err(Error::Attach)?;
        waitpid(pid, None).map_err(Waitpid)?;
        Ok(Self {
            pid,
            program,
            external: true,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn continue_execution(&self) -> Result<(), Error> {
        sys::ptrace::cont(self.pid, None).map_err(Ptrace)
    }

    pub fn single_step(&self) -> Result<(), Error> {
        sys::ptrace::step(self.pid, None).map_err(Ptrace)
    }

    /// Block until the debugee stops or exits.
    pub fn wait_for_stop(&self) -> Result<StopStatus, Error> {
        let status = waitpid(self.pid, None).map_err(Waitpid)?;
        Ok(match status {
            WaitStatus::Exited(_, code) => StopStatus::Exited(code),
            WaitStatus::Stopped(_, signal) => StopStatus::Stopped(signal as i32),
            WaitStatus::Signaled(_, signal, _) => StopStatus::Signaled(signal as i32),
            WaitStatus::PtraceEvent(_, signal, _) => StopStatus::Stopped(signal as i32),
            WaitStatus::PtraceSyscall(_) => StopStatus::Stopped(Signal::SIGTRAP as i32),
            other => {
                log::debug!(target: "debugger", "unexpected wait status: {other:?}");
                StopStatus::Unknown(0)
            }
        })
    }

    pub fn read_registers(&self) -> Result<RegisterMap, Error> {
        Ok(RegisterMap::from(self.raw_registers()?))
    }

    pub fn write_registers(&self, map: RegisterMap) -> Result<(), Error> {
        let mut regs = self.raw_registers()?;
        map.store(&mut regs);
        self.set_raw_registers(regs)
    }

    #[cfg(target_arch = "x86_64")]
    fn raw_registers(&self) -> Result<nix::libc::user_regs_struct, Error> {
        sys::ptrace::getregs(self.pid).map_err(Ptrace)
    }

    #[cfg(target_arch = "x86_64")]
    fn set_raw_registers(&self, regs: nix::libc::user_regs_struct) -> Result<(), Error> {
        sys::ptrace::setregs(self.pid, regs).map_err(Ptrace)
    }

    #[cfg(target_arch = "aarch64")]
    fn raw_registers(&self) -> Result<nix::libc::user_regs_struct, Error> {
        sys::ptrace::getregset::<sys::ptrace::regset::NT_PRSTATUS>(self.pid).map_err(Ptrace)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_raw_registers(&self, regs: nix::libc::user_regs_struct) -> Result<(), Error> {
        sys::ptrace::setregset::<sys::ptrace::regset::NT_PRSTATUS>(self.pid, regs).map_err(Ptrace)
    }

    /// Runtime image base of the debugee: the lowest mapping of the program
    /// file in the process address space. Pairs with the link-time base from
    /// the object header to give the ASLR slide.
    pub fn text_base(&self) -> Result<RelocatedAddress, Error> {
        let maps = proc_maps::get_process_maps(self.pid.as_raw())
            .map_err(|e| Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let program = self.program.canonicalize().unwrap_or_else(|_| self.program.clone());
        maps.iter()
            .filter(|map| map.filename() == Some(program.as_path()))
            .map(|map| map.start())
            .min()
            .map(RelocatedAddress::from)
            .ok_or(Error::TextBaseNotFound)
    }

    /// Deliver `SIGKILL` and reap. A tracee sitting in a trace-stop will not
    /// die until it is resumed, so the kill is followed by a continue.
    pub fn kill(&self) -> Result<(), Error> {
        sys::signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| Syscall("kill", e))?;
        let _ = sys::ptrace::cont(self.pid, None);
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) | Err(_) => {
                    return Ok(())
                }
                Ok(_) => {
                    let _ = sys::ptrace::cont(self.pid, None);
                }
            }
        }
    }

    pub fn detach(&self) -> Result<(), Error> {
        sys::ptrace::detach(self.pid, None).map_err(Ptrace)
    }
}

impl TraceeMemory for DebugeeControl {
    /// Word-at-a-time `PTRACE_PEEKTEXT` read.
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let mut result = Vec::with_capacity(len);
        let mut remainder = len as isize;
        let word_size = mem::size_of::<c_long>();

        let mut addr = addr.as_usize() as *mut c_long;
        while remainder > 0 {
            let word = sys::ptrace::read(self.pid, addr as *mut c_void)
                .map_err(|_| Error::MemoryRead(RelocatedAddress::from(addr as usize), len))?;
            result.extend(word.to_ne_bytes().into_iter().take(remainder as usize));

            remainder -= word_size as isize;
            addr = unsafe { addr.offset(1) };
        }

        debug_assert!(result.len() == len);
        Ok(result)
    }

    /// Word-at-a-time `PTRACE_POKETEXT` write. Partial words at the edges are
    /// read back first and merged, so neighbouring bytes survive.
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let word_size = mem::size_of::<c_long>();
        let mut offset = 0usize;

        while offset < data.len() {
            let word_addr = (addr.as_usize() + offset) as *mut c_void;
            let chunk = &data[offset..(offset + word_size).min(data.len())];

            let word = if chunk.len() == word_size {
                c_long::from_ne_bytes(chunk.try_into().expect("chunk is word sized"))
            } else {
                let current = sys::ptrace::read(self.pid, word_addr)
                    .map_err(|_| Error::MemoryWrite(addr, data.len()))?;
                let mut bytes = current.to_ne_bytes();
                bytes[..chunk.len()].copy_from_slice(chunk);
                c_long::from_ne_bytes(bytes)
            };

            unsafe {
                sys::ptrace::write(self.pid, word_addr, word as *mut c_void)
                    .map_err(|_| Error::MemoryWrite(addr, data.len()))?;
            }
            offset += word_size;
        }

        Ok(())
    }
}
