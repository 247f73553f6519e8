use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::process::{StopStatus, TraceeMemory};
use crate::debugger::register::RegisterMap;
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::port::mach_port_t;
use nix::unistd::{ForkResult, Pid};
use os_pipe::PipeWriter;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;

const VM_PROT_READ: i32 = 0x01;
const VM_PROT_WRITE: i32 = 0x02;
const VM_PROT_EXECUTE: i32 = 0x04;
const VM_PROT_COPY: i32 = 0x10;

const VM_REGION_BASIC_INFO_64: i32 = 9;
const VM_REGION_BASIC_INFO_COUNT_64: u32 = 9;

const X86_THREAD_STATE64: u32 = 4;
const ARM_THREAD_STATE64: u32 = 6;

const MH_MAGIC_64: u32 = 0xfeed_facf;

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct VmRegionBasicInfo64 {
    protection: i32,
    max_protection: i32,
    inheritance: u32,
    shared: u32,
    reserved: u32,
    offset: u64,
    behavior: i32,
    user_wired_count: u16,
}

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct ThreadState64 {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rdi: u64,
    rsi: u64,
    rbp: u64,
    rsp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    rflags: u64,
    cs: u64,
    fs: u64,
    gs: u64,
}

#[cfg(target_arch = "x86_64")]
const THREAD_STATE_FLAVOR: u32 = X86_THREAD_STATE64;
#[cfg(target_arch = "x86_64")]
const THREAD_STATE_COUNT: u32 =
    (std::mem::size_of::<ThreadState64>() / std::mem::size_of::<u32>()) as u32;

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct ThreadState64 {
    x: [u64; 29],
    fp: u64,
    lr: u64,
    sp: u64,
    pc: u64,
    cpsr: u32,
    flags: u32,
}

#[cfg(target_arch = "aarch64")]
const THREAD_STATE_FLAVOR: u32 = ARM_THREAD_STATE64;
#[cfg(target_arch = "aarch64")]
const THREAD_STATE_COUNT: u32 =
    (std::mem::size_of::<ThreadState64>() / std::mem::size_of::<u32>()) as u32;

// Mach VM and thread entry points, declared the way the kernel exports them.
extern "C" {
    fn mach_task_self() -> mach_port_t;
    fn task_for_pid(
        host: mach_port_t,
        pid: libc::c_int,
        task: *mut mach_port_t,
    ) -> kern_return_t;
    fn mach_vm_read_overwrite(
        task: mach_port_t,
        address: u64,
        size: u64,
        data: u64,
        out_size: *mut u64,
    ) -> kern_return_t;
    fn mach_vm_write(
        task: mach_port_t,
        address: u64,
        data: u64,
        data_count: u32,
    ) -> kern_return_t;
    fn mach_vm_protect(
        task: mach_port_t,
        address: u64,
        size: u64,
        set_maximum: i32,
        new_protection: i32,
    ) -> kern_return_t;
    fn mach_vm_region(
        task: mach_port_t,
        address: *mut u64,
        size: *mut u64,
        flavor: i32,
        info: *mut VmRegionBasicInfo64,
        info_count: *mut u32,
        object_name: *mut mach_port_t,
    ) -> kern_return_t;
    fn task_threads(
        task: mach_port_t,
        thread_list: *mut *mut mach_port_t,
        thread_count: *mut u32,
    ) -> kern_return_t;
    fn thread_get_state(
        thread: mach_port_t,
        flavor: u32,
        state: *mut u32,
        state_count: *mut u32,
    ) -> kern_return_t;
    fn thread_set_state(
        thread: mach_port_t,
        flavor: u32,
        state: *const u32,
        state_count: u32,
    ) -> kern_return_t;
    fn proc_pidpath(pid: libc::c_int, buffer: *mut libc::c_void, buffer_size: u32) -> libc::c_int;
}

const PAGE_SIZE: u64 = 0x4000;

/// Debugee process controller on top of BSD `ptrace` stepping and Mach task
/// ports for memory and register access.
pub struct DebugeeControl {
    pid: Pid,
    task: mach_port_t,
    program: PathBuf,
    external: bool,
}

impl DebugeeControl {
    /// Fork the debugee in a stopped state. Debugee stdout/stderr go to
    /// `/dev/null` so its output never pollutes the caller's stream.
    pub fn spawn(
        program: &Path,
        args: &[String],
        env: &[(String, String)],
        cwd: Option<&Path>,
        _stdout: PipeWriter,
        _stderr: PipeWriter,
    ) -> Result<Self, Error> {
        let c_program = CString::new(program.as_os_str().to_string_lossy().as_bytes())
            .map_err(|e| Error::Spawn(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let mut c_args = vec![c_program.clone()];
        for arg in args {
            c_args.push(CString::new(arg.as_str()).map_err(|e| {
                Error::Spawn(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
            })?);
        }

        match unsafe { nix::unistd::fork() }.map_err(|e| Error::Spawn(e.into()))? {
            ForkResult::Parent { child } => {
                let status = Self::wait_raw(child)?;
                if !matches!(status, StopStatus::Stopped(_)) {
                    log::warn!(target: "debugger", "debugee not stopped after exec: {status:?}");
                    return Err(Error::NoProcess);
                }
                let task = Self::task_port(child)?;
                Ok(Self {
                    pid: child,
                    task,
                    program: program.to_path_buf(),
                    external: false,
                })
            }
            ForkResult::Child => unsafe {
                libc::ptrace(libc::PT_TRACE_ME, 0, ptr::null_mut(), 0);

                if let Some(cwd) = cwd {
                    if let Ok(c_cwd) = CString::new(cwd.as_os_str().to_string_lossy().as_bytes()) {
                        libc::chdir(c_cwd.as_ptr());
                    }
                }
                for (key, value) in env {
                    if let (Ok(c_key), Ok(c_value)) =
                        (CString::new(key.as_str()), CString::new(value.as_str()))
                    {
                        libc::setenv(c_key.as_ptr(), c_value.as_ptr(), 1);
                    }
                }

                let dev_null = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_WRONLY);
                if dev_null >= 0 {
                    libc::dup2(dev_null, libc::STDOUT_FILENO);
                    libc::dup2(dev_null, libc::STDERR_FILENO);
                }

                let mut argv: Vec<*const libc::c_char> =
                    c_args.iter().map(|arg| arg.as_ptr()).collect();
                argv.push(ptr::null());
                libc::execvp(c_program.as_ptr(), argv.as_ptr());
                libc::_exit(1);
            },
        }
    }

    pub fn attach(pid: Pid) -> Result<Self, Error> {
        let mut path_buffer = [0u8; 4096];
        let len = unsafe {
            proc_pidpath(
                pid.as_raw(),
                path_buffer.as_mut_ptr().cast(),
                path_buffer.len() as u32,
            )
        };
        if len <= 0 {
            return Err(Error::AttachedProcessNotFound(pid));
        }
        let program = PathBuf::from(String::from_utf8_lossy(&path_buffer[..len as usize]).as_ref());

        let result = unsafe { libc::ptrace(libc::PT_ATTACHEXC, pid.as_raw(), ptr::null_mut(), 0) };
        if result < 0 {
            return Err(Error::Attach(nix::Error::last()));
        }
        Self::wait_raw(pid)?;
        let task = Self::task_port(pid)?;
        Ok(Self {
            pid,
            task,
            program,
            external: true,
        })
    }

    fn task_port(pid: Pid) -> Result<mach_port_t, Error> {
        let mut task: mach_port_t = 0;
        let kern = unsafe { task_for_pid(mach_task_self(), pid.as_raw(), &mut task) };
        if kern != KERN_SUCCESS {
            return Err(Error::TaskForPid(kern));
        }
        Ok(task)
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
        let result =
            unsafe { libc::ptrace(libc::PT_CONTINUE, self.pid.as_raw(), 1 as *mut _, 0) };
        if result < 0 {
            return Err(Error::Ptrace(nix::Error::last()));
        }
        Ok(())
    }

    pub fn single_step(&self) -> Result<(), Error> {
        let result = unsafe { libc::ptrace(libc::PT_STEP, self.pid.as_raw(), 1 as *mut _, 0) };
        if result < 0 {
            return Err(Error::Ptrace(nix::Error::last()));
        }
        Ok(())
    }

    pub fn wait_for_stop(&self) -> Result<StopStatus, Error> {
        Self::wait_raw(self.pid)
    }

    /// Decode the raw wait status: exited when the low 7 bits are clear,
    /// stopped when the low byte is 0x7f.
    fn wait_raw(pid: Pid) -> Result<StopStatus, Error> {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if result < 0 {
            return Err(Error::Waitpid(nix::Error::last()));
        }

        Ok(if status & 0x7f == 0 {
            StopStatus::Exited((status >> 8) & 0xff)
        } else if status & 0xff == 0x7f {
            StopStatus::Stopped((status >> 8) & 0xff)
        } else if (status & 0x7f) != 0x7f {
            StopStatus::Signaled(status & 0x7f)
        } else {
            StopStatus::Unknown(status)
        })
    }

    fn primary_thread(&self) -> Result<mach_port_t, Error> {
        let mut threads: *mut mach_port_t = ptr::null_mut();
        let mut count: u32 = 0;
        let kern = unsafe { task_threads(self.task, &mut threads, &mut count) };
        if kern != KERN_SUCCESS || count == 0 {
            return Err(Error::ThreadGetState(kern));
        }
        Ok(unsafe { *threads })
    }

    pub fn read_registers(&self) -> Result<RegisterMap, Error> {
        let thread = self.primary_thread()?;
        let mut state = ThreadState64::default();
        let mut count = THREAD_STATE_COUNT;
        let kern = unsafe {
            thread_get_state(
                thread,
                THREAD_STATE_FLAVOR,
                &mut state as *mut ThreadState64 as *mut u32,
                &mut count,
            )
        };
        if kern != KERN_SUCCESS {
            return Err(Error::ThreadGetState(kern));
        }
        Ok(state.into())
    }

    pub fn write_registers(&self, map: RegisterMap) -> Result<(), Error> {
        let thread = self.primary_thread()?;
        let mut state = ThreadState64::default();
        let mut count = THREAD_STATE_COUNT;
        let kern = unsafe {
            thread_get_state(
                thread,
                THREAD_STATE_FLAVOR,
                &mut state as *mut ThreadState64 as *mut u32,
                &mut count,
            )
        };
        if kern != KERN_SUCCESS {
            return Err(Error::ThreadGetState(kern));
        }
        store_registers(&map, &mut state);
        let kern = unsafe {
            thread_set_state(
                thread,
                THREAD_STATE_FLAVOR,
                &state as *const ThreadState64 as *const u32,
                THREAD_STATE_COUNT,
            )
        };
        if kern != KERN_SUCCESS {
            return Err(Error::ThreadGetState(kern));
        }
        Ok(())
    }

    /// Scan task regions for the first executable mapping that starts with the
    /// Mach-O 64 magic; that is the runtime text base.
    pub fn text_base(&self) -> Result<RelocatedAddress, Error> {
        let mut address: u64 = 0;
        loop {
            let mut size: u64 = 0;
            let mut info = VmRegionBasicInfo64::default();
            let mut info_count = VM_REGION_BASIC_INFO_COUNT_64;
            let mut object_name: mach_port_t = 0;

            let kern = unsafe {
                mach_vm_region(
                    self.task,
                    &mut address,
                    &mut size,
                    VM_REGION_BASIC_INFO_64,
                    &mut info,
                    &mut info_count,
                    &mut object_name,
                )
            };
            if kern != KERN_SUCCESS {
                return Err(Error::TextBaseNotFound);
            }

            if info.protection & VM_PROT_EXECUTE != 0 {
                let head = self.read_memory(RelocatedAddress::from(address), 4)?;
                if head == MH_MAGIC_64.to_le_bytes() {
                    return Ok(RelocatedAddress::from(address));
                }
            }
            address = address.wrapping_add(size);
        }
    }

    pub fn kill(&self) -> Result<(), Error> {
        unsafe {
            libc::kill(self.pid.as_raw(), libc::SIGKILL);
            // A trace-stopped task holds the signal until it runs again.
            libc::ptrace(libc::PT_CONTINUE, self.pid.as_raw(), 1 as *mut _, 0);
        }
        let _ = Self::wait_raw(self.pid);
        Ok(())
    }

    pub fn detach(&self) -> Result<(), Error> {
        let result = unsafe { libc::ptrace(libc::PT_DETACH, self.pid.as_raw(), ptr::null_mut(), 0) };
        if result < 0 {
            return Err(Error::Ptrace(nix::Error::last()));
        }
        Ok(())
    }
}

impl TraceeMemory for DebugeeControl {
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let mut buffer = vec![0u8; len];
        let mut out_size: u64 = 0;
        let kern = unsafe {
            mach_vm_read_overwrite(
                self.task,
                addr.as_u64(),
                len as u64,
                buffer.as_mut_ptr() as u64,
                &mut out_size,
            )
        };
        if kern != KERN_SUCCESS || out_size != len as u64 {
            return Err(Error::MemoryRead(addr, len));
        }
        Ok(buffer)
    }

    /// Text pages are mapped read-execute; flip the page to read-write-copy
    /// for the store and back to read-execute afterwards, W^X is never
    /// violated.
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let page_start = addr.as_u64() & !(PAGE_SIZE - 1);
        let page_span =
            (addr.as_u64() + data.len() as u64).next_multiple_of(PAGE_SIZE) - page_start;

        unsafe {
            let kern = mach_vm_protect(
                self.task,
                page_start,
                page_span,
                0,
                VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
            );
            if kern != KERN_SUCCESS {
                return Err(Error::MemoryWrite(addr, data.len()));
            }

            let kern = mach_vm_write(
                self.task,
                addr.as_u64(),
                data.as_ptr() as u64,
                data.len() as u32,
            );

            let restore = mach_vm_protect(
                self.task,
                page_start,
                page_span,
                0,
                VM_PROT_READ | VM_PROT_EXECUTE,
            );

            if kern != KERN_SUCCESS || restore != KERN_SUCCESS {
                return Err(Error::MemoryWrite(addr, data.len()));
            }
        }
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
impl From<ThreadState64> for RegisterMap {
    fn from(state: ThreadState64) -> Self {
        RegisterMap {
            rax: state.rax,
            rbx: state.rbx,
            rcx: state.rcx,
            rdx: state.rdx,
            rdi: state.rdi,
            rsi: state.rsi,
            rbp: state.rbp,
            rsp: state.rsp,
            r8: state.r8,
            r9: state.r9,
            r10: state.r10,
            r11: state.r11,
            r12: state.r12,
            r13: state.r13,
            r14: state.r14,
            r15: state.r15,
            rip: state.rip,
            eflags: state.rflags,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn store_registers(map: &RegisterMap, state: &mut ThreadState64) {
    state.rax = map.rax;
    state.rbx = map.rbx;
    state.rcx = map.rcx;
    state.rdx = map.rdx;
    state.rdi = map.rdi;
    state.rsi = map.rsi;
    state.rbp = map.rbp;
    state.rsp = map.rsp;
    state.r8 = map.r8;
    state.r9 = map.r9;
    state.r10 = map.r10;
    state.r11 = map.r11;
    state.r12 = map.r12;
    state.r13 = map.r13;
    state.r14 = map.r14;
    state.r15 = map.r15;
    state.rip = map.rip;
    state.rflags = map.eflags;
}

#[cfg(target_arch = "aarch64")]
impl From<ThreadState64> for RegisterMap {
    fn from(state: ThreadState64) -> Self {
        let mut x = [0u64; 31];
        x[..29].copy_from_slice(&state.x);
        x[29] = state.fp;
        x[30] = state.lr;
        RegisterMap {
            x,
            sp: state.sp,
            pc: state.pc,
            pstate: state.cpsr as u64,
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn store_registers(map: &RegisterMap, state: &mut ThreadState64) {
    state.x.copy_from_slice(&map.x[..29]);
    state.fp = map.x[29];
    state.lr = map.x[30];
    state.sp = map.sp;
    state.pc = map.pc;
    state.cpsr = map.pstate as u32;
}
