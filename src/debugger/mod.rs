pub mod address;
pub mod binary;
pub mod breakpoint;
pub mod coredump;
pub mod dwarf;
pub mod error;
pub mod process;
pub mod register;
pub mod unwind;
pub mod variable;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::binary::Binary;
use crate::debugger::breakpoint::{
    Breakpoint, BreakpointRegistry, ConditionEvaluator, TRAP_PC_OFFSET,
};
use crate::debugger::dwarf::eval::{EvalResult, ExpressionEvaluator, MemoryProvider};
use crate::debugger::dwarf::unit::VariableInfo;
use crate::debugger::dwarf::DebugInformation;
use crate::debugger::error::Error;
use crate::debugger::process::{DebugeeControl, StopStatus, TraceeMemory};
use crate::debugger::register::{DwarfRegisterMap, RegisterMap};
use crate::debugger::unwind::Frame;
use crate::{muted_error, weak_error};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::path::PathBuf;

/// Source position attached to a stop report.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Exception,
    Exit,
    Entry,
    Pause,
}

/// Rendered local variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableValue {
    pub name: String,
    pub value: String,
    pub type_name: String,
}

/// What the debugee looked like when it last stopped.
#[derive(Debug, Clone)]
pub struct StopState {
    pub reason: StopReason,
    pub location: Option<SourceLocation>,
    pub stack_trace: Vec<Frame>,
    pub locals: Vec<VariableValue>,
    pub exception: Option<i32>,
    pub exit_code: Option<i32>,
}

impl StopState {
    fn exited(code: i32) -> Self {
        StopState {
            reason: StopReason::Exit,
            location: None,
            stack_trace: vec![],
            locals: vec![],
            exception: None,
            exit_code: Some(code),
        }
    }

    fn killed(signal: i32) -> Self {
        StopState {
            reason: StopReason::Exit,
            location: None,
            stack_trace: vec![],
            locals: vec![],
            exception: Some(signal),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    Continue,
    StepInto,
    StepOver,
    StepOut,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepGranularity {
    Statement,
    Instruction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointInfo {
    pub id: u32,
    pub verified: bool,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stop_on_entry: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InspectRequest {
    pub expression: Option<String>,
    pub variable_ref: Option<u32>,
    pub frame_id: Option<u32>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InspectResult {
    pub result: String,
    pub type_name: String,
    pub children: Vec<VariableValue>,
}

/// The operation set a debug driver presents to the session layer.
/// Inputs and outputs are plain data; drivers answer `NotSupported` for
/// operations they do not implement.
pub trait Driver {
    fn launch(&mut self, _request: LaunchRequest) -> Result<(), Error> {
        Err(Error::NotSupported("launch"))
    }

    fn attach(&mut self, _pid: i32) -> Result<(), Error> {
        Err(Error::NotSupported("attach"))
    }

    fn run(
        &mut self,
        _action: RunAction,
        _granularity: Option<StepGranularity>,
    ) -> Result<StopState, Error> {
        Err(Error::NotSupported("run"))
    }

    fn set_breakpoint(
        &mut self,
        _file: &str,
        _line: u32,
        _condition: Option<String>,
    ) -> Result<BreakpointInfo, Error> {
        Err(Error::NotSupported("setBreakpoint"))
    }

    fn remove_breakpoint(&mut self, _id: u32) -> Result<(), Error> {
        Err(Error::NotSupported("removeBreakpoint"))
    }

    fn list_breakpoints(&self) -> Vec<BreakpointInfo> {
        vec![]
    }

    fn inspect(&mut self, _request: InspectRequest) -> Result<InspectResult, Error> {
        Err(Error::NotSupported("inspect"))
    }

    fn stop(&mut self) -> Result<(), Error> {
        Err(Error::NotSupported("stop"))
    }

    fn read_memory(&self, _addr: u64, _size: usize) -> Result<Vec<u8>, Error> {
        Err(Error::NotSupported("readMemory"))
    }

    fn write_memory(&mut self, _addr: u64, _data: &[u8]) -> Result<(), Error> {
        Err(Error::NotSupported("writeMemory"))
    }

    fn stack_trace(
        &self,
        _thread_id: u32,
        _start: usize,
        _levels: usize,
    ) -> Result<Vec<Frame>, Error> {
        Err(Error::NotSupported("stackTrace"))
    }
}

/// Read ends of the debugee output pipes.
pub struct DebugeeOutput {
    pub stdout: os_pipe::PipeReader,
    pub stderr: os_pipe::PipeReader,
}

/// Native DWARF-driven debugger engine.
///
/// Owns the debugee process, the loaded binary, the parsed debug information
/// and the breakpoint list. Single-threaded: `run` blocks until the debugee
/// stops or exits.
#[derive(Default)]
pub struct Debugger {
    request: LaunchRequest,
    process: Option<DebugeeControl>,
    debug_info: Option<DebugInformation>,
    /// Runtime text base minus the link-time base, fixed right after launch.
    slide: u64,
    breakpoints: BreakpointRegistry,
    condition_evaluator: Option<Box<ConditionEvaluator>>,
    output: Option<DebugeeOutput>,
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            request: Default::default(),
            process: Default::default(),
            debug_info: Default::default(),
            slide: Default::default(),
            breakpoints: BreakpointRegistry::new(),
            condition_evaluator: Default::default(),
            output: Default::default(),
        }
    }

    /// Install the condition hook consulted on conditional breakpoint hits.
    /// Condition strings are opaque to the engine.
    pub fn set_condition_evaluator(&mut self, evaluator: Box<ConditionEvaluator>) {
        self.condition_evaluator = Some(evaluator);
    }

    /// Take the debugee stdout/stderr readers (filled on spawn).
    pub fn take_output(&mut self) -> Option<DebugeeOutput> {
        self.output.take()
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.breakpoints
    }

    fn process(&self) -> Result<&DebugeeControl, Error> {
        self.process.as_ref().ok_or(Error::NoProcess)
    }

    fn debug_info(&self) -> Result<&DebugInformation, Error> {
        self.debug_info.as_ref().ok_or(Error::NoDebugInformation("binary"))
    }

    fn spawn_process(&mut self) -> Result<(), Error> {
        let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
        let (stderr_reader, stderr_writer) = os_pipe::pipe()?;

        let process = DebugeeControl::spawn(
            &self.request.program,
            &self.request.args,
            &self.request.env,
            self.request.cwd.as_deref(),
            stdout_writer,
            stderr_writer,
        )?;
        self.process = Some(process);
        self.output = Some(DebugeeOutput {
            stdout: stdout_reader,
            stderr: stderr_reader,
        });
        Ok(())
    }

    /// Load the binary (with dSYM fallback), parse its debug sections and
    /// reconcile the ASLR slide against the live process.
    fn load_debug_info(&mut self) -> Result<(), Error> {
        let binary = Binary::load_with_dsym(&self.request.program)?;
        let mut debug_info = DebugInformation::from_binary(&binary);
        if !debug_info.has_line_info() {
            log::warn!(
                target: "debugger",
                "{} carries no line-number program; breakpoints will stay unverified",
                self.request.program.display()
            );
        }

        let slide = match self.process()?.text_base() {
            Ok(runtime_base) => runtime_base.as_u64().wrapping_sub(binary.text_vaddr()),
            Err(e) => {
                log::warn!(target: "debugger", "text base query failed: {e}; assuming zero slide");
                0
            }
        };
        debug_info.apply_slide(slide);

        self.slide = slide;
        self.debug_info = Some(debug_info);
        Ok(())
    }

    /// Step-past-breakpoint protocol: restore the original byte, single-step,
    /// re-arm. Non-interruptible with respect to any other trap dispatch.
    /// Returns an exit state when the debugee dies on the step.
    fn step_over_breakpoint(&self) -> Result<Option<StopState>, Error> {
        let process = self.process()?;
        let pc = RelocatedAddress::from(process.read_registers()?.pc());

        if let Some(brkpt) = self.breakpoints.find_by_address(pc) {
            if brkpt.is_enabled() {
                brkpt.disable(process)?;
                process.single_step()?;
                match process.wait_for_stop()? {
                    StopStatus::Exited(code) => return Ok(Some(StopState::exited(code))),
                    StopStatus::Signaled(signal) => {
                        return Ok(Some(StopState::killed(signal)))
                    }
                    _ => {}
                }
                brkpt.enable(process)?;
            }
        }
        Ok(None)
    }

    /// Resume the debugee and dispatch its next stop.
    ///
    /// `temps` are stepping traps owned by the caller: hits on them rewind
    /// the pc like breakpoint hits but report as a step stop.
    fn continue_and_wait(&mut self, temps: &[Breakpoint]) -> Result<StopState, Error> {
        if let Some(exit) = self.step_over_breakpoint()? {
            self.process = None;
            return Ok(exit);
        }
        self.process()?.continue_execution()?;

        loop {
            let status = self.process()?.wait_for_stop()?;
            match status {
                StopStatus::Exited(code) => {
                    self.process = None;
                    return Ok(StopState::exited(code));
                }
                StopStatus::Signaled(signal) => {
                    self.process = None;
                    return Ok(StopState::killed(signal));
                }
                StopStatus::Stopped(signal) if signal == Signal::SIGTRAP as i32 => {
                    if let Some(state) = self.dispatch_trap(temps)? {
                        return Ok(state);
                    }
                    // Condition evaluated false: the hit is silent.
                }
                StopStatus::Stopped(signal) => {
                    let regs = self.process()?.read_registers()?;
                    let mut state = self.build_stop_state(StopReason::Exception, &regs);
                    state.exception = Some(signal);
                    return Ok(state);
                }
                StopStatus::Unknown(raw) => {
                    log::debug!(target: "debugger", "unknown wait status {raw:#x}, resuming");
                    self.process()?.continue_execution()?;
                }
            }
        }
    }

    /// Handle a trap stop. Returns `None` when execution should silently
    /// resume (conditional breakpoint whose condition is false).
    fn dispatch_trap(&mut self, temps: &[Breakpoint]) -> Result<Option<StopState>, Error> {
        let process = self.process()?;
        let mut regs = process.read_registers()?;
        let trap_addr = RelocatedAddress::from(regs.pc().wrapping_sub(TRAP_PC_OFFSET));

        if let Some(brkpt) = self.breakpoints.find_by_address(trap_addr) {
            if brkpt.is_enabled() {
                // The trap instruction has executed on x86; put the pc back on
                // the original instruction before anything else observes it.
                if TRAP_PC_OFFSET != 0 {
                    regs.set_pc(trap_addr.as_u64());
                    process.write_registers(regs)?;
                }
                brkpt.record_hit();

                let stop =
                    BreakpointRegistry::should_stop(brkpt, self.condition_evaluator.as_deref())?;
                if !stop {
                    if let Some(exit) = self.step_over_breakpoint()? {
                        self.process = None;
                        return Ok(Some(exit));
                    }
                    self.process()?.continue_execution()?;
                    return Ok(None);
                }

                let state = self.build_stop_state(StopReason::Breakpoint, &regs);
                return Ok(Some(state));
            }
        }

        if temps.iter().any(|temp| temp.addr == trap_addr && temp.is_enabled()) {
            if TRAP_PC_OFFSET != 0 {
                regs.set_pc(trap_addr.as_u64());
                process.write_registers(regs)?;
            }
            return Ok(Some(self.build_stop_state(StopReason::Step, &regs)));
        }

        // Trap not caused by one of ours: a completed hardware single-step
        // or a trap raised by the debugee itself.
        Ok(Some(self.build_stop_state(StopReason::Step, &regs)))
    }

    fn build_stop_state(&self, reason: StopReason, regs: &RegisterMap) -> StopState {
        let pc = RelocatedAddress::from(regs.pc());

        let mut state = StopState {
            reason,
            location: None,
            stack_trace: vec![],
            locals: vec![],
            exception: None,
            exit_code: None,
        };

        let Ok(process) = self.process() else {
            return state;
        };
        let Some(debug_info) = self.debug_info.as_ref() else {
            return state;
        };

        state.location = debug_info.find_place_from_pc(pc).map(|place| SourceLocation {
            file: place.file.to_string(),
            line: place.line,
            column: place.column,
            function: debug_info
                .find_function_by_pc(pc.into_global(self.slide))
                .map(|function| unwind::demangled(&function.name)),
        });
        state.stack_trace =
            unwind::unwind_stack(process, debug_info, self.slide, pc, regs.fp());
        state.locals = self.read_locals(regs);
        state
    }

    /// Evaluate the location of every variable visible at the stop position
    /// and render the raw bytes with its base type.
    fn read_locals(&self, regs: &RegisterMap) -> Vec<VariableValue> {
        let Ok(process) = self.process() else {
            return vec![];
        };
        let Some(debug_info) = self.debug_info.as_ref() else {
            return vec![];
        };

        let global_pc = RelocatedAddress::from(regs.pc()).into_global(self.slide);
        let dwarf_regs = DwarfRegisterMap::from(*regs);
        let frame_base = self.frame_base(global_pc, &dwarf_regs, regs);

        debug_info
            .visible_variables(global_pc)
            .into_iter()
            .map(|var| {
                let value = self.read_variable_value(var, &dwarf_regs, frame_base, process);
                VariableValue {
                    name: var.name.clone(),
                    value,
                    type_name: var.type_name.clone(),
                }
            })
            .collect()
    }

    /// Evaluate `DW_AT_frame_base` of the enclosing function. The common
    /// `DW_OP_call_frame_cfa` form has no CFI interpreter behind it here, so
    /// it degrades to the frame-pointer CFA of the standard prologue.
    fn frame_base(
        &self,
        global_pc: address::GlobalAddress,
        dwarf_regs: &DwarfRegisterMap,
        regs: &RegisterMap,
    ) -> u64 {
        let fallback = regs.fp().wrapping_add(16);
        let Some(debug_info) = self.debug_info.as_ref() else {
            return fallback;
        };
        let Some(function) = debug_info.find_function_by_pc(global_pc) else {
            return fallback;
        };
        let Some(expr) = function.frame_base.as_ref() else {
            return fallback;
        };

        let evaluator = ExpressionEvaluator::new(dwarf_regs);
        match evaluator.evaluate(expr) {
            EvalResult::Address(addr) => addr,
            EvalResult::Value(value) => value,
            EvalResult::Register(number) => {
                dwarf_regs.value(number).unwrap_or(fallback)
            }
            EvalResult::Empty => fallback,
        }
    }

    fn read_variable_value(
        &self,
        var: &VariableInfo,
        dwarf_regs: &DwarfRegisterMap,
        frame_base: u64,
        process: &DebugeeControl,
    ) -> String {
        if var.location.is_empty() {
            return "<optimized out>".to_string();
        }

        let memory = WordReader(process);
        let evaluator = ExpressionEvaluator::new(dwarf_regs)
            .with_frame_base(frame_base)
            .with_memory(&memory);

        let byte_size = var.type_byte_size.clamp(1, 8) as usize;
        let raw = match evaluator.evaluate(&var.location) {
            EvalResult::Address(addr) => {
                let Some(bytes) =
                    muted_error!(process.read_memory(RelocatedAddress::from(addr), byte_size))
                else {
                    return "<optimized out>".to_string();
                };
                bytes
            }
            EvalResult::Register(number) => match dwarf_regs.value(number) {
                Ok(value) => value.to_le_bytes()[..byte_size].to_vec(),
                Err(_) => return "<optimized out>".to_string(),
            },
            EvalResult::Value(value) => value.to_le_bytes()[..byte_size].to_vec(),
            EvalResult::Empty => return "<optimized out>".to_string(),
        };

        variable::render_scalar(&raw, var.type_encoding, var.type_byte_size)
    }

    fn current_registers(&self) -> Result<RegisterMap, Error> {
        self.process()?.read_registers()
    }

    /// Read a named register of the stopped debugee.
    pub fn read_register(&self, name: &str) -> Result<u64, Error> {
        let register = register::register_from_name(name)?;
        Ok(self.current_registers()?.value(register))
    }

    /// Overwrite a named register of the stopped debugee.
    pub fn write_register(&self, name: &str, value: u64) -> Result<(), Error> {
        let register = register::register_from_name(name)?;
        let mut regs = self.current_registers()?;
        regs.update(register, value);
        self.process()?.write_registers(regs)
    }

    /// Resolve a function name to the address of its first statement row.
    pub fn function_address(&self, name: &str) -> Result<RelocatedAddress, Error> {
        let debug_info = self.debug_info()?;
        let function = debug_info
            .find_function_by_name(name)
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;
        let low_pc = address::GlobalAddress::from(function.low_pc).relocate(self.slide);
        let entry = debug_info
            .line_table()
            .resolve(low_pc.as_u64())
            .map(|row| RelocatedAddress::from(row.address))
            .unwrap_or(low_pc);
        Ok(entry)
    }

    fn step_instruction(&mut self) -> Result<StopState, Error> {
        let pc = RelocatedAddress::from(self.current_registers()?.pc());
        let on_armed_trap = self
            .breakpoints
            .find_by_address(pc)
            .map(Breakpoint::is_enabled)
            .unwrap_or(false);

        if on_armed_trap {
            // The step-past protocol advances exactly one instruction.
            if let Some(exit) = self.step_over_breakpoint()? {
                self.process = None;
                return Ok(exit);
            }
        } else {
            let process = self.process()?;
            process.single_step()?;
            match process.wait_for_stop()? {
                StopStatus::Exited(code) => {
                    self.process = None;
                    return Ok(StopState::exited(code));
                }
                StopStatus::Signaled(signal) => {
                    self.process = None;
                    return Ok(StopState::killed(signal));
                }
                _ => {}
            }
        }

        let regs = self.current_registers()?;
        Ok(self.build_stop_state(StopReason::Step, &regs))
    }

    /// Source-level step: single-step instructions until the line changes.
    fn step_into(&mut self) -> Result<StopState, Error> {
        let start_place = self.current_place()?;

        loop {
            let state = self.step_instruction()?;
            if state.reason == StopReason::Exit {
                return Ok(state);
            }
            match (&start_place, self.current_place()?) {
                (Some(start), Some(current)) if *start == current => continue,
                _ => return Ok(state),
            }
        }
    }

    fn current_place(&self) -> Result<Option<(String, u32)>, Error> {
        let pc = RelocatedAddress::from(self.current_registers()?.pc());
        Ok(self
            .debug_info()?
            .find_place_from_pc(pc)
            .map(|place| (place.file.to_string(), place.line)))
    }

    /// Step to the next statement of the enclosing function without entering
    /// calls: temporary traps on every other statement row of the function
    /// plus the return address.
    fn step_over(&mut self) -> Result<StopState, Error> {
        let regs = self.current_registers()?;
        let pc = RelocatedAddress::from(regs.pc());
        let global_pc = pc.into_global(self.slide);

        let debug_info = self.debug_info()?;
        let function = debug_info
            .find_function_by_pc(global_pc)
            .ok_or(Error::PlaceNotFound(global_pc))?;
        let (low, high) = (
            function.low_pc,
            function.high_pc.unwrap_or(function.low_pc),
        );
        let current_line_addr = debug_info.find_place_from_pc(pc).map(|place| place.address);

        let mut temps = vec![];
        for entry in debug_info.line_table().entries() {
            if !entry.is_stmt || entry.end_sequence {
                continue;
            }
            let global_row = RelocatedAddress::from(entry.address).into_global(self.slide);
            if !global_row.in_range(low, high) {
                continue;
            }
            if Some(entry.address) == current_line_addr {
                continue;
            }
            let addr = RelocatedAddress::from(entry.address);
            if self.breakpoints.find_by_address(addr).is_some() {
                continue;
            }
            temps.push(Breakpoint::temporary(addr));
        }

        // Trap the caller side too: the next line may be outside the function.
        let backtrace =
            unwind::unwind_stack(self.process()?, debug_info, self.slide, pc, regs.fp());
        if let Some(return_frame) = backtrace.get(1) {
            if self.breakpoints.find_by_address(return_frame.address).is_none() {
                temps.push(Breakpoint::temporary(return_frame.address));
            }
        }

        for temp in &temps {
            weak_error!(temp.enable(self.process()?));
        }
        let state = self.continue_and_wait(&temps);
        if let Ok(process) = self.process() {
            for temp in &temps {
                weak_error!(temp.disable(process));
            }
        }
        state
    }

    /// Run until the current function returns.
    fn step_out(&mut self) -> Result<StopState, Error> {
        let regs = self.current_registers()?;
        let pc = RelocatedAddress::from(regs.pc());
        let backtrace =
            unwind::unwind_stack(self.process()?, self.debug_info()?, self.slide, pc, regs.fp());

        let Some(return_frame) = backtrace.get(1) else {
            // Nothing to return to; behave like a plain continue.
            return self.continue_and_wait(&[]);
        };

        if self.breakpoints.find_by_address(return_frame.address).is_some() {
            return self.continue_and_wait(&[]);
        }

        let temp = Breakpoint::temporary(return_frame.address);
        temp.enable(self.process()?)?;
        let temps = [temp];
        let state = self.continue_and_wait(&temps);
        if let Ok(process) = self.process() {
            weak_error!(temps[0].disable(process));
        }
        state
    }

    /// Kill and respawn the debugee, reload debug information, recompute the
    /// slide and re-arm every breakpoint in id order against the new image.
    fn restart(&mut self) -> Result<StopState, Error> {
        if let Some(process) = self.process.take() {
            weak_error!(process.kill());
        }

        let old_slide = self.slide;
        self.spawn_process()?;
        self.load_debug_info()?;

        let delta = self.slide.wrapping_sub(old_slide);
        self.breakpoints.relocate_all(delta);

        let process = self.process()?;
        for brkpt in self.breakpoints.list() {
            brkpt.reset();
            if brkpt.verified {
                // Original bytes are re-read from the fresh image by enable.
                weak_error!(brkpt.enable(process), "re-arm breakpoint:");
            }
        }

        self.continue_and_wait(&[])
    }
}

impl Driver for Debugger {
    fn launch(&mut self, request: LaunchRequest) -> Result<(), Error> {
        if self.process.is_some() {
            return Err(Error::AlreadyRun);
        }
        self.request = request;
        self.spawn_process()?;
        self.load_debug_info()?;
        Ok(())
    }

    fn attach(&mut self, pid: i32) -> Result<(), Error> {
        if self.process.is_some() {
            return Err(Error::AlreadyRun);
        }
        let process = DebugeeControl::attach(Pid::from_raw(pid))?;
        self.request = LaunchRequest {
            program: process.program().to_path_buf(),
            ..Default::default()
        };
        self.process = Some(process);
        self.load_debug_info()?;
        Ok(())
    }

    fn run(
        &mut self,
        action: RunAction,
        granularity: Option<StepGranularity>,
    ) -> Result<StopState, Error> {
        if self.process.is_none() && action != RunAction::Restart {
            return Err(Error::NoProcess);
        }

        match action {
            RunAction::Continue => self.continue_and_wait(&[]),
            RunAction::StepInto => match granularity.unwrap_or(StepGranularity::Statement) {
                StepGranularity::Statement => self.step_into(),
                StepGranularity::Instruction => self.step_instruction(),
            },
            RunAction::StepOver => self.step_over(),
            RunAction::StepOut => self.step_out(),
            RunAction::Restart => self.restart(),
        }
    }

    /// Bind a source position to a trap. When no line info is available the
    /// request is recorded unverified and no trap is written.
    fn set_breakpoint(
        &mut self,
        file: &str,
        line: u32,
        condition: Option<String>,
    ) -> Result<BreakpointInfo, Error> {
        let has_line_info = self
            .debug_info
            .as_ref()
            .map(DebugInformation::has_line_info)
            .unwrap_or(false);
        if !has_line_info {
            let brkpt = self.breakpoints.add_unverified(file.to_string(), line);
            return Ok(BreakpointInfo {
                id: brkpt.number,
                verified: false,
                file: brkpt.file.clone(),
                line: brkpt.line,
            });
        }

        let debug_info = self.debug_info()?;
        let (addr, resolved_line) =
            BreakpointRegistry::resolve_address(debug_info.line_table(), file, line)?;

        let brkpt = self.breakpoints.add(
            addr,
            Some(file.to_string()),
            Some(resolved_line),
            condition,
        );
        let info = BreakpointInfo {
            id: brkpt.number,
            verified: true,
            file: brkpt.file.clone(),
            line: brkpt.line,
        };

        if let Some(process) = self.process.as_ref() {
            if let Err(e) = brkpt.enable(process) {
                // Trap write failed: the just-added entry is rolled back.
                self.breakpoints.remove_last();
                return Err(e);
            }
        }
        Ok(info)
    }

    fn remove_breakpoint(&mut self, id: u32) -> Result<(), Error> {
        let brkpt = self.breakpoints.remove(id)?;
        if let Some(process) = self.process.as_ref() {
            brkpt.disable(process)?;
        }
        Ok(())
    }

    fn list_breakpoints(&self) -> Vec<BreakpointInfo> {
        self.breakpoints
            .list()
            .iter()
            .map(|brkpt| BreakpointInfo {
                id: brkpt.number,
                verified: brkpt.verified,
                file: brkpt.file.clone(),
                line: brkpt.line,
            })
            .collect()
    }

    fn inspect(&mut self, request: InspectRequest) -> Result<InspectResult, Error> {
        if request.variable_ref.is_some() {
            return Err(Error::NotSupported("inspect by variable reference"));
        }
        if request.frame_id.map(|frame| frame != 0).unwrap_or(false) {
            // Locals of outer frames need per-frame register recovery.
            return Err(Error::NotSupported("inspect in outer frames"));
        }

        let regs = self.current_registers()?;
        let locals = self.read_locals(&regs);

        match request.expression {
            None => Ok(InspectResult {
                result: String::new(),
                type_name: String::new(),
                children: locals,
            }),
            Some(expression) => {
                let is_identifier = !expression.is_empty()
                    && expression
                        .chars()
                        .all(|ch| ch.is_alphanumeric() || ch == '_');
                if !is_identifier {
                    return Err(Error::NotSupported("complex inspect expressions"));
                }

                let variable = locals
                    .into_iter()
                    .find(|var| var.name == expression)
                    .ok_or_else(|| Error::VariableNotFound(expression.clone()))?;
                Ok(InspectResult {
                    result: variable.value.clone(),
                    type_name: variable.type_name.clone(),
                    children: vec![],
                })
            }
        }
    }

    /// Kill the debugee and reap it. Not an error if nothing is running.
    fn stop(&mut self) -> Result<(), Error> {
        if let Some(process) = self.process.take() {
            process.kill()?;
        }
        Ok(())
    }

    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>, Error> {
        self.process()?.read_memory(RelocatedAddress::from(addr), size)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        self.process()?.write_memory(RelocatedAddress::from(addr), data)
    }

    /// Only the primary thread is inspected; `thread_id` is accepted for
    /// contract compatibility.
    fn stack_trace(
        &self,
        _thread_id: u32,
        start: usize,
        levels: usize,
    ) -> Result<Vec<Frame>, Error> {
        let regs = self.current_registers()?;
        let backtrace = unwind::unwind_stack(
            self.process()?,
            self.debug_info()?,
            self.slide,
            RelocatedAddress::from(regs.pc()),
            regs.fp(),
        );

        let levels = if levels == 0 { backtrace.len() } else { levels };
        Ok(backtrace
            .into_iter()
            .skip(start)
            .take(levels)
            .collect())
    }
}

impl Drop for Debugger {
    /// Engine teardown restores original bytes when the debugee survives
    /// (attached processes are detached, spawned ones are killed).
    fn drop(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };

        for brkpt in self.breakpoints.list() {
            muted_error!(brkpt.disable(&process));
        }

        if process.is_external() {
            muted_error!(process.detach());
        } else {
            muted_error!(process.kill());
        }
    }
}

/// `DW_OP_deref` memory provider over the live process.
struct WordReader<'a>(&'a DebugeeControl);

impl MemoryProvider for WordReader<'_> {
    fn read_word(&self, addr: u64) -> Option<u64> {
        muted_error!(self.0.read_u64(RelocatedAddress::from(addr)))
    }
}
