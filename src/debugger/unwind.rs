use crate::debugger::address::RelocatedAddress;
use crate::debugger::dwarf::eh_frame;
use crate::debugger::dwarf::DebugInformation;
use crate::debugger::process::TraceeMemory;
use crate::muted_error;

/// Hard cap on the frame-pointer walk; a corrupt chain must not spin forever.
pub const MAX_DEPTH: usize = 128;

/// One frame of an unwound call stack, innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_index: u32,
    pub address: RelocatedAddress,
    pub function_name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Runtime the frame belongs to; spliced foreign frames carry their own.
    pub language: String,
    pub is_boundary: bool,
}

impl Frame {
    fn native(index: u32, address: RelocatedAddress) -> Self {
        Frame {
            frame_index: index,
            address,
            function_name: None,
            file: None,
            line: None,
            language: "native".to_string(),
            is_boundary: false,
        }
    }
}

/// Walk saved frame pointers starting at `(pc, fp)`.
///
/// Requires the target to preserve frame pointers: the word at `[fp]` is the
/// caller's fp and `[fp + 8]` the return address. The walk stops at `main` /
/// `_start`, on a zero link, or when the chain stops growing upward.
pub fn unwind_stack(
    memory: &dyn TraceeMemory,
    debug_info: &DebugInformation,
    slide: u64,
    pc: RelocatedAddress,
    fp: u64,
) -> Vec<Frame> {
    let mut backtrace = vec![];
    let mut pc = pc;
    let mut fp = fp;

    while backtrace.len() < MAX_DEPTH {
        let frame = attribute_frame(debug_info, slide, backtrace.len() as u32, pc);
        let in_entry_function = frame
            .function_name
            .as_deref()
            .map(is_entry_function)
            .unwrap_or(false);
        backtrace.push(frame);

        if in_entry_function {
            break;
        }

        let Some(saved_fp) = muted_error!(memory.read_u64(RelocatedAddress::from(fp))) else {
            break;
        };
        let Some(return_addr) = muted_error!(memory.read_u64(RelocatedAddress::from(fp + 8)))
        else {
            break;
        };
        // A zero link or a frame that does not grow upward means the chain
        // is finished or corrupt.
        if saved_fp == 0 || return_addr == 0 || saved_fp <= fp {
            break;
        }
        // A return address outside every known function range is a corrupt
        // chain as well; the FDE bounds cover ranges with no subprogram DIE.
        if !is_known_code(debug_info, slide, RelocatedAddress::from(return_addr)) {
            break;
        }

        pc = RelocatedAddress::from(return_addr);
        fp = saved_fp;
    }

    backtrace
}

fn is_known_code(debug_info: &DebugInformation, slide: u64, pc: RelocatedAddress) -> bool {
    let global_pc = pc.into_global(slide);
    if debug_info.find_function_by_pc(global_pc).is_some() {
        return true;
    }
    if eh_frame::find_fde(debug_info.fdes(), global_pc.as_u64()).is_some() {
        return true;
    }
    // A stripped image gives nothing to validate against; let the
    // frame-pointer invariants bound the walk on their own.
    !debug_info.has_functions() && debug_info.fdes().is_empty()
}

fn is_entry_function(name: &str) -> bool {
    name == "main" || name.ends_with("::main") || name == "_start"
}

/// Tag a pc with function, file and line. Function names come from the
/// subprogram list, falling back to `.eh_frame` bounds for stripped ranges.
fn attribute_frame(
    debug_info: &DebugInformation,
    slide: u64,
    index: u32,
    pc: RelocatedAddress,
) -> Frame {
    let mut frame = Frame::native(index, pc);

    let global_pc = pc.into_global(slide);
    if let Some(function) = debug_info.find_function_by_pc(global_pc) {
        frame.function_name = Some(demangled(&function.name));
    }

    if let Some(place) = debug_info.find_place_from_pc(pc) {
        frame.file = Some(place.file.to_string());
        frame.line = Some(place.line);
    }

    frame
}

pub(crate) fn demangled(name: &str) -> String {
    format!("{:#}", rustc_demangle::demangle(name))
}

/// Splice foreign-runtime frames into a native backtrace.
///
/// Frames whose function name carries one of the boundary markers are tagged
/// and handed to the resolver; the sub-frames it returns are inserted before
/// the boundary frame (callee side). Frame indexes are rebuilt afterwards.
pub fn merge_stacks(
    native: Vec<Frame>,
    boundary_markers: &[&str],
    resolver: &dyn Fn(&Frame) -> Option<Vec<Frame>>,
) -> Vec<Frame> {
    let mut merged = Vec::with_capacity(native.len());

    for mut frame in native {
        let is_boundary = frame
            .function_name
            .as_deref()
            .map(|name| boundary_markers.iter().any(|marker| name.contains(marker)))
            .unwrap_or(false);

        if is_boundary {
            frame.is_boundary = true;
            if let Some(sub_frames) = resolver(&frame) {
                merged.extend(sub_frames);
            }
        }
        merged.push(frame);
    }

    for (index, frame) in merged.iter_mut().enumerate() {
        frame.frame_index = index as u32;
    }
    merged
}
