use crate::debugger::binary::{LoadError, ObjectKind, ParsedObject, Section};
use bytes::Bytes;
use std::collections::HashMap;

pub(crate) const MH_MAGIC_64: u32 = 0xfeed_facf;
pub(crate) const MH_MAGIC_32: u32 = 0xfeed_face;

const MH_EXECUTE: u32 = 0x2;
const MH_CORE: u32 = 0x4;
const MH_DYLIB: u32 = 0x6;

const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x8000_0028;

const MACH_HEADER_SIZE: usize = 32;
const SEGMENT_COMMAND_SIZE: usize = 72;
const SECTION_SIZE: usize = 80;

/// Mach-O section names are 16 bytes and get truncated, hence the
/// `__debug_str_offs` and `__debug_line_st` spellings.
fn canonical_name(raw: &str) -> Option<&'static str> {
    match raw {
        "__debug_info" => Some(".debug_info"),
        "__debug_abbrev" => Some(".debug_abbrev"),
        "__debug_line" => Some(".debug_line"),
        "__debug_str" => Some(".debug_str"),
        "__debug_str_offs" => Some(".debug_str_offsets"),
        "__debug_addr" => Some(".debug_addr"),
        "__debug_ranges" => Some(".debug_ranges"),
        "__debug_aranges" => Some(".debug_aranges"),
        "__debug_line_st" => Some(".debug_line_str"),
        "__eh_frame" => Some(".eh_frame"),
        _ => None,
    }
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn u64_at(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn fixed_str(data: &[u8]) -> &str {
    let nul = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..nul]).unwrap_or("")
}

/// Parse a 64-bit Mach-O image: walk the load commands and collect the
/// `__debug_*` sections of every `LC_SEGMENT_64`.
pub(crate) fn parse(data: &Bytes) -> Result<ParsedObject, LoadError> {
    if data.len() < MACH_HEADER_SIZE {
        return Err(LoadError::TooSmall);
    }

    let filetype = u32_at(data, 12);
    let ncmds = u32_at(data, 16) as usize;

    let mut sections = HashMap::new();
    let mut text_vaddr = 0u64;
    let mut entry = 0u64;

    let mut cmd_offset = MACH_HEADER_SIZE;
    for _ in 0..ncmds {
        if cmd_offset + 8 > data.len() {
            return Err(LoadError::IncompleteRead);
        }
        let cmd = u32_at(data, cmd_offset);
        let cmdsize = u32_at(data, cmd_offset + 4) as usize;
        if cmdsize < 8 || cmd_offset + cmdsize > data.len() {
            return Err(LoadError::IncompleteRead);
        }

        match cmd {
            LC_SEGMENT_64 if cmdsize >= SEGMENT_COMMAND_SIZE => {
                let segname = fixed_str(&data[cmd_offset + 8..cmd_offset + 24]);
                let vmaddr = u64_at(data, cmd_offset + 24);
                let nsects = u32_at(data, cmd_offset + 64) as usize;

                if segname == "__TEXT" {
                    text_vaddr = vmaddr;
                }

                let mut sect_offset = cmd_offset + SEGMENT_COMMAND_SIZE;
                for _ in 0..nsects {
                    if sect_offset + SECTION_SIZE > cmd_offset + cmdsize {
                        return Err(LoadError::IncompleteRead);
                    }
                    let sectname = fixed_str(&data[sect_offset..sect_offset + 16]);
                    let addr = u64_at(data, sect_offset + 32);
                    let size = u64_at(data, sect_offset + 40) as usize;
                    let offset = u32_at(data, sect_offset + 48) as usize;

                    if let Some(canonical) = canonical_name(sectname) {
                        let end = offset.checked_add(size).ok_or(LoadError::IncompleteRead)?;
                        if end > data.len() {
                            return Err(LoadError::IncompleteRead);
                        }
                        sections.insert(
                            canonical,
                            Section {
                                data: data.slice(offset..end),
                                address: addr,
                                file_offset: offset as u64,
                            },
                        );
                    }
                    sect_offset += SECTION_SIZE;
                }
            }
            LC_MAIN if cmdsize >= 24 => {
                entry = u64_at(data, cmd_offset + 8);
            }
            _ => {}
        }

        cmd_offset += cmdsize;
    }

    let kind = match filetype {
        MH_EXECUTE => ObjectKind::Executable,
        MH_DYLIB => ObjectKind::SharedObject,
        MH_CORE => ObjectKind::CoreDump,
        _ => ObjectKind::Other,
    };

    Ok(ParsedObject {
        sections,
        text_vaddr,
        entry,
        kind,
    })
}
