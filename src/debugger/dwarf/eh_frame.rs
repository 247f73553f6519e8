use crate::debugger::dwarf::reader::SectionReader;
use crate::debugger::dwarf::ParseError;
use bytes::Bytes;
use std::collections::HashMap;

// DW_EH_PE pointer encodings (value format low nibble, application high nibble).
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_ULEB128: u8 = 0x01;
const DW_EH_PE_UDATA2: u8 = 0x02;
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_UDATA8: u8 = 0x04;
const DW_EH_PE_SLEB128: u8 = 0x09;
const DW_EH_PE_SDATA2: u8 = 0x0a;
const DW_EH_PE_SDATA4: u8 = 0x0b;
const DW_EH_PE_SDATA8: u8 = 0x0c;
const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_OMIT: u8 = 0xff;

/// Bounds of one frame-description entry. Call-frame instructions are kept
/// as raw bytes; interpreting them is out of this module's hands.
#[derive(Debug, Clone)]
pub struct FdeRecord {
    pub initial_location: u64,
    pub address_range: u64,
    pub instructions: Bytes,
}

impl FdeRecord {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.initial_location && pc < self.initial_location + self.address_range
    }
}

struct CieInfo {
    fde_pointer_encoding: u8,
    has_augmentation_data: bool,
}

/// Scan `.eh_frame` and collect the FDE list.
///
/// `section_vaddr` is the virtual address the section is linked at; it anchors
/// pc-relative pointer encodings. A CIE is recognized by a zero CIE-pointer
/// field. Records that fail to decode are skipped.
pub fn parse_eh_frame(section: &Bytes, section_vaddr: u64) -> Vec<FdeRecord> {
    let mut fdes = vec![];
    let mut cies: HashMap<u64, CieInfo> = HashMap::new();

    let data = &section[..];
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        match parse_record(section, data, offset, section_vaddr, &mut cies, &mut fdes) {
            Ok(Some(next)) if next > offset => offset = next,
            Ok(_) => break,
            Err(e) => {
                log::debug!(target: "debugger", "eh_frame record at {offset:#x}: {e}");
                break;
            }
        }
    }

    fdes
}

fn parse_record(
    section: &Bytes,
    data: &[u8],
    offset: usize,
    section_vaddr: u64,
    cies: &mut HashMap<u64, CieInfo>,
    fdes: &mut Vec<FdeRecord>,
) -> Result<Option<usize>, ParseError> {
    let mut reader = SectionReader::with_offset(data, offset)?;
    let (length, _dwarf64) = {
        let len = reader.read_u32()?;
        if len == 0 {
            // Zero-length terminator record.
            return Ok(None);
        }
        if len == 0xffff_ffff {
            (reader.read_u64()?, true)
        } else {
            (len as u64, false)
        }
    };

    let entry_end = reader.pos() + length as usize;
    if entry_end > data.len() {
        return Err(ParseError::UnexpectedEndOfData);
    }

    let id_field_pos = reader.pos() as u64;
    let cie_pointer = reader.read_u32()?;

    if cie_pointer == 0 {
        // CIE: only the FDE pointer encoding matters for the bounds scan.
        let _version = reader.read_u8()?;
        let augmentation = reader.read_cstr()?.to_string();
        let _code_alignment = reader.read_uleb128()?;
        let _data_alignment = reader.read_sleb128()?;
        let _return_address_register = reader.read_uleb128()?;

        let mut fde_pointer_encoding = DW_EH_PE_ABSPTR;
        let has_augmentation_data = augmentation.starts_with('z');
        if has_augmentation_data {
            let aug_len = reader.read_uleb128()? as usize;
            let aug_end = reader.pos() + aug_len;
            for ch in augmentation.chars().skip(1) {
                match ch {
                    'R' => fde_pointer_encoding = reader.read_u8()?,
                    'L' => {
                        let _lsda_encoding = reader.read_u8()?;
                    }
                    'P' => {
                        let encoding = reader.read_u8()?;
                        read_encoded(&mut reader, encoding, section_vaddr)?;
                    }
                    _ => break,
                }
            }
            if aug_end >= reader.pos() && aug_end <= data.len() {
                reader.skip(aug_end - reader.pos())?;
            }
        }

        cies.insert(
            offset as u64,
            CieInfo {
                fde_pointer_encoding,
                has_augmentation_data,
            },
        );
        return Ok(Some(entry_end));
    }

    // FDE: the CIE pointer is the distance back from its own field.
    let cie_offset = id_field_pos.wrapping_sub(cie_pointer as u64);
    let Some(cie) = cies.get(&cie_offset) else {
        log::debug!(target: "debugger", "fde at {offset:#x} references unknown cie {cie_offset:#x}");
        return Ok(Some(entry_end));
    };

    let encoding = cie.fde_pointer_encoding;
    if encoding == DW_EH_PE_OMIT {
        return Ok(Some(entry_end));
    }

    let initial_location = read_encoded(&mut reader, encoding, section_vaddr)?;
    // The range uses the value format of the encoding without pc adjustment.
    let address_range = read_encoded(&mut reader, encoding & 0x0f, section_vaddr)?;

    if cie.has_augmentation_data {
        let aug_len = reader.read_uleb128()? as usize;
        reader.skip(aug_len)?;
    }

    let instructions = section.slice(reader.pos()..entry_end);
    fdes.push(FdeRecord {
        initial_location,
        address_range,
        instructions,
    });

    Ok(Some(entry_end))
}

fn read_encoded(
    reader: &mut SectionReader,
    encoding: u8,
    section_vaddr: u64,
) -> Result<u64, ParseError> {
    let field_vaddr = section_vaddr + reader.pos() as u64;
    let value = match encoding & 0x0f {
        DW_EH_PE_ABSPTR => reader.read_u64()?,
        DW_EH_PE_ULEB128 => reader.read_uleb128()?,
        DW_EH_PE_UDATA2 => reader.read_u16()? as u64,
        DW_EH_PE_UDATA4 => reader.read_u32()? as u64,
        DW_EH_PE_UDATA8 => reader.read_u64()?,
        DW_EH_PE_SLEB128 => reader.read_sleb128()? as u64,
        DW_EH_PE_SDATA2 => reader.read_u16()? as i16 as u64,
        DW_EH_PE_SDATA4 => reader.read_u32()? as i32 as u64,
        DW_EH_PE_SDATA8 => reader.read_u64()?,
        other => return Err(ParseError::UnknownPointerEncoding(other)),
    };

    match encoding & 0x70 {
        0 => Ok(value),
        DW_EH_PE_PCREL => Ok(field_vaddr.wrapping_add(value)),
        other => Err(ParseError::UnknownPointerEncoding(other)),
    }
}

/// Find the FDE whose range covers `pc`.
pub fn find_fde(fdes: &[FdeRecord], pc: u64) -> Option<&FdeRecord> {
    fdes.iter().find(|fde| fde.contains(pc))
}
