use crate::debugger::binary::{canonical_name, LoadError, ObjectKind, ParsedObject, Section};
use bytes::Bytes;
use std::collections::HashMap;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const ET_CORE: u16 = 4;

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
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

/// Parse an ELF 64 little-endian image: walk the section-header table and
/// match names from the section-header string table against the known debug
/// section set.
pub(crate) fn parse(data: &Bytes) -> Result<ParsedObject, LoadError> {
    if data.len() < EHDR_SIZE {
        return Err(LoadError::TooSmall);
    }
    if data[4] != ELFCLASS64 {
        return Err(LoadError::UnsupportedFormat("32-bit elf"));
    }
    if data[5] != ELFDATA2LSB {
        return Err(LoadError::UnsupportedFormat("big-endian elf"));
    }

    let e_type = u16_at(data, 16);
    let entry = u64_at(data, 24);
    let shoff = u64_at(data, 40) as usize;
    let shentsize = u16_at(data, 58) as usize;
    let shnum = u16_at(data, 60) as usize;
    let shstrndx = u16_at(data, 62) as usize;

    let shentsize = if shentsize == 0 { SHDR_SIZE } else { shentsize };

    let section_header = |index: usize| -> Result<&[u8], LoadError> {
        let start = shoff + index * shentsize;
        let end = start + SHDR_SIZE;
        if end > data.len() {
            return Err(LoadError::IncompleteRead);
        }
        Ok(&data[start..end])
    };

    // Section names come from the string table referenced by e_shstrndx.
    let shstrtab = if shnum != 0 && shstrndx < shnum {
        let header = section_header(shstrndx)?;
        let offset = u64_at(header, 24) as usize;
        let size = u64_at(header, 32) as usize;
        let end = offset.checked_add(size).ok_or(LoadError::IncompleteRead)?;
        if end > data.len() {
            return Err(LoadError::IncompleteRead);
        }
        &data[offset..end]
    } else {
        &[][..]
    };

    let name_at = |name_offset: usize| -> Option<&str> {
        let tail = shstrtab.get(name_offset..)?;
        let nul = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..nul]).ok()
    };

    let mut sections = HashMap::new();
    let mut text_vaddr = 0;
    for index in 0..shnum {
        let header = section_header(index)?;
        let name_offset = u32_at(header, 0) as usize;
        let addr = u64_at(header, 16);
        let offset = u64_at(header, 24) as usize;
        let size = u64_at(header, 32) as usize;

        let Some(name) = name_at(name_offset) else {
            continue;
        };
        if name == ".text" {
            // Anchor at the image base (section address minus its file
            // offset) so the slide math holds for PIE and fixed layouts alike.
            text_vaddr = addr.wrapping_sub(offset as u64);
        }
        let Some(canonical) = canonical_name(name) else {
            continue;
        };

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

    let kind = match e_type {
        ET_EXEC => ObjectKind::Executable,
        ET_DYN => ObjectKind::SharedObject,
        ET_CORE => ObjectKind::CoreDump,
        _ => ObjectKind::Other,
    };

    Ok(ParsedObject {
        sections,
        text_vaddr,
        entry,
        kind,
    })
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::debugger::binary::Binary;

    /// Assemble a minimal ELF 64 image with the given named sections.
    pub(crate) fn build_elf(e_type: u16, sections: &[(&str, u64, &[u8])]) -> Vec<u8> {
        let mut strtab = vec![0u8]; // index 0 is the empty name
        let mut name_offsets = vec![];
        for (name, _, _) in sections {
            name_offsets.push(strtab.len());
            strtab.extend(name.as_bytes());
            strtab.push(0);
        }
        let shstrtab_name_offset = strtab.len();
        strtab.extend(b".shstrtab\0");

        // Layout: ehdr | section data .. | shstrtab | section headers.
        let mut image = vec![0u8; EHDR_SIZE];
        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[16..18].copy_from_slice(&e_type.to_le_bytes());
        image[24..32].copy_from_slice(&0x401000u64.to_le_bytes()); // e_entry

        let mut data_offsets = vec![];
        for (_, _, data) in sections {
            data_offsets.push(image.len());
            image.extend(*data);
        }
        let strtab_offset = image.len();
        image.extend(&strtab);

        let shoff = image.len();
        let shnum = sections.len() + 2; // null section + shstrtab
        image.extend(vec![0u8; SHDR_SIZE]); // null section header

        for (i, (_, addr, data)) in sections.iter().enumerate() {
            let mut shdr = [0u8; SHDR_SIZE];
            shdr[0..4].copy_from_slice(&(name_offsets[i] as u32).to_le_bytes());
            shdr[16..24].copy_from_slice(&addr.to_le_bytes());
            shdr[24..32].copy_from_slice(&(data_offsets[i] as u64).to_le_bytes());
            shdr[32..40].copy_from_slice(&(data.len() as u64).to_le_bytes());
            image.extend(shdr);
        }

        let mut shdr = [0u8; SHDR_SIZE];
        shdr[0..4].copy_from_slice(&(shstrtab_name_offset as u32).to_le_bytes());
        shdr[24..32].copy_from_slice(&(strtab_offset as u64).to_le_bytes());
        shdr[32..40].copy_from_slice(&(strtab.len() as u64).to_le_bytes());
        image.extend(shdr);

        image[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        image[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        image[60..62].copy_from_slice(&(shnum as u16).to_le_bytes());
        image[62..64].copy_from_slice(&((shnum - 1) as u16).to_le_bytes());
        image
    }

    #[test]
    fn test_debug_sections_by_name() {
        let image = build_elf(
            ET_DYN,
            &[
                (".text", 0x1000, &[0x90, 0x90]),
                (".debug_line", 0, &[1, 2, 3, 4]),
                (".rodata", 0x2000, &[0xff]),
            ],
        );

        let binary = Binary::from_bytes(Bytes::from(image)).unwrap();
        // Image base: .text address minus its file offset (it sits right
        // after the 64-byte ELF header in this fixture).
        assert_eq!(binary.text_vaddr(), 0x1000 - 64);
        assert_eq!(binary.entry_point(), 0x401000);
        assert_eq!(&binary.section_data(".debug_line").unwrap()[..], &[1, 2, 3, 4]);
        // .rodata is not a debug section, .debug_info is absent from the image.
        assert!(binary.section_data(".rodata").is_none());
        assert!(binary.section_data(".debug_info").is_none());
    }

    #[test]
    fn test_reject_32bit_elf() {
        let mut image = build_elf(ET_EXEC, &[]);
        image[4] = 1; // ELFCLASS32
        assert!(matches!(
            Binary::from_bytes(Bytes::from(image)),
            Err(LoadError::UnsupportedFormat("32-bit elf"))
        ));
    }

    #[test]
    fn test_reject_big_endian_elf() {
        let mut image = build_elf(ET_EXEC, &[]);
        image[5] = 2; // ELFDATA2MSB
        assert!(matches!(
            Binary::from_bytes(Bytes::from(image)),
            Err(LoadError::UnsupportedFormat("big-endian elf"))
        ));
    }

    #[test]
    fn test_truncated_section_data() {
        let mut image = build_elf(ET_EXEC, &[(".debug_line", 0, &[0u8; 8])]);
        // Corrupt the size of the .debug_line section header.
        let shoff = u64_at(&image, 40) as usize;
        let size_field = shoff + SHDR_SIZE + 32;
        image[size_field..size_field + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            Binary::from_bytes(Bytes::from(image)),
            Err(LoadError::IncompleteRead)
        ));
    }
}
