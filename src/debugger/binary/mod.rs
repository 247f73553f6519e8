mod elf;
mod macho;

use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Debug sections the loader looks for, by their ELF names.
/// Mach-O spellings are canonicalized to these.
pub(crate) const KNOWN_SECTIONS: &[&str] = &[
    ".debug_info",
    ".debug_abbrev",
    ".debug_line",
    ".debug_str",
    ".debug_str_offsets",
    ".debug_addr",
    ".debug_ranges",
    ".debug_aranges",
    ".debug_line_str",
    ".eh_frame",
];

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("file too small for an object header")]
    TooSmall,
    #[error("invalid magic {0:#010x}")]
    InvalidMagic(u32),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(&'static str),
    #[error("section data lies outside the file")]
    IncompleteRead,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    MachO,
}

/// Kind of object the file claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Executable,
    SharedObject,
    CoreDump,
    Other,
}

/// One located section: a zero-copy slice of the loaded file.
#[derive(Debug, Clone)]
pub struct Section {
    pub data: Bytes,
    /// Link-time virtual address.
    pub address: u64,
    pub file_offset: u64,
}

pub(crate) struct ParsedObject {
    pub sections: HashMap<&'static str, Section>,
    pub text_vaddr: u64,
    pub entry: u64,
    pub kind: ObjectKind,
}

/// Memory-mapped executable with its debug sections located by name.
pub struct Binary {
    format: BinaryFormat,
    sections: HashMap<&'static str, Section>,
    text_vaddr: u64,
    entry: u64,
    kind: ObjectKind,
}

impl Binary {
    /// Map the file at `path` and classify it.
    pub fn load(path: &Path) -> Result<Binary, LoadError> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        // One session-owned buffer; every section below is a view into it.
        Self::from_bytes(Bytes::copy_from_slice(&mmap))
    }

    /// Classify an in-memory image by magic and enumerate its debug sections.
    pub fn from_bytes(data: Bytes) -> Result<Binary, LoadError> {
        if data.len() < 4 {
            return Err(LoadError::TooSmall);
        }

        let (format, parsed) = if data[..4] == [0x7f, b'E', b'L', b'F'] {
            (BinaryFormat::Elf, elf::parse(&data)?)
        } else {
            let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            match magic {
                macho::MH_MAGIC_64 => (BinaryFormat::MachO, macho::parse(&data)?),
                macho::MH_MAGIC_32 => {
                    return Err(LoadError::UnsupportedFormat("32-bit mach-o"))
                }
                _ => return Err(LoadError::InvalidMagic(magic)),
            }
        };

        Ok(Binary {
            format,
            sections: parsed.sections,
            text_vaddr: parsed.text_vaddr,
            entry: parsed.entry,
            kind: parsed.kind,
        })
    }

    /// Load `path`, falling back to the dSYM companion bundle when a Mach-O
    /// executable carries no line-number section (stripped binaries keep their
    /// DWARF at `<program>.dSYM/Contents/Resources/DWARF/<basename>`).
    pub fn load_with_dsym(path: &Path) -> Result<Binary, LoadError> {
        let binary = Self::load(path)?;
        if binary.format != BinaryFormat::MachO || binary.section_data(".debug_line").is_some() {
            return Ok(binary);
        }

        let Some(file_name) = path.file_name() else {
            return Ok(binary);
        };
        let dsym_path = {
            let mut dsym = path.as_os_str().to_owned();
            dsym.push(".dSYM/Contents/Resources/DWARF/");
            dsym.push(file_name);
            std::path::PathBuf::from(dsym)
        };

        match Self::load(&dsym_path) {
            Ok(dsym) if dsym.section_data(".debug_line").is_some() => {
                log::info!(target: "debugger", "debug sections loaded from {}", dsym_path.display());
                Ok(dsym)
            }
            _ => Ok(binary),
        }
    }

    pub fn format(&self) -> BinaryFormat {
        self.format
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Link-time base of the text image. The ASLR slide is the runtime base
    /// (from the process controller) minus this value.
    pub fn text_vaddr(&self) -> u64 {
        self.text_vaddr
    }

    pub fn entry_point(&self) -> u64 {
        self.entry
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// Section contents by canonical (ELF) name. Missing sections are not an
    /// error; absent means the binary does not carry that section.
    pub fn section_data(&self, name: &str) -> Option<Bytes> {
        self.sections.get(name).map(|section| section.data.clone())
    }
}

pub(crate) fn canonical_name(raw: &str) -> Option<&'static str> {
    KNOWN_SECTIONS.iter().copied().find(|known| *known == raw)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reject_tiny_and_unknown_images() {
        assert!(matches!(
            Binary::from_bytes(Bytes::from_static(&[0u8; 3])),
            Err(LoadError::TooSmall)
        ));
        assert!(matches!(
            Binary::from_bytes(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 0, 0])),
            Err(LoadError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_reject_32bit_macho() {
        let mut image = macho::MH_MAGIC_32.to_le_bytes().to_vec();
        image.extend([0u8; 28]);
        assert!(matches!(
            Binary::from_bytes(Bytes::from(image)),
            Err(LoadError::UnsupportedFormat(_))
        ));
    }
}
