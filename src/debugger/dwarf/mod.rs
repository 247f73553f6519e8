pub mod abbrev;
pub mod eh_frame;
pub mod eval;
pub mod line;
pub mod reader;
pub mod unit;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::binary::Binary;
use crate::debugger::dwarf::eh_frame::FdeRecord;
use crate::debugger::dwarf::line::{LineEntry, LineTable};
use crate::debugger::dwarf::unit::{DebugEntities, FunctionInfo, InfoSections, VariableInfo};
use bytes::Bytes;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected end of data")]
    UnexpectedEndOfData,
    #[error("leb128 value overflow")]
    Overflow,
    #[error("offset {0} is out of section bounds")]
    OutOfBounds(usize),
    #[error("invalid utf-8 in string data")]
    InvalidString,
    #[error("unknown length encoding {0:#x}")]
    UnknownLengthEncoding(u32),
    #[error("unsupported dwarf version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown attribute form {0}")]
    UnknownForm(gimli::DwForm),
    #[error("unknown abbreviation code {0}")]
    UnknownAbbrevCode(u64),
    #[error("unknown eh_frame pointer encoding {0:#x}")]
    UnknownPointerEncoding(u8),
}

/// Source position resolved from a program counter.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceDescriptor<'a> {
    pub file: &'a str,
    pub address: u64,
    pub line: u32,
    pub column: u32,
    pub is_stmt: bool,
}

/// All debug information parsed out of one binary: the line-number matrix,
/// the DIE products and the `.eh_frame` bounds.
///
/// Line-row addresses are shifted by the ASLR slide exactly once, right after
/// the runtime text base becomes known; subprogram and variable addresses stay
/// link-time-global and are compared against slide-corrected PCs.
pub struct DebugInformation {
    line_table: LineTable,
    entities: DebugEntities,
    fdes: Vec<FdeRecord>,
    slide_applied: bool,
}

impl DebugInformation {
    pub fn from_binary(binary: &Binary) -> Self {
        let empty = Bytes::new();
        let section = |name: &str| binary.section_data(name).unwrap_or_else(|| empty.clone());

        let debug_str = section(".debug_str");
        let debug_line_str = section(".debug_line_str");

        let line_table = LineTable::parse(
            &section(".debug_line"),
            &debug_str,
            &debug_line_str,
        );

        let info = section(".debug_info");
        let entities = unit::parse_debug_info(&InfoSections {
            info: &info,
            abbrev: &section(".debug_abbrev"),
            debug_str: &debug_str,
            debug_line_str: &debug_line_str,
            str_offsets: &section(".debug_str_offsets"),
            debug_addr: &section(".debug_addr"),
        });

        let fdes = match binary.section(".eh_frame") {
            Some(eh_frame) => eh_frame::parse_eh_frame(&eh_frame.data, eh_frame.address),
            None => vec![],
        };

        DebugInformation {
            line_table,
            entities,
            fdes,
            slide_applied: false,
        }
    }

    pub(crate) fn from_parts(
        line_table: LineTable,
        entities: DebugEntities,
        fdes: Vec<FdeRecord>,
    ) -> Self {
        DebugInformation {
            line_table,
            entities,
            fdes,
            slide_applied: false,
        }
    }

    /// True when the binary carried at least one line-number program.
    pub fn has_line_info(&self) -> bool {
        !self.line_table.is_empty()
    }

    pub fn has_functions(&self) -> bool {
        !self.entities.functions.is_empty()
    }

    pub fn line_table(&self) -> &LineTable {
        &self.line_table
    }

    pub fn fdes(&self) -> &[FdeRecord] {
        &self.fdes
    }

    /// Shift line-row addresses to their runtime positions. Only the first
    /// call has an effect; debug info is frozen after that.
    pub fn apply_slide(&mut self, slide: u64) {
        if self.slide_applied {
            return;
        }
        self.slide_applied = true;
        if slide != 0 {
            self.line_table.apply_slide(slide);
        }
    }

    /// Resolve a runtime pc to its source place. Line rows are relocated,
    /// so the pc is used as is.
    pub fn find_place_from_pc(&self, pc: RelocatedAddress) -> Option<PlaceDescriptor> {
        let entry = self.line_table.resolve(pc.as_u64())?;
        self.place_from_entry(entry)
    }

    pub fn place_from_entry(&self, entry: &LineEntry) -> Option<PlaceDescriptor> {
        Some(PlaceDescriptor {
            file: self.line_table.file_path(entry.file_index)?,
            address: entry.address,
            line: entry.line,
            column: entry.column,
            is_stmt: entry.is_stmt,
        })
    }

    pub fn find_function_by_pc(&self, pc: GlobalAddress) -> Option<&FunctionInfo> {
        self.entities.find_function_by_pc(pc.as_u64())
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<&FunctionInfo> {
        self.entities.find_function_by_name(name)
    }

    /// Locals and parameters visible at a link-time-global pc.
    pub fn visible_variables(&self, pc: GlobalAddress) -> Vec<&VariableInfo> {
        self.entities.visible_variables(pc.as_u64())
    }

    pub fn find_variable(&self, pc: GlobalAddress, name: &str) -> Option<&VariableInfo> {
        self.entities
            .visible_variables(pc.as_u64())
            .into_iter()
            .find(|var| var.name == name)
    }
}
