use crate::debugger::dwarf::reader::{str_at, SectionReader};
use crate::debugger::dwarf::ParseError;
use gimli::{DwLnct, DwLne, DwLns};

/// Row of the line-number matrix.
///
/// `file_index` is normalized to a zero-based index into [`LineTable::files`]
/// regardless of the unit's DWARF version (version 4 tables are one-based on
/// disk, version 5 tables are zero-based).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineEntry {
    pub address: u64,
    pub file_index: u32,
    pub line: u32,
    pub column: u32,
    pub is_stmt: bool,
    pub end_sequence: bool,
}

/// Line-number information of the whole `.debug_line` section,
/// rows sorted by address.
#[derive(Debug, Default)]
pub struct LineTable {
    entries: Vec<LineEntry>,
    files: Vec<String>,
}

impl LineTable {
    /// Decode every line-number program in `section`.
    ///
    /// A malformed program terminates the decode; rows produced before the
    /// malformation are kept.
    pub fn parse(section: &[u8], debug_str: &[u8], debug_line_str: &[u8]) -> LineTable {
        let mut table = LineTable::default();
        let mut offset = 0;

        while offset < section.len() {
            match parse_program(section, offset, debug_str, debug_line_str, &mut table) {
                Ok(next_offset) if next_offset > offset => offset = next_offset,
                Ok(_) => break,
                Err(e) => {
                    log::warn!(target: "debugger", "line program at {offset:#x}: {e}");
                    break;
                }
            }
        }

        table.entries.sort_by_key(|entry| entry.address);
        table
    }

    pub(crate) fn from_rows(mut entries: Vec<LineEntry>, files: Vec<String>) -> LineTable {
        entries.sort_by_key(|entry| entry.address);
        LineTable { entries, files }
    }

    pub fn entries(&self) -> &[LineEntry] {
        &self.entries
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn file_path(&self, index: u32) -> Option<&str> {
        self.files.get(index as usize).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shift every row address by the ASLR slide. Applied once per session.
    pub fn apply_slide(&mut self, slide: u64) {
        for entry in &mut self.entries {
            entry.address = entry.address.wrapping_add(slide);
        }
    }

    /// Find the row with the greatest address not above `pc`,
    /// sequence terminators excluded.
    pub fn resolve(&self, pc: u64) -> Option<&LineEntry> {
        let mut idx = self.entries.partition_point(|entry| entry.address <= pc);
        while idx > 0 {
            let entry = &self.entries[idx - 1];
            if !entry.end_sequence {
                return Some(entry);
            }
            idx -= 1;
        }
        None
    }
}

struct LineProgramState {
    address: u64,
    file: u64,
    line: i64,
    column: u64,
    is_stmt: bool,
}

impl LineProgramState {
    fn reset(default_is_stmt: bool) -> Self {
        Self {
            address: 0,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: default_is_stmt,
        }
    }

    fn row(&self, file_base: u64, global_file_base: u64, end_sequence: bool) -> LineEntry {
        LineEntry {
            address: self.address,
            file_index: (self.file.saturating_sub(file_base) + global_file_base) as u32,
            line: self.line.max(0) as u32,
            column: self.column as u32,
            is_stmt: self.is_stmt,
            end_sequence,
        }
    }
}

/// Decode a single line-number program starting at `offset`.
/// Returns the offset of the next program.
fn parse_program(
    section: &[u8],
    offset: usize,
    debug_str: &[u8],
    debug_line_str: &[u8],
    table: &mut LineTable,
) -> Result<usize, ParseError> {
    let mut reader = SectionReader::with_offset(section, offset)?;

    let (unit_length, dwarf64) = reader.read_initial_length()?;
    let unit_end = reader.pos() + unit_length as usize;
    if unit_end > section.len() {
        return Err(ParseError::UnexpectedEndOfData);
    }

    let version = reader.read_u16()?;
    if version != 4 && version != 5 {
        return Err(ParseError::UnsupportedVersion(version));
    }

    if version >= 5 {
        let _address_size = reader.read_u8()?;
        let _segment_selector_size = reader.read_u8()?;
    }

    let header_length = reader.read_offset(dwarf64)?;
    let program_start = reader.pos() + header_length as usize;

    let minimum_instruction_length = reader.read_u8()?;
    let _maximum_operations_per_instruction = reader.read_u8()?;
    let default_is_stmt = reader.read_u8()? != 0;
    let line_base = reader.read_i8()?;
    let line_range = reader.read_u8()?.max(1);
    let opcode_base = reader.read_u8()?;

    let mut std_opcode_lengths = vec![0u8; opcode_base.saturating_sub(1) as usize];
    for len in &mut std_opcode_lengths {
        *len = reader.read_u8()?;
    }

    // Directory and file tables differ between versions 4 and 5.
    let global_file_base = table.files.len() as u64;
    let file_base;
    if version == 4 {
        file_base = 1;
        let mut directories = vec![];
        loop {
            let dir = reader.read_cstr()?;
            if dir.is_empty() {
                break;
            }
            directories.push(dir.to_string());
        }
        loop {
            let name = reader.read_cstr()?;
            if name.is_empty() {
                break;
            }
            let dir_index = reader.read_uleb128()?;
            let _mtime = reader.read_uleb128()?;
            let _size = reader.read_uleb128()?;
            table.files.push(join_path(
                dir_index
                    .checked_sub(1)
                    .and_then(|idx| directories.get(idx as usize))
                    .map(String::as_str),
                name,
            ));
        }
    } else {
        file_base = 0;
        let directories = parse_entries(&mut reader, dwarf64, debug_str, debug_line_str, &[])?;
        let files = parse_entries(&mut reader, dwarf64, debug_str, debug_line_str, &directories)?;
        table.files.extend(files);
    }

    // Run the state machine over the program itself.
    let mut reader = SectionReader::with_offset(section, program_start)?;
    let mut state = LineProgramState::reset(default_is_stmt);

    while reader.pos() < unit_end {
        let opcode = reader.read_u8()?;

        if opcode == 0 {
            // Extended opcode: length-prefixed.
            let len = reader.read_uleb128()? as usize;
            let sub_end = reader.pos() + len;
            if len == 0 {
                continue;
            }
            match DwLne(reader.read_u8()?) {
                gimli::DW_LNE_end_sequence => {
                    table
                        .entries
                        .push(state.row(file_base, global_file_base, true));
                    state = LineProgramState::reset(default_is_stmt);
                }
                gimli::DW_LNE_set_address => {
                    state.address = reader.read_u64()?;
                }
                gimli::DW_LNE_set_discriminator => {
                    let _discriminator = reader.read_uleb128()?;
                }
                _ => {}
            }
            if sub_end < reader.pos() || sub_end > section.len() {
                return Err(ParseError::UnexpectedEndOfData);
            }
            reader.skip(sub_end - reader.pos())?;
        } else if opcode < opcode_base {
            match DwLns(opcode) {
                gimli::DW_LNS_copy => {
                    table
                        .entries
                        .push(state.row(file_base, global_file_base, false));
                }
                gimli::DW_LNS_advance_pc => {
                    let advance = reader.read_uleb128()?;
                    state.address = state
                        .address
                        .wrapping_add(advance * minimum_instruction_length as u64);
                }
                gimli::DW_LNS_advance_line => {
                    state.line += reader.read_sleb128()?;
                }
                gimli::DW_LNS_set_file => {
                    state.file = reader.read_uleb128()?;
                }
                gimli::DW_LNS_set_column => {
                    state.column = reader.read_uleb128()?;
                }
                gimli::DW_LNS_negate_stmt => {
                    state.is_stmt = !state.is_stmt;
                }
                gimli::DW_LNS_const_add_pc => {
                    let adjusted = (255 - opcode_base) as u64;
                    state.address = state.address.wrapping_add(
                        adjusted / line_range as u64 * minimum_instruction_length as u64,
                    );
                }
                gimli::DW_LNS_fixed_advance_pc => {
                    state.address = state.address.wrapping_add(reader.read_u16()? as u64);
                }
                gimli::DW_LNS_set_isa => {
                    let _isa = reader.read_uleb128()?;
                }
                _ => {
                    // Unknown standard opcode: operand count comes from the header.
                    let args = std_opcode_lengths
                        .get(opcode as usize - 1)
                        .copied()
                        .unwrap_or(0);
                    for _ in 0..args {
                        reader.read_uleb128()?;
                    }
                }
            }
        } else {
            let adjusted = (opcode - opcode_base) as u64;
            state.address = state
                .address
                .wrapping_add(adjusted / line_range as u64 * minimum_instruction_length as u64);
            state.line += line_base as i64 + (adjusted % line_range as u64) as i64;
            table
                .entries
                .push(state.row(file_base, global_file_base, false));
        }
    }

    Ok(unit_end)
}

/// Decode a DWARF 5 directory or file table through its entry-format descriptor.
fn parse_entries(
    reader: &mut SectionReader,
    dwarf64: bool,
    debug_str: &[u8],
    debug_line_str: &[u8],
    directories: &[String],
) -> Result<Vec<String>, ParseError> {
    let format_count = reader.read_u8()?;
    let mut formats = Vec::with_capacity(format_count as usize);
    for _ in 0..format_count {
        let content_type = DwLnct(reader.read_uleb128()? as u16);
        let form = gimli::DwForm(reader.read_uleb128()? as u16);
        formats.push((content_type, form));
    }

    let count = reader.read_uleb128()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut path = None;
        let mut dir_index = None;
        for (content_type, form) in &formats {
            match *content_type {
                gimli::DW_LNCT_path => {
                    path = Some(read_string_form(
                        reader,
                        *form,
                        dwarf64,
                        debug_str,
                        debug_line_str,
                    )?);
                }
                gimli::DW_LNCT_directory_index => {
                    dir_index = Some(read_udata_form(reader, *form)?);
                }
                _ => skip_form(reader, *form, dwarf64)?,
            }
        }

        let path = path.unwrap_or_default();
        let dir = dir_index.and_then(|idx| directories.get(idx as usize));
        entries.push(join_path(dir.map(String::as_str), &path));
    }

    Ok(entries)
}

fn read_string_form(
    reader: &mut SectionReader,
    form: gimli::DwForm,
    dwarf64: bool,
    debug_str: &[u8],
    debug_line_str: &[u8],
) -> Result<String, ParseError> {
    match form {
        gimli::DW_FORM_string => Ok(reader.read_cstr()?.to_string()),
        gimli::DW_FORM_strp => {
            let offset = reader.read_offset(dwarf64)?;
            str_at(debug_str, offset as usize)
        }
        gimli::DW_FORM_line_strp => {
            let offset = reader.read_offset(dwarf64)?;
            str_at(debug_line_str, offset as usize)
        }
        _ => Err(ParseError::UnknownForm(form)),
    }
}

fn read_udata_form(reader: &mut SectionReader, form: gimli::DwForm) -> Result<u64, ParseError> {
    match form {
        gimli::DW_FORM_udata => reader.read_uleb128(),
        gimli::DW_FORM_data1 => Ok(reader.read_u8()? as u64),
        gimli::DW_FORM_data2 => Ok(reader.read_u16()? as u64),
        gimli::DW_FORM_data4 => Ok(reader.read_u32()? as u64),
        gimli::DW_FORM_data8 => reader.read_u64(),
        _ => Err(ParseError::UnknownForm(form)),
    }
}

fn skip_form(
    reader: &mut SectionReader,
    form: gimli::DwForm,
    dwarf64: bool,
) -> Result<(), ParseError> {
    match form {
        gimli::DW_FORM_data1 => reader.skip(1),
        gimli::DW_FORM_data2 => reader.skip(2),
        gimli::DW_FORM_data4 => reader.skip(4),
        gimli::DW_FORM_data8 => reader.skip(8),
        gimli::DW_FORM_data16 => reader.skip(16),
        gimli::DW_FORM_udata => reader.read_uleb128().map(|_| ()),
        gimli::DW_FORM_string => reader.read_cstr().map(|_| ()),
        gimli::DW_FORM_strp | gimli::DW_FORM_line_strp => {
            reader.read_offset(dwarf64).map(|_| ())
        }
        gimli::DW_FORM_block => {
            let len = reader.read_uleb128()? as usize;
            reader.skip(len)
        }
        _ => Err(ParseError::UnknownForm(form)),
    }
}

fn join_path(dir: Option<&str>, name: &str) -> String {
    match dir {
        Some(dir) if !name.starts_with('/') && !dir.is_empty() => format!("{dir}/{name}"),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn uleb(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                return;
            }
        }
    }

    /// Assemble a minimal DWARF 4 line program with the given opcode stream.
    fn v4_program(opcodes: &[u8]) -> Vec<u8> {
        let mut header = vec![];
        header.extend(4u16.to_le_bytes()); // version

        let mut prologue = vec![];
        prologue.push(1); // minimum_instruction_length
        prologue.push(1); // maximum_operations_per_instruction
        prologue.push(1); // default_is_stmt
        prologue.push((-5i8) as u8); // line_base
        prologue.push(14); // line_range
        prologue.push(13); // opcode_base
        prologue.extend([0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]); // std opcode lengths
        prologue.extend(b"src\0\0"); // include_directories
        prologue.extend(b"main.c\0"); // file 1
        uleb(&mut prologue, 1); // dir index
        uleb(&mut prologue, 0); // mtime
        uleb(&mut prologue, 0); // size
        prologue.push(0); // file table terminator

        header.extend((prologue.len() as u32).to_le_bytes()); // header_length
        header.extend(&prologue);
        header.extend(opcodes);

        let mut unit = vec![];
        unit.extend((header.len() as u32).to_le_bytes()); // unit_length
        unit.extend(&header);
        unit
    }

    fn set_address(out: &mut Vec<u8>, addr: u64) {
        out.push(0);
        uleb(out, 9);
        out.push(gimli::DW_LNE_set_address.0);
        out.extend(addr.to_le_bytes());
    }

    fn end_sequence(out: &mut Vec<u8>) {
        out.push(0);
        uleb(out, 1);
        out.push(gimli::DW_LNE_end_sequence.0);
    }

    #[test]
    fn test_v4_program_rows() {
        let mut ops = vec![];
        set_address(&mut ops, 0x1000);
        ops.push(gimli::DW_LNS_advance_line.0);
        ops.push(9); // line = 10
        ops.push(gimli::DW_LNS_copy.0);
        ops.push(gimli::DW_LNS_advance_pc.0);
        uleb(&mut ops, 0x10);
        ops.push(gimli::DW_LNS_advance_line.0);
        ops.push(2); // line = 12
        ops.push(gimli::DW_LNS_copy.0);
        ops.push(gimli::DW_LNS_advance_pc.0);
        uleb(&mut ops, 0x10);
        end_sequence(&mut ops);

        let section = v4_program(&ops);
        let table = LineTable::parse(&section, &[], &[]);

        assert_eq!(table.files(), &["src/main.c".to_string()]);
        let rows = table.entries();
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].address, rows[0].line), (0x1000, 10));
        assert!(rows[0].is_stmt);
        assert!(!rows[0].end_sequence);
        assert_eq!((rows[1].address, rows[1].line), (0x1010, 12));
        assert_eq!(rows[2].address, 0x1020);
        assert!(rows[2].end_sequence);
    }

    #[test]
    fn test_special_opcodes() {
        // opcode_base 13, line_base -5, line_range 14.
        // special opcode 13: adjusted 0 => line += -5, address += 0
        // special opcode 76: adjusted 63 => line += -5 + 63 % 14 = 2, address += 4
        let mut ops = vec![];
        set_address(&mut ops, 0x400);
        ops.push(gimli::DW_LNS_advance_line.0);
        ops.push(9); // line = 10
        ops.push(76); // emits (0x404, line 12)
        end_sequence(&mut ops);

        let section = v4_program(&ops);
        let table = LineTable::parse(&section, &[], &[]);
        let rows = table.entries();
        assert_eq!((rows[0].address, rows[0].line), (0x404, 12));
    }

    #[test]
    fn test_const_add_pc_and_negate_stmt() {
        let mut ops = vec![];
        set_address(&mut ops, 0x400);
        ops.push(gimli::DW_LNS_negate_stmt.0);
        ops.push(gimli::DW_LNS_const_add_pc.0); // (255 - 13) / 14 = 17
        ops.push(gimli::DW_LNS_copy.0);
        end_sequence(&mut ops);

        let section = v4_program(&ops);
        let table = LineTable::parse(&section, &[], &[]);
        let rows = table.entries();
        assert_eq!(rows[0].address, 0x411);
        assert!(!rows[0].is_stmt);
    }

    #[test]
    fn test_fixed_advance_pc() {
        let mut ops = vec![];
        set_address(&mut ops, 0x400);
        ops.push(gimli::DW_LNS_fixed_advance_pc.0);
        ops.extend(0x100u16.to_le_bytes());
        ops.push(gimli::DW_LNS_copy.0);
        end_sequence(&mut ops);

        let section = v4_program(&ops);
        let table = LineTable::parse(&section, &[], &[]);
        assert_eq!(table.entries()[0].address, 0x500);
    }

    #[test]
    fn test_resolve_picks_greatest_row_not_above_pc() {
        let mut ops = vec![];
        set_address(&mut ops, 0x1000);
        ops.push(gimli::DW_LNS_copy.0);
        ops.push(gimli::DW_LNS_advance_pc.0);
        uleb(&mut ops, 0x20);
        ops.push(gimli::DW_LNS_advance_line.0);
        ops.push(1);
        ops.push(gimli::DW_LNS_copy.0);
        ops.push(gimli::DW_LNS_advance_pc.0);
        uleb(&mut ops, 0x20);
        end_sequence(&mut ops);

        let section = v4_program(&ops);
        let table = LineTable::parse(&section, &[], &[]);

        assert_eq!(table.resolve(0x1000).unwrap().line, 1);
        assert_eq!(table.resolve(0x101f).unwrap().line, 1);
        assert_eq!(table.resolve(0x1020).unwrap().line, 2);
        // Past the sequence terminator the greatest non-terminator row wins.
        assert_eq!(table.resolve(0x2000).unwrap().line, 2);
        // Below the smallest row address there is nothing to resolve.
        assert!(table.resolve(0xfff).is_none());
    }

    #[test]
    fn test_apply_slide() {
        let mut ops = vec![];
        set_address(&mut ops, 0x1000);
        ops.push(gimli::DW_LNS_copy.0);
        end_sequence(&mut ops);

        let section = v4_program(&ops);
        let mut table = LineTable::parse(&section, &[], &[]);
        table.apply_slide(0x2000000);
        assert_eq!(table.entries()[0].address, 0x2001000);
    }

    #[test]
    fn test_malformed_program_keeps_decoded_rows() {
        let mut ops = vec![];
        set_address(&mut ops, 0x1000);
        ops.push(gimli::DW_LNS_copy.0);
        let mut section = v4_program(&ops);
        // A second unit with a truncated header.
        section.extend(0xffu32.to_le_bytes());
        section.extend(4u16.to_le_bytes());

        let table = LineTable::parse(&section, &[], &[]);
        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.entries()[0].address, 0x1000);
    }

    /// Assemble a DWARF 5 program: directories and files through the
    /// entry-format descriptor, path strings in `.debug_line_str`.
    #[test]
    fn test_v5_file_table() {
        let mut line_str = vec![];
        let comp_dir_off = line_str.len();
        line_str.extend(b"/home/user/proj\0");
        let src_dir_off = line_str.len();
        line_str.extend(b"/home/user/proj/src\0");
        let main_off = line_str.len();
        line_str.extend(b"main.c\0");

        let mut header = vec![];
        header.extend(5u16.to_le_bytes()); // version
        header.push(8); // address_size
        header.push(0); // segment_selector_size

        let mut prologue = vec![];
        prologue.push(1); // minimum_instruction_length
        prologue.push(1); // maximum_operations_per_instruction
        prologue.push(1); // default_is_stmt
        prologue.push((-5i8) as u8); // line_base
        prologue.push(14); // line_range
        prologue.push(13); // opcode_base
        prologue.extend([0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);

        // Directory table: one format descriptor (path, line_strp).
        prologue.push(1);
        uleb(&mut prologue, gimli::DW_LNCT_path.0 as u64);
        uleb(&mut prologue, gimli::DW_FORM_line_strp.0 as u64);
        uleb(&mut prologue, 2); // directories_count
        prologue.extend((comp_dir_off as u32).to_le_bytes());
        prologue.extend((src_dir_off as u32).to_le_bytes());

        // File table: path (line_strp), directory_index (udata), md5 (data16).
        prologue.push(3);
        uleb(&mut prologue, gimli::DW_LNCT_path.0 as u64);
        uleb(&mut prologue, gimli::DW_FORM_line_strp.0 as u64);
        uleb(&mut prologue, gimli::DW_LNCT_directory_index.0 as u64);
        uleb(&mut prologue, gimli::DW_FORM_udata.0 as u64);
        uleb(&mut prologue, gimli::DW_LNCT_MD5.0 as u64);
        uleb(&mut prologue, gimli::DW_FORM_data16.0 as u64);
        uleb(&mut prologue, 1); // file_names_count
        prologue.extend((main_off as u32).to_le_bytes());
        uleb(&mut prologue, 1); // dir 1
        prologue.extend([0u8; 16]); // md5

        let mut ops = vec![];
        set_address(&mut ops, 0x4000);
        ops.push(gimli::DW_LNS_set_file.0);
        uleb(&mut ops, 0); // DWARF 5 file indexes are zero-based
        ops.push(gimli::DW_LNS_copy.0);
        end_sequence(&mut ops);

        header.extend((prologue.len() as u32).to_le_bytes());
        header.extend(&prologue);
        header.extend(&ops);

        let mut section = vec![];
        section.extend((header.len() as u32).to_le_bytes());
        section.extend(&header);

        let table = LineTable::parse(&section, &[], &line_str);
        assert_eq!(table.files(), &["/home/user/proj/src/main.c".to_string()]);
        let rows = table.entries();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].address, 0x4000);
        assert_eq!(table.file_path(rows[0].file_index), Some("/home/user/proj/src/main.c"));
    }
}
