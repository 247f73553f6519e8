use crate::debugger::dwarf::abbrev::{AbbrevTable, AttrSpec};
use crate::debugger::dwarf::reader::{str_at, SectionReader};
use crate::debugger::dwarf::ParseError;
use bytes::Bytes;
use gimli::{DwAte, DwForm};
use std::collections::HashMap;

/// Subprogram bounds collected from `DW_TAG_subprogram` DIEs.
/// `high_pc` is absolute, offset-form attributes are folded into `low_pc`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: Option<u64>,
    /// Raw `DW_AT_frame_base` expression, evaluated when locals are read.
    pub frame_base: Option<Bytes>,
}

impl FunctionInfo {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.low_pc && self.high_pc.map(|high| pc < high).unwrap_or(true)
    }
}

/// Scalar type description from a `DW_TAG_base_type` DIE
/// (or a pointer/typedef chain resolving to one).
#[derive(Debug, Clone, PartialEq)]
pub struct BaseTypeInfo {
    pub name: String,
    pub encoding: DwAte,
    pub byte_size: u64,
}

/// Variable or formal parameter joined to its type.
/// An empty `location` means the variable is optimized out.
#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub name: String,
    pub location: Bytes,
    pub type_name: String,
    pub type_encoding: DwAte,
    pub type_byte_size: u64,
    /// Bounds of the tightest enclosing scope (lexical block or subprogram).
    /// `None` for globals.
    pub scope: Option<(u64, u64)>,
}

impl VariableInfo {
    pub fn visible_at(&self, pc: u64) -> bool {
        match self.scope {
            Some((low, high)) => pc >= low && pc < high,
            None => true,
        }
    }
}

/// Everything the `.debug_info` walk produces.
#[derive(Debug, Default)]
pub struct DebugEntities {
    pub functions: Vec<FunctionInfo>,
    pub variables: Vec<VariableInfo>,
    /// DIE offset (absolute in `.debug_info`) to resolved scalar type.
    pub base_types: HashMap<u64, BaseTypeInfo>,
}

impl DebugEntities {
    pub fn find_function_by_pc(&self, pc: u64) -> Option<&FunctionInfo> {
        self.functions.iter().find(|func| func.contains(pc))
    }

    pub fn find_function_by_name(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.iter().find(|func| func.name == name)
    }

    /// Local variables and parameters of the function enclosing `pc`.
    pub fn visible_variables(&self, pc: u64) -> Vec<&VariableInfo> {
        self.variables
            .iter()
            .filter(|var| var.scope.is_some() && var.visible_at(pc))
            .collect()
    }
}

/// Sections consumed by the DIE walk.
pub struct InfoSections<'a> {
    pub info: &'a Bytes,
    pub abbrev: &'a [u8],
    pub debug_str: &'a [u8],
    pub debug_line_str: &'a [u8],
    pub str_offsets: &'a [u8],
    pub debug_addr: &'a [u8],
}

/// Walk the DIE trees of every compilation unit in `.debug_info`.
///
/// A malformed unit terminates the walk; entities collected before the
/// malformation are kept.
pub fn parse_debug_info(sections: &InfoSections) -> DebugEntities {
    let mut entities = DebugEntities::default();
    let mut raw_types: HashMap<u64, TypeEntry> = HashMap::new();
    let mut raw_vars: Vec<RawVariable> = vec![];

    let mut offset = 0;
    let info_len = sections.info.len();
    while offset < info_len {
        match parse_unit(sections, offset, &mut entities, &mut raw_types, &mut raw_vars) {
            Ok(next) if next > offset => offset = next,
            Ok(_) => break,
            Err(e) => {
                log::warn!(target: "debugger", "compilation unit at {offset:#x}: {e}");
                break;
            }
        }
    }

    // Join variables to their types through the type map.
    for var in raw_vars {
        let resolved = var.type_ref.and_then(|die| resolve_type(&raw_types, die));
        let (type_name, encoding, byte_size) = match resolved {
            Some(ty) => (ty.name, ty.encoding, ty.byte_size),
            None => ("<unknown>".to_string(), DwAte(0), 0),
        };
        entities.variables.push(VariableInfo {
            name: var.name,
            location: var.location,
            type_name,
            type_encoding: encoding,
            type_byte_size: byte_size,
            scope: var.scope,
        });
    }

    // Publish resolved scalar info for every type DIE that reaches one.
    let offsets: Vec<u64> = raw_types.keys().copied().collect();
    for die in offsets {
        if let Some(ty) = resolve_type(&raw_types, die) {
            entities.base_types.insert(die, ty);
        }
    }

    entities
}

struct RawVariable {
    name: String,
    location: Bytes,
    type_ref: Option<u64>,
    scope: Option<(u64, u64)>,
}

enum TypeEntry {
    Base(BaseTypeInfo),
    /// typedef / const / volatile indirection.
    Alias {
        name: Option<String>,
        target: Option<u64>,
    },
    Pointer {
        byte_size: u64,
    },
}

fn resolve_type(types: &HashMap<u64, TypeEntry>, die: u64) -> Option<BaseTypeInfo> {
    let mut current = die;
    let mut alias_name: Option<String> = None;
    for _ in 0..8 {
        match types.get(&current)? {
            TypeEntry::Base(base) => {
                return Some(BaseTypeInfo {
                    name: alias_name.unwrap_or_else(|| base.name.clone()),
                    ..base.clone()
                });
            }
            TypeEntry::Pointer { byte_size } => {
                return Some(BaseTypeInfo {
                    name: alias_name.unwrap_or_else(|| "*".to_string()),
                    encoding: gimli::DW_ATE_address,
                    byte_size: *byte_size,
                });
            }
            TypeEntry::Alias { name, target } => {
                if alias_name.is_none() {
                    alias_name = name.clone();
                }
                current = (*target)?;
            }
        }
    }
    None
}

struct UnitContext {
    cu_start: u64,
    dwarf64: bool,
    address_size: u8,
    str_offsets_base: u64,
    addr_base: u64,
}

/// Decoded attribute value, already resolved through DWARF 5 indirections.
#[derive(Debug, Clone, PartialEq)]
enum AttrValue {
    Addr(u64),
    U64(u64),
    I64(i64),
    Flag(bool),
    Str(String),
    /// Absolute offset into `.debug_info`.
    Ref(u64),
    Expr(Bytes),
    None,
}

impl AttrValue {
    fn udata(&self) -> Option<u64> {
        match self {
            AttrValue::U64(v) | AttrValue::Addr(v) | AttrValue::Ref(v) => Some(*v),
            AttrValue::I64(v) => Some(*v as u64),
            _ => None,
        }
    }
}

fn parse_unit(
    sections: &InfoSections,
    offset: usize,
    entities: &mut DebugEntities,
    types: &mut HashMap<u64, TypeEntry>,
    vars: &mut Vec<RawVariable>,
) -> Result<usize, ParseError> {
    let info = &sections.info[..];
    let mut reader = SectionReader::with_offset(info, offset)?;

    let (unit_length, dwarf64) = reader.read_initial_length()?;
    let unit_end = reader.pos() + unit_length as usize;
    if unit_end > info.len() {
        return Err(ParseError::UnexpectedEndOfData);
    }

    let version = reader.read_u16()?;
    if version != 4 && version != 5 {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let (abbrev_offset, address_size) = if version >= 5 {
        let _unit_type = reader.read_u8()?;
        let address_size = reader.read_u8()?;
        (reader.read_offset(dwarf64)?, address_size)
    } else {
        let abbrev_offset = reader.read_offset(dwarf64)?;
        (abbrev_offset, reader.read_u8()?)
    };

    let abbrevs = AbbrevTable::parse(sections.abbrev, abbrev_offset as usize)?;

    let mut ctx = UnitContext {
        cu_start: offset as u64,
        dwarf64,
        address_size,
        // Defaults point just past the version 5 section headers; the unit DIE
        // usually overrides them explicitly.
        str_offsets_base: if dwarf64 { 16 } else { 8 },
        addr_base: if dwarf64 { 16 } else { 8 },
    };

    // DW_AT_str_offsets_base and DW_AT_addr_base must be known before any
    // strx/addrx form resolves, so the unit DIE is scanned for them first.
    let root_code = reader.read_uleb128()?;
    if root_code == 0 {
        return Ok(unit_end);
    }
    let root_decl = abbrevs
        .get(root_code)
        .ok_or(ParseError::UnknownAbbrevCode(root_code))?;
    for spec in &root_decl.attrs {
        let value = read_attr(&mut reader, sections, &ctx, spec)?;
        match spec.name {
            gimli::DW_AT_str_offsets_base => {
                if let Some(base) = value.udata() {
                    ctx.str_offsets_base = base;
                }
            }
            gimli::DW_AT_addr_base => {
                if let Some(base) = value.udata() {
                    ctx.addr_base = base;
                }
            }
            _ => {}
        }
    }
    let mut depth: isize = if root_decl.has_children { 1 } else { 0 };

    // Scope stack of enclosing subprograms and lexical blocks.
    let mut scopes: Vec<(isize, u64, u64)> = vec![];

    while reader.pos() < unit_end && depth > 0 {
        let die_offset = reader.pos() as u64;
        let code = reader.read_uleb128()?;
        if code == 0 {
            depth -= 1;
            // Scopes recorded at this depth are left behind now.
            while scopes.last().map(|s| s.0 >= depth).unwrap_or(false) {
                scopes.pop();
            }
            continue;
        }

        let decl = abbrevs
            .get(code)
            .ok_or(ParseError::UnknownAbbrevCode(code))?;

        let mut name = None;
        let mut low_pc = None;
        let mut high_pc = None;
        let mut high_pc_is_offset = false;
        let mut location = None;
        let mut frame_base = None;
        let mut type_ref = None;
        let mut encoding = None;
        let mut byte_size = None;

        for spec in &decl.attrs {
            let value = read_attr(&mut reader, sections, &ctx, spec)?;
            match spec.name {
                gimli::DW_AT_name => {
                    if let AttrValue::Str(s) = value {
                        name = Some(s);
                    }
                }
                gimli::DW_AT_linkage_name => {
                    if name.is_none() {
                        if let AttrValue::Str(s) = value {
                            name = Some(s);
                        }
                    }
                }
                gimli::DW_AT_low_pc => low_pc = value.udata(),
                gimli::DW_AT_high_pc => {
                    high_pc_is_offset = !matches!(value, AttrValue::Addr(_));
                    high_pc = value.udata();
                }
                gimli::DW_AT_location => {
                    if let AttrValue::Expr(expr) = value {
                        location = Some(expr);
                    }
                }
                gimli::DW_AT_frame_base => {
                    if let AttrValue::Expr(expr) = value {
                        frame_base = Some(expr);
                    }
                }
                gimli::DW_AT_type => {
                    if let AttrValue::Ref(target) = value {
                        type_ref = Some(target);
                    }
                }
                gimli::DW_AT_encoding => encoding = value.udata(),
                gimli::DW_AT_byte_size => byte_size = value.udata(),
                _ => {}
            }
        }

        // Offset-form high_pc is relative to low_pc.
        let high_pc = high_pc.map(|high| {
            if high_pc_is_offset {
                low_pc.unwrap_or(0) + high
            } else {
                high
            }
        });

        match decl.tag {
            gimli::DW_TAG_subprogram => {
                if let Some(low) = low_pc {
                    entities.functions.push(FunctionInfo {
                        name: name.unwrap_or_default(),
                        low_pc: low,
                        high_pc,
                        frame_base,
                    });
                    if decl.has_children {
                        scopes.push((depth, low, high_pc.unwrap_or(u64::MAX)));
                    }
                }
            }
            gimli::DW_TAG_lexical_block => {
                if let (Some(low), Some(high), true) = (low_pc, high_pc, decl.has_children) {
                    scopes.push((depth, low, high));
                }
            }
            gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                if let Some(name) = name {
                    vars.push(RawVariable {
                        name,
                        location: location.unwrap_or_default(),
                        type_ref,
                        scope: scopes.last().map(|&(_, low, high)| (low, high)),
                    });
                }
            }
            gimli::DW_TAG_base_type => {
                types.insert(
                    die_offset,
                    TypeEntry::Base(BaseTypeInfo {
                        name: name.unwrap_or_default(),
                        encoding: DwAte(encoding.unwrap_or(0) as u8),
                        byte_size: byte_size.unwrap_or(0),
                    }),
                );
            }
            gimli::DW_TAG_pointer_type => {
                types.insert(
                    die_offset,
                    TypeEntry::Pointer {
                        byte_size: byte_size.unwrap_or(ctx.address_size as u64),
                    },
                );
            }
            gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                types.insert(
                    die_offset,
                    TypeEntry::Alias {
                        name,
                        target: type_ref,
                    },
                );
            }
            _ => {}
        }

        if decl.has_children {
            depth += 1;
        }
    }

    Ok(unit_end)
}

/// Read one attribute value according to its form,
/// resolving `strx`/`addrx`/`strp` indirections.
fn read_attr(
    reader: &mut SectionReader,
    sections: &InfoSections,
    ctx: &UnitContext,
    spec: &AttrSpec,
) -> Result<AttrValue, ParseError> {
    read_form(reader, sections, ctx, spec.form, spec.implicit_const)
}

fn read_form(
    reader: &mut SectionReader,
    sections: &InfoSections,
    ctx: &UnitContext,
    form: DwForm,
    implicit_const: i64,
) -> Result<AttrValue, ParseError> {
    let value = match form {
        gimli::DW_FORM_addr => AttrValue::Addr(reader.read_uint(ctx.address_size as usize)?),
        gimli::DW_FORM_addrx | gimli::DW_FORM_GNU_addr_index => {
            resolve_addr_index(sections, ctx, reader.read_uleb128()?)
        }
        gimli::DW_FORM_addrx1 => resolve_addr_index(sections, ctx, reader.read_u8()? as u64),
        gimli::DW_FORM_addrx2 => resolve_addr_index(sections, ctx, reader.read_u16()? as u64),
        gimli::DW_FORM_addrx3 => resolve_addr_index(sections, ctx, reader.read_uint(3)?),
        gimli::DW_FORM_addrx4 => resolve_addr_index(sections, ctx, reader.read_u32()? as u64),

        gimli::DW_FORM_data1 => AttrValue::U64(reader.read_u8()? as u64),
        gimli::DW_FORM_data2 => AttrValue::U64(reader.read_u16()? as u64),
        gimli::DW_FORM_data4 => AttrValue::U64(reader.read_u32()? as u64),
        gimli::DW_FORM_data8 => AttrValue::U64(reader.read_u64()?),
        gimli::DW_FORM_data16 => {
            reader.skip(16)?;
            AttrValue::None
        }
        gimli::DW_FORM_udata => AttrValue::U64(reader.read_uleb128()?),
        gimli::DW_FORM_sdata => AttrValue::I64(reader.read_sleb128()?),
        gimli::DW_FORM_implicit_const => AttrValue::I64(implicit_const),

        gimli::DW_FORM_flag => AttrValue::Flag(reader.read_u8()? != 0),
        gimli::DW_FORM_flag_present => AttrValue::Flag(true),

        gimli::DW_FORM_string => AttrValue::Str(reader.read_cstr()?.to_string()),
        gimli::DW_FORM_strp => {
            let offset = reader.read_offset(ctx.dwarf64)?;
            str_section_attr(sections.debug_str, offset)
        }
        gimli::DW_FORM_line_strp => {
            let offset = reader.read_offset(ctx.dwarf64)?;
            str_section_attr(sections.debug_line_str, offset)
        }
        gimli::DW_FORM_strx | gimli::DW_FORM_GNU_str_index => {
            resolve_str_index(sections, ctx, reader.read_uleb128()?)
        }
        gimli::DW_FORM_strx1 => resolve_str_index(sections, ctx, reader.read_u8()? as u64),
        gimli::DW_FORM_strx2 => resolve_str_index(sections, ctx, reader.read_u16()? as u64),
        gimli::DW_FORM_strx3 => resolve_str_index(sections, ctx, reader.read_uint(3)?),
        gimli::DW_FORM_strx4 => resolve_str_index(sections, ctx, reader.read_u32()? as u64),
        gimli::DW_FORM_strp_sup => {
            reader.read_offset(ctx.dwarf64)?;
            AttrValue::None
        }

        gimli::DW_FORM_ref1 => AttrValue::Ref(ctx.cu_start + reader.read_u8()? as u64),
        gimli::DW_FORM_ref2 => AttrValue::Ref(ctx.cu_start + reader.read_u16()? as u64),
        gimli::DW_FORM_ref4 => AttrValue::Ref(ctx.cu_start + reader.read_u32()? as u64),
        gimli::DW_FORM_ref8 => AttrValue::Ref(ctx.cu_start + reader.read_u64()?),
        gimli::DW_FORM_ref_udata => AttrValue::Ref(ctx.cu_start + reader.read_uleb128()?),
        gimli::DW_FORM_ref_addr => AttrValue::Ref(reader.read_offset(ctx.dwarf64)?),
        gimli::DW_FORM_ref_sig8 => {
            reader.skip(8)?;
            AttrValue::None
        }
        gimli::DW_FORM_ref_sup4 => {
            reader.skip(4)?;
            AttrValue::None
        }
        gimli::DW_FORM_ref_sup8 => {
            reader.skip(8)?;
            AttrValue::None
        }

        gimli::DW_FORM_sec_offset => AttrValue::U64(reader.read_offset(ctx.dwarf64)?),
        gimli::DW_FORM_loclistx | gimli::DW_FORM_rnglistx => {
            AttrValue::U64(reader.read_uleb128()?)
        }

        gimli::DW_FORM_exprloc | gimli::DW_FORM_block => {
            let len = reader.read_uleb128()? as usize;
            expr_slice(sections.info, reader, len)?
        }
        gimli::DW_FORM_block1 => {
            let len = reader.read_u8()? as usize;
            expr_slice(sections.info, reader, len)?
        }
        gimli::DW_FORM_block2 => {
            let len = reader.read_u16()? as usize;
            expr_slice(sections.info, reader, len)?
        }
        gimli::DW_FORM_block4 => {
            let len = reader.read_u32()? as usize;
            expr_slice(sections.info, reader, len)?
        }

        gimli::DW_FORM_indirect => {
            let form = DwForm(reader.read_uleb128()? as u16);
            return read_form(reader, sections, ctx, form, implicit_const);
        }

        unknown => return Err(ParseError::UnknownForm(unknown)),
    };
    Ok(value)
}

fn expr_slice(
    info: &Bytes,
    reader: &mut SectionReader,
    len: usize,
) -> Result<AttrValue, ParseError> {
    let start = reader.pos();
    reader.skip(len)?;
    Ok(AttrValue::Expr(info.slice(start..start + len)))
}

fn str_section_attr(section: &[u8], offset: u64) -> AttrValue {
    match str_at(section, offset as usize) {
        Ok(s) => AttrValue::Str(s),
        Err(_) => AttrValue::None,
    }
}

fn resolve_str_index(sections: &InfoSections, ctx: &UnitContext, index: u64) -> AttrValue {
    let entry_size = if ctx.dwarf64 { 8 } else { 4 };
    let entry_offset = (ctx.str_offsets_base + index * entry_size) as usize;
    let mut reader = match SectionReader::with_offset(sections.str_offsets, entry_offset) {
        Ok(reader) => reader,
        Err(_) => return AttrValue::None,
    };
    match reader.read_offset(ctx.dwarf64) {
        Ok(offset) => str_section_attr(sections.debug_str, offset),
        Err(_) => AttrValue::None,
    }
}

fn resolve_addr_index(sections: &InfoSections, ctx: &UnitContext, index: u64) -> AttrValue {
    let entry_size = ctx.address_size as u64;
    let entry_offset = (ctx.addr_base + index * entry_size) as usize;
    let mut reader = match SectionReader::with_offset(sections.debug_addr, entry_offset) {
        Ok(reader) => reader,
        Err(_) => return AttrValue::None,
    };
    match reader.read_uint(entry_size as usize) {
        Ok(addr) => AttrValue::Addr(addr),
        Err(_) => AttrValue::None,
    }
}
