use crate::debugger::dwarf::reader::SectionReader;
use crate::debugger::dwarf::ParseError;
use gimli::{DwAt, DwChildren, DwForm, DwTag};
use std::collections::HashMap;

/// Attribute specification of an abbreviation declaration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttrSpec {
    pub name: DwAt,
    pub form: DwForm,
    /// Only meaningful for `DW_FORM_implicit_const`.
    pub implicit_const: i64,
}

/// Single `.debug_abbrev` declaration: maps an abbreviation code to a DIE shape.
#[derive(Debug, Clone, PartialEq)]
pub struct AbbrevDecl {
    pub tag: DwTag,
    pub has_children: bool,
    pub attrs: Vec<AttrSpec>,
}

/// Abbreviation table of a single compilation unit.
#[derive(Debug, Default)]
pub struct AbbrevTable {
    decls: HashMap<u64, AbbrevDecl>,
}

impl AbbrevTable {
    /// Decode the table located at `offset` of `.debug_abbrev`.
    /// A zero abbreviation code terminates the table.
    pub fn parse(section: &[u8], offset: usize) -> Result<AbbrevTable, ParseError> {
        let mut reader = SectionReader::with_offset(section, offset)?;
        let mut decls = HashMap::new();

        loop {
            let code = reader.read_uleb128()?;
            if code == 0 {
                break;
            }

            let tag = DwTag(reader.read_uleb128()? as u16);
            let has_children = DwChildren(reader.read_u8()?) == gimli::DW_CHILDREN_yes;

            let mut attrs = vec![];
            loop {
                let name = reader.read_uleb128()?;
                let form = reader.read_uleb128()?;
                if name == 0 && form == 0 {
                    break;
                }

                let form = DwForm(form as u16);
                let implicit_const = if form == gimli::DW_FORM_implicit_const {
                    reader.read_sleb128()?
                } else {
                    0
                };
                attrs.push(AttrSpec {
                    name: DwAt(name as u16),
                    form,
                    implicit_const,
                });
            }

            decls.insert(
                code,
                AbbrevDecl {
                    tag,
                    has_children,
                    attrs,
                },
            );
        }

        Ok(AbbrevTable { decls })
    }

    pub fn get(&self, code: u64) -> Option<&AbbrevDecl> {
        self.decls.get(&code)
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}
