use crate::debugger::dwarf::unit::BaseTypeInfo;
use gimli::DwAte;
use itertools::Itertools;

/// Member descriptor for structure rendering: where the field sits in the
/// parent's byte image and how to interpret it.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub offset: usize,
    pub encoding: DwAte,
    pub byte_size: u64,
}

/// Render raw little-endian bytes as a typed scalar.
///
/// Byte widths 1/2/4/8 are supported (4/8 for floats); anything else renders
/// as `<unsupported size>`. Empty input means the variable had no location.
pub fn render_scalar(raw: &[u8], encoding: DwAte, byte_size: u64) -> String {
    if raw.is_empty() {
        return "<optimized out>".to_string();
    }
    let Some(raw) = raw.get(..byte_size as usize) else {
        return "<unsupported size>".to_string();
    };

    match encoding {
        gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => match raw.len() {
            1 => (raw[0] as i8).to_string(),
            2 => i16::from_le_bytes([raw[0], raw[1]]).to_string(),
            4 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
            8 => i64::from_le_bytes(raw.try_into().expect("len checked")).to_string(),
            _ => "<unsupported size>".to_string(),
        },
        gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char => match raw.len() {
            1 => raw[0].to_string(),
            2 => u16::from_le_bytes([raw[0], raw[1]]).to_string(),
            4 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
            8 => u64::from_le_bytes(raw.try_into().expect("len checked")).to_string(),
            _ => "<unsupported size>".to_string(),
        },
        gimli::DW_ATE_address => match raw.len() {
            1 => format!("{:#x}", raw[0]),
            2 => format!("{:#x}", u16::from_le_bytes([raw[0], raw[1]])),
            4 => format!("{:#x}", u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            8 => format!(
                "{:#x}",
                u64::from_le_bytes(raw.try_into().expect("len checked"))
            ),
            _ => "<unsupported size>".to_string(),
        },
        gimli::DW_ATE_boolean => if raw[0] != 0 { "true" } else { "false" }.to_string(),
        gimli::DW_ATE_float => match raw.len() {
            4 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
            8 => f64::from_le_bytes(raw.try_into().expect("len checked")).to_string(),
            _ => "<unsupported size>".to_string(),
        },
        _ => format!("<unsupported encoding {encoding}>"),
    }
}

pub fn render_typed(raw: &[u8], base_type: &BaseTypeInfo) -> String {
    render_scalar(raw, base_type.encoding, base_type.byte_size)
}

/// Render a structure field by field: `{a: 1, b: true}`.
/// Fields outside the byte image render as optimized out.
pub fn render_struct(raw: &[u8], fields: &[FieldDescriptor]) -> String {
    let rendered = fields
        .iter()
        .map(|field| {
            let end = field.offset + field.byte_size as usize;
            let value = match raw.get(field.offset..end) {
                Some(bytes) => render_scalar(bytes, field.encoding, field.byte_size),
                None => "<optimized out>".to_string(),
            };
            format!("{}: {}", field.name, value)
        })
        .join(", ");
    format!("{{{rendered}}}")
}

/// Render a fixed array element by element: `[1, 2, 3]`.
pub fn render_array(raw: &[u8], element: &BaseTypeInfo, count: usize) -> String {
    let size = element.byte_size as usize;
    let rendered = (0..count)
        .map(|index| match raw.get(index * size..(index + 1) * size) {
            Some(bytes) => render_typed(bytes, element),
            None => "<optimized out>".to_string(),
        })
        .join(", ");
    format!("[{rendered}]")
}
