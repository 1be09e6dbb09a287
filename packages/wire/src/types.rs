use std::fmt;

use crate::error::WireError;

/// Type tag stored in the top byte of every packed word.
///
/// The numbering is part of [`crate::WIRE_FORMAT_VERSION`] 1 and must not
/// change without bumping it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Variable-length byte span.
    Bytes = 0,
    /// A single byte. Distinct from a one-element `Bytes`.
    Byte = 1,
    /// Unsigned 32-bit integer.
    I32 = 2,
    /// Unsigned 64-bit integer.
    I64 = 3,
    F32 = 4,
    F64 = 5,
    /// UTF-8 text, variable length.
    String = 6,
    /// Reserved: the span is an array of packed words.
    Pack = 255,
}

impl ValueType {
    /// Every tag, in numeric order.
    pub const ALL: [ValueType; 8] = [
        ValueType::Bytes,
        ValueType::Byte,
        ValueType::I32,
        ValueType::I64,
        ValueType::F32,
        ValueType::F64,
        ValueType::String,
        ValueType::Pack,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Byte width of scalar types; `None` for variable-length spans.
    pub const fn fixed_width(self) -> Option<u32> {
        match self {
            ValueType::Byte => Some(1),
            ValueType::I32 | ValueType::F32 => Some(4),
            ValueType::I64 | ValueType::F64 => Some(8),
            ValueType::Bytes | ValueType::String | ValueType::Pack => None,
        }
    }
}

impl TryFrom<u8> for ValueType {
    type Error = WireError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(ValueType::Bytes),
            1 => Ok(ValueType::Byte),
            2 => Ok(ValueType::I32),
            3 => Ok(ValueType::I64),
            4 => Ok(ValueType::F32),
            5 => Ok(ValueType::F64),
            6 => Ok(ValueType::String),
            255 => Ok(ValueType::Pack),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(ty: ValueType) -> u8 {
        ty.tag()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bytes => "bytes",
            ValueType::Byte => "byte",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::String => "string",
            ValueType::Pack => "pack",
        };
        f.write_str(name)
    }
}
