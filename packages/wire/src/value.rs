use crate::error::{Result, WireError};
use crate::pack::MAX_SIZE;
use crate::types::ValueType;

/// A native value that can cross the boundary.
///
/// One variant per data-carrying [`ValueType`]; `Pack` has no variant
/// because it only ever groups other words.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    Byte(u8),
    I32(u32),
    I64(u64),
    F32(f32),
    F64(f64),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bytes(_) => ValueType::Bytes,
            Value::Byte(_) => ValueType::Byte,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::String(_) => ValueType::String,
        }
    }

    /// Number of bytes the value occupies in guest memory.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::Byte(_) => 1,
            Value::I32(_) | Value::F32(_) => 4,
            Value::I64(_) | Value::F64(_) => 8,
            Value::String(s) => s.len(),
        }
    }

    /// Encoded length as a wire size, failing when it needs more than 24 bits.
    pub fn wire_size(&self) -> Result<u32> {
        let len = self.encoded_len();
        if len > MAX_SIZE as usize {
            return Err(WireError::SizeOverflow { size: len as u64 });
        }
        Ok(len as u32)
    }

    /// Little-endian byte image written into guest memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bytes(b) => b.clone(),
            Value::Byte(b) => vec![*b],
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::F64(v) => v.to_le_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
        }
    }

    /// Reifies a value of type `ty` from the bytes of its span.
    pub fn from_bytes(ty: ValueType, bytes: &[u8]) -> Result<Value> {
        if let Some(width) = ty.fixed_width() {
            if bytes.len() != width as usize {
                return Err(WireError::WidthMismatch {
                    ty,
                    expected: width,
                    actual: bytes.len(),
                });
            }
        }
        let value = match ty {
            ValueType::Bytes => Value::Bytes(bytes.to_vec()),
            ValueType::Byte => Value::Byte(bytes[0]),
            ValueType::I32 => Value::I32(u32::from_le_bytes(array(bytes))),
            ValueType::I64 => Value::I64(u64::from_le_bytes(array(bytes))),
            ValueType::F32 => Value::F32(f32::from_le_bytes(array(bytes))),
            ValueType::F64 => Value::F64(f64::from_le_bytes(array(bytes))),
            ValueType::String => Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| WireError::InvalidUtf8(e.to_string()))?,
            ),
            ValueType::Pack => return Err(WireError::PackHasNoValue),
        };
        Ok(value)
    }

    /// The zero value of `ty`, substituted for parameters that could not be
    /// decoded.
    pub fn zeroed(ty: ValueType) -> Option<Value> {
        match ty {
            ValueType::Bytes => Some(Value::Bytes(Vec::new())),
            ValueType::Byte => Some(Value::Byte(0)),
            ValueType::I32 => Some(Value::I32(0)),
            ValueType::I64 => Some(Value::I64(0)),
            ValueType::F32 => Some(Value::F32(0.0)),
            ValueType::F64 => Some(Value::F64(0.0)),
            ValueType::String => Some(Value::String(String::new())),
            ValueType::Pack => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> Option<u8> {
        match self {
            Value::Byte(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

// Callers check the width first.
fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(bytes);
    buf
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::I32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}
