use thiserror::Error;

use crate::types::ValueType;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The size field only has 24 bits.
    #[error("size {size} exceeds 24 bits precision {}", crate::pack::MAX_SIZE + 1)]
    SizeOverflow { size: u64 },

    /// The tag byte does not name any known value type.
    #[error("unknown value type tag {0}")]
    UnknownTag(u8),

    /// A fixed-width value was decoded from a span of the wrong length.
    #[error("{ty} expects {expected} bytes, got {actual}")]
    WidthMismatch {
        ty: ValueType,
        expected: u32,
        actual: usize,
    },

    /// A `String` span did not hold valid UTF-8.
    #[error("string value is not valid utf-8: {0}")]
    InvalidUtf8(String),

    /// `Pack` locates other words and never carries a value of its own.
    #[error("pack words carry no value of their own")]
    PackHasNoValue,

    /// A word was expected to carry one type but carried another.
    #[error("expected {expected} word, got tag {actual}")]
    TypeMismatch { expected: ValueType, actual: u8 },
}

pub type Result<T> = std::result::Result<T, WireError>;
