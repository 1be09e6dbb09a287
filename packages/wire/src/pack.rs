use std::fmt;

use crate::error::{Result, WireError};
use crate::types::ValueType;

/// Largest size representable in the 24-bit size field.
pub const MAX_SIZE: u32 = (1 << 24) - 1;

/// Bytes occupied by one packed word inside a `Pack` array.
pub const WORD_SIZE: u32 = 8;

const TAG_SHIFT: u32 = 56;
const OFFSET_SHIFT: u32 = 24;
const SIZE_MASK: u64 = 0xFF_FFFF;

/// Packs a raw tag, offset and size into one word.
///
/// Fails instead of truncating when `size` does not fit in 24 bits.
pub fn pack(tag: u8, offset: u32, size: u32) -> Result<u64> {
    if size > MAX_SIZE {
        return Err(WireError::SizeOverflow { size: size as u64 });
    }
    Ok(((tag as u64) << TAG_SHIFT) | ((offset as u64) << OFFSET_SHIFT) | size as u64)
}

/// Splits a word into `(tag, offset, size)`. Every input decodes to some
/// triple; checking the tag is up to the caller.
pub fn unpack(word: u64) -> (u8, u32, u32) {
    let tag = (word >> TAG_SHIFT) as u8;
    let offset = ((word >> OFFSET_SHIFT) & 0xFFFF_FFFF) as u32;
    let size = (word & SIZE_MASK) as u32;
    (tag, offset, size)
}

/// One value reference: type tag, guest offset and byte length.
///
/// A packed word only means something inside the memory of the instance
/// that produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PackedWord(u64);

impl PackedWord {
    pub fn new(ty: ValueType, offset: u32, size: u32) -> Result<Self> {
        pack(ty.tag(), offset, size).map(Self)
    }

    pub const fn from_raw(word: u64) -> Self {
        Self(word)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn tag(self) -> u8 {
        unpack(self.0).0
    }

    pub fn offset(self) -> u32 {
        unpack(self.0).1
    }

    pub fn size(self) -> u32 {
        unpack(self.0).2
    }

    /// The decoded type, failing on tags outside the known set.
    pub fn value_type(self) -> Result<ValueType> {
        ValueType::try_from(self.tag())
    }

    /// Returns the word's span if it carries `expected`.
    pub fn expect(self, expected: ValueType) -> Result<(u32, u32)> {
        let (tag, offset, size) = unpack(self.0);
        if tag != expected.tag() {
            return Err(WireError::TypeMismatch {
                expected,
                actual: tag,
            });
        }
        Ok((offset, size))
    }
}

impl From<PackedWord> for u64 {
    fn from(word: PackedWord) -> u64 {
        word.0
    }
}

impl fmt::Debug for PackedWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (tag, offset, size) = unpack(self.0);
        f.debug_struct("PackedWord")
            .field("tag", &tag)
            .field("offset", &offset)
            .field("size", &size)
            .finish()
    }
}

/// A packed word tagged [`ValueType::Pack`]: its span holds `size / 8`
/// further packed words.
///
/// Zero is the "no results" handle returned by functions that declare none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MultiPackedWord(PackedWord);

impl MultiPackedWord {
    pub const EMPTY: MultiPackedWord = MultiPackedWord(PackedWord(0));

    /// Packs the span of an already written word array.
    pub fn new(offset: u32, size: u32) -> Result<Self> {
        PackedWord::new(ValueType::Pack, offset, size).map(Self)
    }

    /// Wraps a raw stack value, checking the `Pack` tag. Zero is accepted
    /// as [`MultiPackedWord::EMPTY`].
    pub fn from_raw(word: u64) -> Result<Self> {
        if word == 0 {
            return Ok(Self::EMPTY);
        }
        let packed = PackedWord::from_raw(word);
        packed.expect(ValueType::Pack)?;
        Ok(Self(packed))
    }

    pub fn is_empty(self) -> bool {
        self.0.raw() == 0
    }

    pub fn raw(self) -> u64 {
        self.0.raw()
    }

    pub fn offset(self) -> u32 {
        self.0.offset()
    }

    pub fn size(self) -> u32 {
        self.0.size()
    }

    /// Number of words in the array.
    pub fn len(self) -> usize {
        (self.0.size() / WORD_SIZE) as usize
    }

    pub fn as_word(self) -> PackedWord {
        self.0
    }
}

/// Lays out words as the little-endian array a `Pack` span points at.
pub fn words_to_bytes(words: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * WORD_SIZE as usize);
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// Inverse of [`words_to_bytes`]. Trailing bytes that do not fill a whole
/// word are ignored.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(WORD_SIZE as usize)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            u64::from_le_bytes(buf)
        })
        .collect()
}
