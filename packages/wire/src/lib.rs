//! Wire format shared by packwire hosts and guests.
//!
//! Every value that crosses the host/guest boundary travels as a single
//! 64-bit [`PackedWord`]:
//!
//! ```text
//! bits 63..56 : type tag   (u8, see ValueType)
//! bits 55..24 : offset     (u32, guest linear-memory address)
//! bits 23..0  : size       (u24, byte length; max 16,777,215)
//! ```
//!
//! Scalars are stored little-endian at `offset`. A word tagged
//! [`ValueType::Pack`] (a [`MultiPackedWord`]) locates a little-endian array
//! of further packed words, which is how several values travel behind one
//! stack slot.
//!
//! Host and guest are compiled independently, so both sides must link the
//! same [`WIRE_FORMAT_VERSION`].

mod error;
mod pack;
mod types;
mod value;

pub use error::{Result, WireError};
pub use pack::{
    bytes_to_words, pack, unpack, words_to_bytes, MultiPackedWord, PackedWord, MAX_SIZE, WORD_SIZE,
};
pub use types::ValueType;
pub use value::Value;

/// Version of the bit layout and tag numbering implemented by this crate.
pub const WIRE_FORMAT_VERSION: u32 = 1;
