use packwire::WireError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("can't unpack host data, expected a pack word but got tag {tag}")]
    NotAPackedArray { tag: u8 },

    #[error("span ({offset}, {len}) is outside linear memory of {memory_size} bytes")]
    OutOfBounds {
        offset: u32,
        len: u32,
        memory_size: u64,
    },

    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: u32 },
}

pub type Result<T> = std::result::Result<T, GuestError>;
