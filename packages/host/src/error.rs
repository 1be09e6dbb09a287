use packwire::{ValueType, WireError};
use thiserror::Error;

/// Errors raised by the host side of the protocol.
///
/// Protocol violations (count/type/tag mismatches, size overflow, a failing
/// callback) leave guest memory consistent. Memory-boundary and engine
/// failures do not; see [`BridgeError::is_fatal`].
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("{function}: params mismatch expected: {expected} received: {received}")]
    ParamCountMismatch {
        function: String,
        expected: usize,
        received: usize,
    },

    #[error("{function}: param {index} declared as {expected}, got {actual}")]
    ParamTypeMismatch {
        function: String,
        index: usize,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("{function}: return value mismatch expected: {expected} received: {received}")]
    ResultCountMismatch {
        function: String,
        expected: usize,
        received: usize,
    },

    #[error("{function}: result {index} declared as {expected}, got {actual}")]
    ResultTypeMismatch {
        function: String,
        index: usize,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("{function}: invalid signature, {reason}")]
    InvalidSignature { function: String, reason: String },

    #[error("memory read ({offset}, {len}) out of range of memory size {memory_size}")]
    ReadOutOfRange {
        offset: u32,
        len: u32,
        memory_size: u64,
    },

    #[error("memory write ({offset}, {len}) out of range of memory size {memory_size}")]
    WriteOutOfRange {
        offset: u32,
        len: usize,
        memory_size: u64,
    },

    #[error("can't unpack guest data, expected a pack word but got tag {tag}")]
    NotAPackedArray { tag: u8 },

    #[error("can't allocate {size} bytes of guest memory")]
    Allocation { size: u32 },

    #[error("exported function `{0}` does not exist")]
    MissingExport(String),

    #[error("module does not export a linear memory")]
    MissingMemory,

    #[error("error invoking guest function `{function}`: {reason}")]
    Call { function: String, reason: String },

    #[error("host function `{function}` failed")]
    Callback {
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("the hashes are not equal. needed {expected}, actual {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("engine error: {0}")]
    Engine(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the guest's memory state can no longer be trusted.
    ///
    /// Fatal errors abort the guest call; the rest complete it with
    /// degraded output.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidSignature { .. }
                | BridgeError::ReadOutOfRange { .. }
                | BridgeError::WriteOutOfRange { .. }
                | BridgeError::Allocation { .. }
                | BridgeError::MissingExport(_)
                | BridgeError::MissingMemory
                | BridgeError::Call { .. }
                | BridgeError::Engine(_)
        )
    }

    pub(crate) fn engine(err: impl std::fmt::Display) -> Self {
        BridgeError::Engine(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
