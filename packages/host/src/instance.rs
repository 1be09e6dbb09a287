use crate::error::Result;

/// The engine primitives the protocol needs from one guest instance.
///
/// Offsets are whatever the guest's own `malloc` handed out; the protocol
/// never computes addresses itself. One instance is driven by one caller at
/// a time.
pub trait GuestInstance {
    /// Name used to identify the instance in logs.
    fn module_name(&self) -> &str;

    /// Copies `len` bytes starting at `offset` out of linear memory.
    ///
    /// Spans past the end of memory fail with `ReadOutOfRange`.
    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>>;

    /// Copies `bytes` into linear memory at `offset`.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()>;

    /// Calls an exported function with raw stack values.
    ///
    /// Returns the single result slot, or `None` for functions without
    /// results.
    fn call(&mut self, function: &str, args: &[u64]) -> Result<Option<u64>>;

    /// Parameter count of an export, `None` when it does not exist.
    fn export_arity(&mut self, function: &str) -> Option<usize>;

    /// Current size of linear memory in bytes.
    fn memory_size(&mut self) -> u64;
}
