//! Typed access to a guest's linear memory.

use packwire::{bytes_to_words, words_to_bytes, MultiPackedWord, PackedWord, Value, ValueType};
use tracing::{debug, error};

use crate::error::{BridgeError, Result};
use crate::instance::GuestInstance;

pub(crate) const MALLOC: &str = "malloc";
pub(crate) const FREE: &str = "free";

/// Reads, writes and allocates in one guest's memory.
///
/// Allocation goes through the guest's exported `malloc` / `free`; every
/// other access is a plain copy through the engine.
pub struct GuestMemory<'a> {
    instance: &'a mut dyn GuestInstance,
}

impl<'a> GuestMemory<'a> {
    pub fn new(instance: &'a mut dyn GuestInstance) -> Self {
        Self { instance }
    }

    /// Size of linear memory in bytes, e.g. 65536 for a single page.
    pub fn size(&mut self) -> u64 {
        self.instance.memory_size()
    }

    /// Allocates `size` bytes with the guest's `malloc`.
    ///
    /// Always free what you allocate; nothing here tracks it.
    pub fn malloc(&mut self, size: u32) -> Result<u32> {
        let offset = self
            .instance
            .call(MALLOC, &[size as u64])?
            .ok_or(BridgeError::Allocation { size })?;
        // A null block is only acceptable for empty requests.
        if offset == 0 && size > 0 {
            error!(module = self.instance.module_name(), size, "guest malloc returned null");
            return Err(BridgeError::Allocation { size });
        }
        Ok(offset as u32)
    }

    /// Releases a block previously returned by [`GuestMemory::malloc`].
    pub fn free(&mut self, offset: u32) -> Result<()> {
        self.instance.call(FREE, &[offset as u64])?;
        Ok(())
    }

    /// Frees the span a packed word points at.
    pub fn free_word(&mut self, word: PackedWord) -> Result<()> {
        self.free(word.offset())
    }

    pub fn read_bytes(&mut self, offset: u32, size: u32) -> Result<Vec<u8>> {
        self.instance.read(offset, size)
    }

    pub fn read_byte(&mut self, offset: u32) -> Result<u8> {
        Ok(self.read_bytes(offset, 1)?[0])
    }

    pub fn read_u32(&mut self, offset: u32) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(offset)?))
    }

    pub fn read_u64(&mut self, offset: u32) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array(offset)?))
    }

    pub fn read_f32(&mut self, offset: u32) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array(offset)?))
    }

    pub fn read_f64(&mut self, offset: u32) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array(offset)?))
    }

    pub fn read_string(&mut self, offset: u32, size: u32) -> Result<String> {
        let bytes = self.read_bytes(offset, size)?;
        Ok(String::from_utf8(bytes).map_err(|e| packwire::WireError::InvalidUtf8(e.to_string()))?)
    }

    fn read_array<const N: usize>(&mut self, offset: u32) -> Result<[u8; N]> {
        let bytes = self.read_bytes(offset, N as u32)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(&bytes);
        Ok(buf)
    }

    /// Reads the value a packed word points at, reified per its own tag.
    pub fn read_value(&mut self, word: PackedWord) -> Result<Value> {
        let ty = word.value_type()?;
        let bytes = self.read_bytes(word.offset(), word.size())?;
        Ok(Value::from_bytes(ty, &bytes)?)
    }

    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        self.instance.write(offset, bytes)
    }

    pub fn write_byte(&mut self, offset: u32, v: u8) -> Result<()> {
        self.write_bytes(offset, &[v])
    }

    pub fn write_u32(&mut self, offset: u32, v: u32) -> Result<()> {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn write_u64(&mut self, offset: u32, v: u64) -> Result<()> {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn write_f32(&mut self, offset: u32, v: f32) -> Result<()> {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn write_f64(&mut self, offset: u32, v: f64) -> Result<()> {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn write_string(&mut self, offset: u32, v: &str) -> Result<()> {
        self.write_bytes(offset, v.as_bytes())
    }

    pub fn write_value(&mut self, offset: u32, value: &Value) -> Result<()> {
        match value {
            Value::Bytes(b) => self.write_bytes(offset, b),
            Value::Byte(v) => self.write_byte(offset, *v),
            Value::I32(v) => self.write_u32(offset, *v),
            Value::I64(v) => self.write_u64(offset, *v),
            Value::F32(v) => self.write_f32(offset, *v),
            Value::F64(v) => self.write_f64(offset, *v),
            Value::String(s) => self.write_string(offset, s),
        }
    }

    /// Allocates guest memory for `value`, writes it and packs the span.
    ///
    /// The block is freed again if the write fails; on success the caller
    /// owns it.
    pub fn alloc_value(&mut self, value: &Value) -> Result<PackedWord> {
        let size = value.wire_size()?;
        let offset = self.malloc(size)?;
        if let Err(err) = self.write_value(offset, value) {
            self.free_quietly(offset);
            return Err(err);
        }
        Ok(PackedWord::new(value.value_type(), offset, size)?)
    }

    /// Writes `words` as one contiguous array and packs it with the `Pack`
    /// tag. The caller owns the array block.
    pub fn alloc_multi(&mut self, words: &[PackedWord]) -> Result<MultiPackedWord> {
        let raw: Vec<u64> = words.iter().map(|w| w.raw()).collect();
        let bytes = words_to_bytes(&raw);
        let size = u32::try_from(bytes.len()).map_err(|_| packwire::WireError::SizeOverflow {
            size: bytes.len() as u64,
        })?;
        // Reject before allocating so an oversized array leaks nothing.
        if size > packwire::MAX_SIZE {
            return Err(packwire::WireError::SizeOverflow { size: size as u64 }.into());
        }
        let offset = self.malloc(size)?;
        if let Err(err) = self.write_bytes(offset, &bytes) {
            self.free_quietly(offset);
            return Err(err);
        }
        Ok(MultiPackedWord::new(offset, size)?)
    }

    /// Reads the inner words of a `Pack` word without freeing anything.
    pub fn read_multi(&mut self, word: u64) -> Result<Vec<PackedWord>> {
        let packed = PackedWord::from_raw(word);
        if packed.tag() != ValueType::Pack.tag() {
            return Err(BridgeError::NotAPackedArray { tag: packed.tag() });
        }
        let bytes = self.read_bytes(packed.offset(), packed.size())?;
        Ok(bytes_to_words(&bytes)
            .into_iter()
            .map(PackedWord::from_raw)
            .collect())
    }

    pub(crate) fn free_quietly(&mut self, offset: u32) {
        if let Err(err) = self.free(offset) {
            debug!(module = self.instance.module_name(), offset, %err, "can't free guest block");
        }
    }

    pub(crate) fn module_name(&self) -> &str {
        self.instance.module_name()
    }
}
