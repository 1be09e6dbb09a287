//! Guest side of the packwire protocol.
//!
//! Modules pass values to host functions as packed words pointing into
//! their own memory, and get a single `Pack` word back that lists the
//! results:
//!
//! ```ignore
//! use packwire_guest::{arg, results, release, Value};
//!
//! #[link(wasm_import_module = "demo")]
//! extern "C" {
//!     fn greet(name: u64) -> u64;
//! }
//!
//! #[no_mangle]
//! pub extern "C" fn run(name: u64) -> u64 {
//!     let name = packwire_guest::read_string(packwire_guest::PackedWord::from_raw(name))
//!         .unwrap_or_default();
//!     let reply = unsafe { greet(arg(name)) };
//!     let values = results(reply).unwrap_or_default();
//!     release(reply);
//!     packwire_guest::ret(&values).map(|m| m.raw()).unwrap_or(0)
//! }
//! ```
//!
//! Parameters handed to a host function are freed by the host once the
//! call returns. Values the host passes in as arguments, and results of
//! host functions registered with guest-owned results, belong to the
//! module: release them with [`free`] or [`release`].

pub mod address;
pub mod alloc;
pub mod error;

#[cfg(all(
    target_arch = "wasm32",
    target_os = "unknown",
    feature = "allocator-exports"
))]
mod exports;

use packwire::{bytes_to_words, words_to_bytes, WireError, MAX_SIZE};

pub use address::Address;
pub use error::{GuestError, Result};
pub use packwire::{MultiPackedWord, PackedWord, Value, ValueType};

/// Packs `value` for a host call. Returns 0 when it can't be allocated,
/// which the host reads as an empty span.
pub fn arg(value: impl Into<Value>) -> u64 {
    alloc_pack(&value.into()).map(PackedWord::raw).unwrap_or(0)
}

/// Copies `value` into a fresh block and packs its span.
pub fn alloc_pack(value: &Value) -> Result<PackedWord> {
    let size = value.wire_size()?;
    let address = alloc::malloc(size)?;
    if let Err(err) = alloc::write(address, &value.to_bytes()) {
        alloc::free(address);
        return Err(err);
    }
    Ok(PackedWord::new(value.value_type(), address.get(), size)?)
}

/// Reads the value behind `word`, typed by its own tag.
pub fn read_value(word: PackedWord) -> Result<Value> {
    let ty = word.value_type()?;
    let bytes = alloc::read(Address::new(word.offset()), word.size())?;
    Ok(Value::from_bytes(ty, &bytes)?)
}

fn read_typed(word: PackedWord, ty: ValueType) -> Result<Value> {
    let (offset, size) = word.expect(ty)?;
    let bytes = alloc::read(Address::new(offset), size)?;
    Ok(Value::from_bytes(ty, &bytes)?)
}

pub fn read_bytes(word: PackedWord) -> Result<Vec<u8>> {
    let (offset, size) = word.expect(ValueType::Bytes)?;
    alloc::read(Address::new(offset), size)
}

pub fn read_byte(word: PackedWord) -> Result<u8> {
    Ok(read_typed(word, ValueType::Byte)?.as_byte().unwrap_or_default())
}

pub fn read_i32(word: PackedWord) -> Result<u32> {
    Ok(read_typed(word, ValueType::I32)?.as_u32().unwrap_or_default())
}

pub fn read_i64(word: PackedWord) -> Result<u64> {
    Ok(read_typed(word, ValueType::I64)?.as_u64().unwrap_or_default())
}

pub fn read_f32(word: PackedWord) -> Result<f32> {
    Ok(read_typed(word, ValueType::F32)?.as_f32().unwrap_or_default())
}

pub fn read_f64(word: PackedWord) -> Result<f64> {
    Ok(read_typed(word, ValueType::F64)?.as_f64().unwrap_or_default())
}

pub fn read_string(word: PackedWord) -> Result<String> {
    let (offset, size) = word.expect(ValueType::String)?;
    let bytes = alloc::read(Address::new(offset), size)?;
    String::from_utf8(bytes).map_err(|e| WireError::InvalidUtf8(e.to_string()).into())
}

/// Packs `values` as the result of an exported function.
///
/// On failure every block allocated so far is released again.
pub fn ret(values: &[Value]) -> Result<MultiPackedWord> {
    let mut words = Vec::with_capacity(values.len());
    for value in values {
        match alloc_pack(value) {
            Ok(word) => words.push(word),
            Err(err) => {
                free(&words);
                return Err(err);
            }
        }
    }

    let raw: Vec<u64> = words.iter().map(|w| w.raw()).collect();
    let bytes = words_to_bytes(&raw);
    let Some(size) = u32::try_from(bytes.len()).ok().filter(|&s| s <= MAX_SIZE) else {
        free(&words);
        return Err(WireError::SizeOverflow {
            size: bytes.len() as u64,
        }
        .into());
    };
    let address = match alloc::malloc(size) {
        Ok(address) => address,
        Err(err) => {
            free(&words);
            return Err(err);
        }
    };
    if let Err(err) = alloc::write(address, &bytes) {
        free(&words);
        alloc::free(address);
        return Err(err);
    }
    Ok(MultiPackedWord::new(address.get(), size)?)
}

/// The inner words of a `Pack` word. Nothing is freed; 0 reads as empty.
pub fn read_multi(word: u64) -> Result<Vec<PackedWord>> {
    if word == 0 {
        return Ok(Vec::new());
    }
    let multi = MultiPackedWord::from_raw(word).map_err(|_| GuestError::NotAPackedArray {
        tag: PackedWord::from_raw(word).tag(),
    })?;
    let bytes = alloc::read(Address::new(multi.offset()), multi.size())?;
    Ok(bytes_to_words(&bytes)
        .into_iter()
        .map(PackedWord::from_raw)
        .collect())
}

/// Reads every value a host function returned, in order.
pub fn results(word: u64) -> Result<Vec<Value>> {
    read_multi(word)?.into_iter().map(read_value).collect()
}

/// Frees the blocks behind `words`.
pub fn free(words: &[PackedWord]) {
    for word in words {
        alloc::free(Address::new(word.offset()));
    }
}

/// Frees a `Pack` word: every value it lists, then the array itself.
pub fn release(word: u64) {
    if let Ok(words) = read_multi(word) {
        free(&words);
        alloc::free(Address::new(PackedWord::from_raw(word).offset()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip_through_module_memory() {
        let word = alloc_pack(&Value::from("hello")).unwrap();
        assert_eq!(word.value_type().unwrap(), ValueType::String);
        assert_eq!(read_string(word).unwrap(), "hello");
        free(&[word]);
    }

    #[test]
    fn typed_readers_check_the_tag() {
        let word = PackedWord::from_raw(arg(7u32));
        assert_eq!(read_i32(word).unwrap(), 7);
        assert!(matches!(
            read_i64(word),
            Err(GuestError::Wire(packwire::WireError::TypeMismatch { .. }))
        ));
        free(&[word]);
    }

    #[test]
    fn ret_and_results_preserve_order() {
        let before = alloc::live_allocations();
        let multi = ret(&[Value::I32(1), Value::F64(2.5), Value::Byte(3)]).unwrap();
        assert_eq!(multi.len(), 3);

        let values = results(multi.raw()).unwrap();
        assert_eq!(values, vec![Value::I32(1), Value::F64(2.5), Value::Byte(3)]);

        release(multi.raw());
        assert_eq!(alloc::live_allocations(), before);
    }

    #[test]
    fn empty_result_word_reads_as_nothing() {
        assert!(read_multi(0).unwrap().is_empty());
        assert!(results(0).unwrap().is_empty());
    }

    #[test]
    fn plain_words_are_not_packed_arrays() {
        let word = arg(1.5f64);
        assert!(matches!(
            read_multi(word),
            Err(GuestError::NotAPackedArray { tag: 5 })
        ));
        free(&[PackedWord::from_raw(word)]);
    }

    #[test]
    fn bytes_and_byte_are_distinct() {
        let bytes = PackedWord::from_raw(arg(vec![9u8]));
        let byte = PackedWord::from_raw(arg(9u8));
        assert_eq!(bytes.value_type().unwrap(), ValueType::Bytes);
        assert_eq!(byte.value_type().unwrap(), ValueType::Byte);
        assert_eq!(read_bytes(bytes).unwrap(), vec![9]);
        assert_eq!(read_byte(byte).unwrap(), 9);
        free(&[bytes, byte]);
    }
}
