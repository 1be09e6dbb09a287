//! The module's allocator and raw memory access.
//!
//! Every pointer conversion in the crate lives here. On wasm32 blocks come
//! from the global allocator with an 8-byte size header in front, so `free`
//! only needs the offset. Native builds (tests) use a per-thread arena that
//! stands in for linear memory.

use crate::address::Address;
use crate::error::{GuestError, Result};

/// Allocates `size` bytes. Blocks are 8-byte aligned.
pub fn malloc(size: u32) -> Result<Address> {
    imp::malloc(size)
        .map(Address::new)
        .ok_or(GuestError::OutOfMemory { size })
}

/// No block starts below this offset: the first 8 bytes hold either
/// nothing (native arena) or a block header (wasm32).
const FIRST_BLOCK: u32 = 8;

/// Releases a block from [`malloc`]. Null and offsets below the first
/// block are ignored.
pub fn free(address: Address) {
    if address.get() >= FIRST_BLOCK {
        imp::free(address.get());
    }
}

/// Copies `len` bytes out of memory.
pub fn read(address: Address, len: u32) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    check_span(address, len)?;
    Ok(imp::read(address.get(), len))
}

pub fn write(address: Address, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let len = u32::try_from(bytes.len()).map_err(|_| GuestError::OutOfBounds {
        offset: address.get(),
        len: u32::MAX,
        memory_size: imp::memory_size() as u64,
    })?;
    check_span(address, len)?;
    imp::write(address.get(), bytes);
    Ok(())
}

fn check_span(address: Address, len: u32) -> Result<()> {
    let memory_size = imp::memory_size() as u64;
    if address.is_null() || address.get() as u64 + len as u64 > memory_size {
        return Err(GuestError::OutOfBounds {
            offset: address.get(),
            len,
            memory_size,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn live_allocations() -> usize {
    imp::live_allocations()
}

#[cfg(target_arch = "wasm32")]
mod imp {
    use std::alloc::{alloc, dealloc, Layout};

    const HEADER: usize = 8;
    const ALIGN: usize = 8;
    const PAGE_SIZE: usize = 64 * 1024;

    pub(super) fn malloc(size: u32) -> Option<u32> {
        let total = HEADER.checked_add(size as usize)?;
        let layout = Layout::from_size_align(total, ALIGN).ok()?;
        // SAFETY: the layout is never zero-sized because of the header.
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return None;
        }
        // SAFETY: `base` is valid for `total >= 8` bytes and 8-aligned.
        unsafe { (base as *mut u64).write(total as u64) };
        Some((base as usize + HEADER) as u32)
    }

    pub(super) fn free(offset: u32) {
        let Some(base) = (offset as usize).checked_sub(HEADER) else {
            return;
        };
        let base = base as *mut u8;
        // SAFETY: `offset` came from `malloc`, which stored the block size
        // in the header right before it.
        unsafe {
            let total = (base as *const u64).read() as usize;
            dealloc(base, Layout::from_size_align_unchecked(total, ALIGN));
        }
    }

    pub(super) fn memory_size() -> usize {
        core::arch::wasm32::memory_size(0) * PAGE_SIZE
    }

    pub(super) fn read(offset: u32, len: u32) -> Vec<u8> {
        // SAFETY: the span was bounds-checked against linear memory and is
        // non-null.
        unsafe { std::slice::from_raw_parts(offset as usize as *const u8, len as usize).to_vec() }
    }

    pub(super) fn write(offset: u32, bytes: &[u8]) {
        // SAFETY: as for `read`; the source is a Rust slice so the two
        // regions cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), offset as usize as *mut u8, bytes.len())
        }
    }

    #[cfg(test)]
    pub(super) fn live_allocations() -> usize {
        0
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod imp {
    use std::cell::RefCell;
    use std::collections::HashMap;

    const ARENA_SIZE: usize = 1 << 20;
    const HEAP_START: usize = super::FIRST_BLOCK as usize;

    struct Arena {
        memory: Vec<u8>,
        next: usize,
        live: HashMap<u32, u32>,
    }

    thread_local! {
        static ARENA: RefCell<Arena> = RefCell::new(Arena {
            memory: vec![0; ARENA_SIZE],
            next: HEAP_START,
            live: HashMap::new(),
        });
    }

    pub(super) fn malloc(size: u32) -> Option<u32> {
        ARENA.with(|arena| {
            let mut arena = arena.borrow_mut();
            let offset = arena.next;
            let end = offset.checked_add(size.max(1) as usize)?;
            if end > ARENA_SIZE {
                return None;
            }
            arena.next = (end + 7) & !7;
            arena.live.insert(offset as u32, size);
            Some(offset as u32)
        })
    }

    pub(super) fn free(offset: u32) {
        ARENA.with(|arena| {
            arena.borrow_mut().live.remove(&offset);
        })
    }

    pub(super) fn memory_size() -> usize {
        ARENA_SIZE
    }

    pub(super) fn read(offset: u32, len: u32) -> Vec<u8> {
        let start = offset as usize;
        ARENA.with(|arena| arena.borrow().memory[start..start + len as usize].to_vec())
    }

    pub(super) fn write(offset: u32, bytes: &[u8]) {
        let start = offset as usize;
        ARENA.with(|arena| {
            arena.borrow_mut().memory[start..start + bytes.len()].copy_from_slice(bytes)
        })
    }

    #[cfg(test)]
    pub(super) fn live_allocations() -> usize {
        ARENA.with(|arena| arena.borrow().live.len())
    }
}
