//! `malloc` / `free` exports the host allocates through.
//!
//! Only built for wasm32-unknown-unknown. On WASI targets libc already
//! defines these symbols; export them from there with
//! `-C link-arg=--export=malloc -C link-arg=--export=free` instead.

use crate::address::Address;
use crate::alloc;

#[export_name = "malloc"]
pub extern "C" fn packwire_malloc(size: u32) -> u32 {
    alloc::malloc(size).map(Address::get).unwrap_or(0)
}

#[export_name = "free"]
pub extern "C" fn packwire_free(offset: u32) {
    alloc::free(Address::new(offset));
}
