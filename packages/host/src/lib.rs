//! Host side of the packwire protocol.
//!
//! A guest module and its host only share the guest's linear memory and
//! 64-bit stack slots. This crate moves typed [`Value`]s across that
//! boundary as [`PackedWord`]s:
//!
//! - [`HostFunction`] bridges a guest call into user logic: it decodes the
//!   packed parameters, runs the callback, packs the results behind one
//!   [`MultiPackedWord`] and frees every allocation it registered for the
//!   call.
//! - [`GuestFunction`] goes the other way: it writes host arguments into
//!   guest memory, invokes an export and hands back a one-shot
//!   [`GuestResult`].
//! - [`Runtime`] / [`Module`] wire both into wasmtime.
//!
//! Everything that touches guest memory goes through the [`GuestInstance`]
//! trait, so the protocol is independent of the engine behind it.
//!
//! ```no_run
//! use packwire_host::{HostFunction, ModuleConfig, Runtime, RuntimeConfig, Value, ValueType, Wasm};
//!
//! # fn main() -> packwire_host::Result<()> {
//! let greet = HostFunction::new(
//!     "greet",
//!     &[ValueType::String],
//!     &[ValueType::String],
//!     |_call, params| {
//!         let name = params[0].value.as_str().unwrap_or_default().to_owned();
//!         Ok(vec![Value::String(format!("hello {name}"))])
//!     },
//! );
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! runtime.init_logging();
//! let wasm = std::fs::read("guest.wasm").expect("guest binary");
//! let mut module = runtime.new_module(
//!     ModuleConfig::new("demo", Wasm::new(wasm)).with_host_function(greet),
//! )?;
//! let values = module.guest_function("run").invoke(&[Value::from("world")])?.read()?;
//! # let _ = values;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod guest_function;
pub mod host_function;
pub mod instance;
pub mod logging;
pub mod memory;
pub mod module;
pub mod runtime;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{FsConfig, LogSeverity, ModuleConfig, RuntimeConfig, WasiConfig, Wasm};
pub use error::{BridgeError, Result};
pub use guest_function::{GuestFunction, GuestResult};
pub use host_function::{HostCall, HostFunction, Param, ResultOwnership};
pub use instance::GuestInstance;
pub use memory::GuestMemory;
pub use module::Module;
pub use packwire::{MultiPackedWord, PackedWord, Value, ValueType};
pub use runtime::Runtime;
pub use tracker::AllocationTracker;
