//! wasmtime-backed guest instances.

use std::sync::Arc;

use tracing::info;
use wasmtime::{
    AsContext, AsContextMut, Caller, Extern, Func, Instance, Memory, Store, StoreLimits, Val,
    ValType,
};
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::error::{BridgeError, Result};
use crate::guest_function::GuestFunction;
use crate::host_function::HostFunction;
use crate::instance::GuestInstance;
use crate::memory::GuestMemory;

const MEMORY_EXPORT: &str = "memory";

/// Per-store data.
pub(crate) struct StoreState {
    pub(crate) namespace: String,
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
}

/// An instantiated guest module.
pub struct Module {
    store: Store<StoreState>,
    instance: Instance,
    host_functions: Vec<Arc<HostFunction>>,
}

impl Module {
    pub(crate) fn new(
        store: Store<StoreState>,
        instance: Instance,
        host_functions: Vec<Arc<HostFunction>>,
    ) -> Self {
        Self {
            store,
            instance,
            host_functions,
        }
    }

    pub fn name(&self) -> &str {
        &self.store.data().namespace
    }

    pub fn memory(&mut self) -> GuestMemory<'_> {
        GuestMemory::new(self)
    }

    pub fn guest_function(&mut self, name: &str) -> GuestFunction<'_> {
        GuestFunction::new(self, name)
    }

    /// Registered host function by import name, e.g. to inspect its
    /// outstanding allocations.
    pub fn host_function(&self, name: &str) -> Option<&HostFunction> {
        self.host_functions
            .iter()
            .find(|f| f.name() == name)
            .map(|f| f.as_ref())
    }

    /// Drops the instance and its store.
    pub fn close(self) {
        info!(module = self.name(), "closing module");
    }

    fn linear_memory(&mut self) -> Result<Memory> {
        self.instance
            .get_memory(&mut self.store, MEMORY_EXPORT)
            .ok_or(BridgeError::MissingMemory)
    }
}

impl GuestInstance for Module {
    fn module_name(&self) -> &str {
        self.name()
    }

    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let memory = self.linear_memory()?;
        read_memory(&self.store, memory, offset, len)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let memory = self.linear_memory()?;
        write_memory(&mut self.store, memory, offset, bytes)
    }

    fn call(&mut self, function: &str, args: &[u64]) -> Result<Option<u64>> {
        let func = self
            .instance
            .get_func(&mut self.store, function)
            .ok_or_else(|| BridgeError::MissingExport(function.to_string()))?;
        call_func(&mut self.store, func, function, args)
    }

    fn export_arity(&mut self, function: &str) -> Option<usize> {
        let func = self.instance.get_func(&mut self.store, function)?;
        Some(func.ty(&self.store).params().len())
    }

    fn memory_size(&mut self) -> u64 {
        match self.linear_memory() {
            Ok(memory) => memory.data_size(&self.store) as u64,
            Err(_) => 0,
        }
    }
}

/// The calling instance, seen from inside a host function.
pub(crate) struct CallerInstance<'a, 'c> {
    caller: &'a mut Caller<'c, StoreState>,
}

impl<'a, 'c> CallerInstance<'a, 'c> {
    pub(crate) fn new(caller: &'a mut Caller<'c, StoreState>) -> Self {
        Self { caller }
    }

    fn linear_memory(&mut self) -> Result<Memory> {
        self.caller
            .get_export(MEMORY_EXPORT)
            .and_then(Extern::into_memory)
            .ok_or(BridgeError::MissingMemory)
    }

    fn func(&mut self, name: &str) -> Option<Func> {
        self.caller.get_export(name).and_then(Extern::into_func)
    }
}

impl GuestInstance for CallerInstance<'_, '_> {
    fn module_name(&self) -> &str {
        &self.caller.data().namespace
    }

    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let memory = self.linear_memory()?;
        read_memory(&*self.caller, memory, offset, len)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let memory = self.linear_memory()?;
        write_memory(&mut *self.caller, memory, offset, bytes)
    }

    fn call(&mut self, function: &str, args: &[u64]) -> Result<Option<u64>> {
        let func = self
            .func(function)
            .ok_or_else(|| BridgeError::MissingExport(function.to_string()))?;
        call_func(&mut *self.caller, func, function, args)
    }

    fn export_arity(&mut self, function: &str) -> Option<usize> {
        let func = self.func(function)?;
        Some(func.ty(&*self.caller).params().len())
    }

    fn memory_size(&mut self) -> u64 {
        match self.linear_memory() {
            Ok(memory) => memory.data_size(&*self.caller) as u64,
            Err(_) => 0,
        }
    }
}

fn read_memory(store: impl AsContext, memory: Memory, offset: u32, len: u32) -> Result<Vec<u8>> {
    let memory_size = memory.data_size(&store) as u64;
    if offset as u64 + len as u64 > memory_size {
        return Err(BridgeError::ReadOutOfRange {
            offset,
            len,
            memory_size,
        });
    }
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&store, offset as usize, &mut buf)
        .map_err(BridgeError::engine)?;
    Ok(buf)
}

fn write_memory(
    mut store: impl AsContextMut,
    memory: Memory,
    offset: u32,
    bytes: &[u8],
) -> Result<()> {
    let memory_size = memory.data_size(&store) as u64;
    if offset as u64 + bytes.len() as u64 > memory_size {
        return Err(BridgeError::WriteOutOfRange {
            offset,
            len: bytes.len(),
            memory_size,
        });
    }
    memory
        .write(&mut store, offset as usize, bytes)
        .map_err(BridgeError::engine)
}

/// Calls `func` with raw words, converted to the export's declared integer
/// widths. An i32 result is zero-extended.
fn call_func(mut store: impl AsContextMut, func: Func, name: &str, args: &[u64]) -> Result<Option<u64>> {
    let ty = func.ty(&store);
    if ty.params().len() != args.len() {
        return Err(BridgeError::ParamCountMismatch {
            function: name.to_string(),
            expected: ty.params().len(),
            received: args.len(),
        });
    }

    let params = ty
        .params()
        .zip(args)
        .map(|(param, &arg)| match param {
            ValType::I32 => Ok(Val::I32(arg as u32 as i32)),
            ValType::I64 => Ok(Val::I64(arg as i64)),
            other => Err(BridgeError::Call {
                function: name.to_string(),
                reason: format!("unsupported parameter type {other:?}"),
            }),
        })
        .collect::<Result<Vec<_>>>()?;
    let mut results: Vec<Val> = ty
        .results()
        .map(|result| match result {
            ValType::I32 => Val::I32(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            _ => Val::I64(0),
        })
        .collect();

    func.call(&mut store, &params, &mut results)
        .map_err(|err| BridgeError::Call {
            function: name.to_string(),
            reason: format!("{err:#}"),
        })?;

    match results.first() {
        None => Ok(None),
        Some(Val::I32(v)) => Ok(Some(*v as u32 as u64)),
        Some(Val::I64(v)) => Ok(Some(*v as u64)),
        Some(other) => Err(BridgeError::Call {
            function: name.to_string(),
            reason: format!("unsupported result {other:?}"),
        }),
    }
}
