//! Guest-to-host calls.
//!
//! A guest calls an imported function with one packed word per parameter.
//! [`HostFunction::invoke`] turns those words into [`Param`]s, runs the
//! user callback, writes the results back into guest memory behind a single
//! [`MultiPackedWord`] and finally frees every block the call registered.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use packwire::{MultiPackedWord, PackedWord, Value, ValueType};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::guest_function::GuestFunction;
use crate::instance::GuestInstance;
use crate::memory::GuestMemory;
use crate::tracker::AllocationTracker;

/// A decoded parameter and the guest span it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub offset: u32,
    pub size: u32,
    pub value: Value,
}

/// Who frees result memory once the host function returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultOwnership {
    /// Results are freed together with the parameters at the end of the
    /// call. Guests that need the values must copy them out of the returned
    /// array before their memory is reused.
    #[default]
    Released,
    /// Results are handed over to the guest, which frees them after reading.
    Guest,
}

type HostCallback = dyn Fn(&mut HostCall<'_>, Vec<Param>) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// A host function exposed to guests under the module namespace.
pub struct HostFunction {
    name: String,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    callback: Arc<HostCallback>,
    allocations: AllocationTracker,
    ownership: ResultOwnership,
}

impl HostFunction {
    pub fn new<F>(
        name: impl Into<String>,
        params: &[ValueType],
        results: &[ValueType],
        callback: F,
    ) -> Self
    where
        F: Fn(&mut HostCall<'_>, Vec<Param>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.to_vec(),
            results: results.to_vec(),
            callback: Arc::new(callback),
            allocations: AllocationTracker::new(),
            ownership: ResultOwnership::Released,
        }
    }

    /// Leaves result blocks to the guest instead of freeing them.
    pub fn guest_owned_results(mut self) -> Self {
        self.ownership = ResultOwnership::Guest;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    pub fn ownership(&self) -> ResultOwnership {
        self.ownership
    }

    /// Outstanding allocations of in-flight calls.
    pub fn allocations(&self) -> &AllocationTracker {
        &self.allocations
    }

    /// Rejects `Pack` in the declared params or results.
    ///
    /// `Pack` only ever describes the array a call returns; a single value
    /// can't carry it.
    pub fn check_signature(&self) -> Result<()> {
        let declared = self
            .params
            .iter()
            .map(|ty| ("param", ty))
            .chain(self.results.iter().map(|ty| ("result", ty)));
        for (position, &ty) in declared {
            if ty == ValueType::Pack {
                return Err(BridgeError::InvalidSignature {
                    function: self.name.clone(),
                    reason: format!("{position} declared as {ty:?}"),
                });
            }
        }
        Ok(())
    }

    /// Runs one guest call: decode, callback, encode, cleanup.
    ///
    /// Returns the raw word for the guest's single result slot. Cleanup runs
    /// even when an earlier step failed; the earlier error wins.
    pub fn invoke(&self, instance: &mut dyn GuestInstance, stack: &[u64]) -> Result<u64> {
        self.check_signature()?;
        let mut registered = Vec::new();
        let outcome = self.run(instance, stack, &mut registered);
        let cleanup = self.release(instance, &registered);

        match (outcome, cleanup) {
            (Ok(word), Ok(())) => Ok(word),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(
                        module = instance.module_name(),
                        function = %self.name,
                        error = %cleanup_err,
                        "cleanup failed after an earlier error"
                    );
                }
                Err(err)
            }
        }
    }

    fn run(
        &self,
        instance: &mut dyn GuestInstance,
        stack: &[u64],
        registered: &mut Vec<u32>,
    ) -> Result<u64> {
        let params = self.decode(instance, stack, registered)?;

        let mut call = HostCall {
            function: &self.name,
            instance: &mut *instance,
        };
        let values = (self.callback)(&mut call, params).map_err(|source| BridgeError::Callback {
            function: self.name.clone(),
            source,
        })?;

        let results_from = registered.len();
        let multi = self.encode(instance, values, registered)?;
        if self.ownership == ResultOwnership::Guest {
            for offset in registered.drain(results_from..) {
                self.allocations.delete(offset);
            }
        }
        Ok(multi.raw())
    }

    fn decode(
        &self,
        instance: &mut dyn GuestInstance,
        stack: &[u64],
        registered: &mut Vec<u32>,
    ) -> Result<Vec<Param>> {
        if stack.len() != self.params.len() {
            return Err(BridgeError::ParamCountMismatch {
                function: self.name.clone(),
                expected: self.params.len(),
                received: stack.len(),
            });
        }

        let mut memory = GuestMemory::new(instance);
        let mut params = Vec::with_capacity(stack.len());
        for (index, (&raw, &declared)) in stack.iter().zip(&self.params).enumerate() {
            let word = PackedWord::from_raw(raw);
            let bytes = memory.read_bytes(word.offset(), word.size())?;
            self.register(registered, word.offset(), word.size());

            let value = match reify(declared, word, &bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        module = memory.module_name(),
                        function = %self.name,
                        index,
                        %err,
                        "can't decode param, using zero value"
                    );
                    Value::zeroed(declared).unwrap_or(Value::Bytes(Vec::new()))
                }
            };
            params.push(Param {
                offset: word.offset(),
                size: word.size(),
                value,
            });
        }
        Ok(params)
    }

    fn encode(
        &self,
        instance: &mut dyn GuestInstance,
        values: Vec<Value>,
        registered: &mut Vec<u32>,
    ) -> Result<MultiPackedWord> {
        if self.results.is_empty() {
            if !values.is_empty() {
                warn!(
                    module = instance.module_name(),
                    function = %self.name,
                    returned = values.len(),
                    "host function declares no results, dropping returned values"
                );
            }
            return Ok(MultiPackedWord::EMPTY);
        }

        if values.len() != self.results.len() {
            return Err(BridgeError::ResultCountMismatch {
                function: self.name.clone(),
                expected: self.results.len(),
                received: values.len(),
            });
        }
        for (index, (value, &declared)) in values.iter().zip(&self.results).enumerate() {
            if value.value_type() != declared {
                return Err(BridgeError::ResultTypeMismatch {
                    function: self.name.clone(),
                    index,
                    expected: declared,
                    actual: value.value_type(),
                });
            }
            value.wire_size()?;
        }

        let mut memory = GuestMemory::new(instance);
        let mut words = Vec::with_capacity(values.len());
        for value in &values {
            let size = value.wire_size()?;
            let offset = memory.malloc(size)?;
            self.register(registered, offset, size);
            memory.write_value(offset, value)?;
            words.push(PackedWord::new(value.value_type(), offset, size)?);
        }

        let multi = memory.alloc_multi(&words)?;
        self.register(registered, multi.offset(), multi.size());
        Ok(multi)
    }

    fn register(&self, registered: &mut Vec<u32>, offset: u32, size: u32) {
        // Null spans come from empty values and own no memory.
        if offset == 0 {
            return;
        }
        self.allocations.store(offset, size);
        registered.push(offset);
    }

    /// Frees every block this call registered.
    ///
    /// The tracker is shared by all in-flight calls of the registration and
    /// keyed by offset alone, so overlapping calls on other instances may
    /// already have replaced or deleted an entry. The call-local list is
    /// the source of truth for what to free.
    fn release(&self, instance: &mut dyn GuestInstance, registered: &[u32]) -> Result<()> {
        let allocated_bytes = self.allocations.total_size();
        let mut memory = GuestMemory::new(instance);
        let mut freed = HashSet::with_capacity(registered.len());
        let mut first_err = None;

        for &offset in registered {
            if !freed.insert(offset) {
                continue;
            }
            self.allocations.delete(offset);
            if let Err(err) = memory.free(offset) {
                first_err.get_or_insert(err);
            }
        }

        debug!(
            module = memory.module_name(),
            function = %self.name,
            allocated_bytes,
            after_deallocate_bytes = self.allocations.total_size(),
            "cleanup: host func params and results"
        );

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn reify(declared: ValueType, word: PackedWord, bytes: &[u8]) -> packwire::Result<Value> {
    word.expect(declared)?;
    Value::from_bytes(declared, bytes)
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("results", &self.results)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// Context handed to a host callback: the calling instance and its memory.
pub struct HostCall<'a> {
    function: &'a str,
    instance: &'a mut dyn GuestInstance,
}

impl<'a> HostCall<'a> {
    pub fn function_name(&self) -> &str {
        self.function
    }

    pub fn module_name(&self) -> &str {
        self.instance.module_name()
    }

    pub fn memory(&mut self) -> GuestMemory<'_> {
        GuestMemory::new(&mut *self.instance)
    }

    /// Calls back into the guest that invoked this host function.
    pub fn guest_function(&mut self, name: &str) -> GuestFunction<'_> {
        GuestFunction::new(&mut *self.instance, name)
    }

    pub fn instance(&mut self) -> &mut dyn GuestInstance {
        &mut *self.instance
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;
    use std::thread;

    use super::*;
    use crate::test_support::mock::MockInstance;

    fn echo(params: Vec<ValueType>, results: Vec<ValueType>) -> HostFunction {
        HostFunction::new("echo", &params, &results, |_call, params| {
            Ok(params.into_iter().map(|p| p.value).collect())
        })
    }

    #[test]
    fn decodes_params_and_returns_packed_results() {
        let mut guest = MockInstance::new();
        let hi = guest.alloc_value(&Value::from(b"hi".to_vec()));
        let seven = guest.alloc_value(&Value::I32(7));

        let greet = HostFunction::new(
            "greet",
            &[ValueType::Bytes, ValueType::I32],
            &[ValueType::Bytes],
            |_call, params| {
                assert_eq!(params[0].value, Value::Bytes(vec![104, 105]));
                assert_eq!(params[1].value, Value::I32(7));
                Ok(vec![Value::Bytes(b"ok".to_vec())])
            },
        )
        .guest_owned_results();

        let word = greet.invoke(&mut guest, &[hi.raw(), seven.raw()]).unwrap();
        let words = guest.read_multi(word);
        assert_eq!(words.len(), 1);
        assert_eq!(guest.read_value(words[0]), Value::Bytes(vec![111, 107]));
        assert!(greet.allocations().is_empty());
        assert_eq!(greet.allocations().total_size(), 0);
    }

    #[test]
    fn released_results_are_freed_with_the_params() {
        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::I64(5));
        let f = echo(vec![ValueType::I64], vec![ValueType::I64]);

        let word = f.invoke(&mut guest, &[arg.raw()]).unwrap();
        assert_ne!(word, 0);
        // param, result and result array all went back to the guest
        assert_eq!(guest.live_allocations(), 0);
        assert!(f.allocations().is_empty());
    }

    #[test]
    fn callback_failure_still_cleans_up() {
        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::from("x"));
        let f = HostFunction::new("fails", &[ValueType::String], &[ValueType::String], |_, _| {
            anyhow::bail!("boom")
        });

        let err = f.invoke(&mut guest, &[arg.raw()]).unwrap_err();
        assert!(matches!(err, BridgeError::Callback { .. }));
        assert!(!err.is_fatal());
        assert!(f.allocations().is_empty());
        assert_eq!(guest.live_allocations(), 0);
    }

    #[test]
    fn param_count_mismatch_skips_the_callback() {
        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::I32(1));
        let called = Arc::new(AtomicBool::new(false));
        let seen = called.clone();
        let f = HostFunction::new("two", &[ValueType::I32, ValueType::I32], &[], move |_, _| {
            seen.store(true, Ordering::SeqCst);
            Ok(vec![])
        });

        let err = f.invoke(&mut guest, &[arg.raw()]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ParamCountMismatch {
                expected: 2,
                received: 1,
                ..
            }
        ));
        assert!(!called.load(Ordering::SeqCst));
        assert!(f.allocations().is_empty());
    }

    #[test]
    fn result_count_mismatch_fails_before_any_allocation() {
        let mut guest = MockInstance::new();
        let f = HostFunction::new("pair", &[], &[ValueType::I32, ValueType::I32], |_, _| {
            Ok(vec![Value::I32(1)])
        });

        let before = guest.mallocs();
        let err = f.invoke(&mut guest, &[]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ResultCountMismatch {
                expected: 2,
                received: 1,
                ..
            }
        ));
        assert_eq!(guest.mallocs(), before);
    }

    #[test]
    fn result_type_mismatch_is_reported_with_its_index() {
        let mut guest = MockInstance::new();
        let f = HostFunction::new("f", &[], &[ValueType::I32, ValueType::F64], |_, _| {
            Ok(vec![Value::I32(1), Value::F32(1.0)])
        });

        let before = guest.mallocs();
        let err = f.invoke(&mut guest, &[]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ResultTypeMismatch {
                index: 1,
                expected: ValueType::F64,
                actual: ValueType::F32,
                ..
            }
        ));
        assert_eq!(guest.mallocs(), before);
    }

    #[test]
    fn mismatched_param_tag_becomes_the_zero_value() {
        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::from("not a number"));
        let f = HostFunction::new("num", &[ValueType::I64], &[], |_, params| {
            assert_eq!(params[0].value, Value::I64(0));
            Ok(vec![])
        });

        assert_eq!(f.invoke(&mut guest, &[arg.raw()]).unwrap(), 0);
        assert_eq!(guest.live_allocations(), 0);
    }

    #[test]
    fn out_of_range_param_is_fatal() {
        let mut guest = MockInstance::new();
        let size = guest.memory_size() as u32;
        let bogus = PackedWord::new(ValueType::Bytes, size - 4, 64).unwrap();
        let f = echo(vec![ValueType::Bytes], vec![ValueType::Bytes]);

        let err = f.invoke(&mut guest, &[bogus.raw()]).unwrap_err();
        assert!(matches!(err, BridgeError::ReadOutOfRange { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn allocation_failure_is_fatal_and_cleans_up() {
        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::I32(9));
        guest.fail_malloc_after(1);
        let f = echo(vec![ValueType::I32], vec![ValueType::I32]);

        let err = f.invoke(&mut guest, &[arg.raw()]).unwrap_err();
        assert!(matches!(err, BridgeError::Allocation { .. }));
        assert!(f.allocations().is_empty());
        assert_eq!(guest.live_allocations(), 0);
    }

    #[test]
    fn no_declared_results_returns_zero() {
        let mut guest = MockInstance::new();
        let f = HostFunction::new("log", &[], &[], |_, _| Ok(vec![Value::I32(1)]));
        assert_eq!(f.invoke(&mut guest, &[]).unwrap(), 0);
        assert_eq!(guest.mallocs(), 0);
    }

    #[test]
    fn guest_owned_results_survive_the_call() {
        let mut guest = MockInstance::new();
        let f = HostFunction::new("two", &[], &[ValueType::I32, ValueType::String], |_, _| {
            Ok(vec![Value::I32(2), Value::from("two")])
        })
        .guest_owned_results();

        let word = f.invoke(&mut guest, &[]).unwrap();
        assert_eq!(guest.live_allocations(), 3);
        assert!(f.allocations().is_empty());

        let words = guest.read_multi(word);
        assert_eq!(guest.read_value(words[1]), Value::from("two"));
    }

    #[test]
    fn callbacks_can_use_guest_memory() {
        let mut guest = MockInstance::new();
        let f = HostFunction::new("scratch", &[], &[ValueType::I32], |call, _| {
            assert_eq!(call.function_name(), "scratch");
            let mut memory = call.memory();
            let offset = memory.malloc(4)?;
            memory.write_u32(offset, 77)?;
            let v = memory.read_u32(offset)?;
            memory.free(offset)?;
            Ok(vec![Value::I32(v)])
        })
        .guest_owned_results();

        let word = f.invoke(&mut guest, &[]).unwrap();
        let words = guest.read_multi(word);
        assert_eq!(guest.read_value(words[0]), Value::I32(77));
    }

    #[test]
    fn nested_call_on_another_instance_does_not_leak_the_outer_params() {
        let this: Arc<OnceLock<Arc<HostFunction>>> = Arc::new(OnceLock::new());
        let nested = Arc::new(AtomicBool::new(false));
        let inner_live = Arc::new(parking_lot::Mutex::new(None));

        let f = {
            let this = this.clone();
            let inner_live = inner_live.clone();
            Arc::new(HostFunction::new("reenter", &[ValueType::I32], &[], move |_, params| {
                if !nested.swap(true, Ordering::SeqCst) {
                    let mut other = MockInstance::new();
                    let arg = other.alloc_value(&Value::I32(2));
                    // both instances place their first block at the same offset
                    assert_eq!(arg.offset(), params[0].offset);
                    if let Some(f) = this.get() {
                        f.invoke(&mut other, &[arg.raw()])?;
                    }
                    *inner_live.lock() = Some(other.live_allocations());
                }
                Ok(vec![])
            }))
        };
        this.set(f.clone()).unwrap();

        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::I32(1));
        f.invoke(&mut guest, &[arg.raw()]).unwrap();

        assert_eq!(*inner_live.lock(), Some(0));
        assert_eq!(guest.live_allocations(), 0);
        assert!(f.allocations().is_empty());
    }

    #[test]
    fn concurrent_calls_free_their_own_blocks() {
        let f = Arc::new(echo(vec![ValueType::I64], vec![ValueType::I64]));

        thread::scope(|scope| {
            for n in 0..4u64 {
                let f = &f;
                scope.spawn(move || {
                    let mut guest = MockInstance::new();
                    for _ in 0..50 {
                        let arg = guest.alloc_value(&Value::I64(n));
                        f.invoke(&mut guest, &[arg.raw()]).unwrap();
                        assert_eq!(guest.live_allocations(), 0);
                    }
                });
            }
        });
        assert!(f.allocations().is_empty());
        assert_eq!(f.allocations().total_size(), 0);
    }

    #[test]
    fn repeated_param_word_is_freed_once() {
        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::I32(3));
        let f = echo(vec![ValueType::I32, ValueType::I32], vec![]);

        f.invoke(&mut guest, &[arg.raw(), arg.raw()]).unwrap();
        assert_eq!(guest.live_allocations(), 0);
    }

    #[test]
    fn pack_is_not_a_declarable_type() {
        let mut guest = MockInstance::new();
        let arg = guest.alloc_value(&Value::I32(1));
        let param = HostFunction::new("p", &[ValueType::Pack], &[], |_, _| Ok(vec![]));
        let result = HostFunction::new("r", &[], &[ValueType::Pack], |_, _| Ok(vec![]));

        let err = param.invoke(&mut guest, &[arg.raw()]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidSignature { ref function, .. } if function == "p"));
        assert!(err.is_fatal());
        assert!(matches!(
            result.check_signature(),
            Err(BridgeError::InvalidSignature { .. })
        ));
        assert!(echo(vec![ValueType::Bytes], vec![ValueType::F64]).check_signature().is_ok());
        // rejected before anything was read or allocated
        assert_eq!(guest.mallocs(), 0);
        assert_eq!(guest.live_allocations(), 1);
    }
}
