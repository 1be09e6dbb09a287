//! Host-to-guest calls.

use std::collections::HashSet;

use packwire::{MultiPackedWord, PackedWord, Value, ValueType};
use tracing::{debug, error, info};

use crate::error::{BridgeError, Result};
use crate::instance::GuestInstance;
use crate::memory::{GuestMemory, FREE, MALLOC};

/// An exported guest function, bound to the instance it lives in.
///
/// Arguments are written into freshly allocated guest memory and passed as
/// packed words. Their blocks belong to the guest once the call starts.
pub struct GuestFunction<'a> {
    instance: &'a mut dyn GuestInstance,
    name: String,
    params: Option<Vec<ValueType>>,
}

impl<'a> GuestFunction<'a> {
    pub fn new(instance: &'a mut dyn GuestInstance, name: impl Into<String>) -> Self {
        Self {
            instance,
            name: name.into(),
            params: None,
        }
    }

    /// Declares the parameter types; [`GuestFunction::invoke`] then rejects
    /// arguments that do not match before touching the guest.
    pub fn with_params(mut self, params: &[ValueType]) -> Self {
        self.params = Some(params.to_vec());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls the export with raw stack values and no marshaling.
    pub fn call_raw(&mut self, args: &[u64]) -> Result<u64> {
        if self.name == MALLOC || self.name == FREE {
            debug!(module = self.instance.module_name(), function = %self.name, ?args, "calling guest function");
        } else {
            info!(module = self.instance.module_name(), function = %self.name, ?args, "calling guest function");
        }
        let result = self.instance.call(&self.name, args).map_err(|err| {
            error!(module = self.instance.module_name(), function = %self.name, %err, "guest call failed");
            err
        })?;
        Ok(result.unwrap_or(0))
    }

    /// Marshals `args` into guest memory, calls the export and returns a
    /// reader for its packed results.
    pub fn invoke(mut self, args: &[Value]) -> Result<GuestResult<'a>> {
        self.check_args(args)?;

        let mut words = Vec::with_capacity(args.len());
        {
            let mut memory = GuestMemory::new(&mut *self.instance);
            for arg in args {
                match memory.alloc_value(arg) {
                    Ok(word) => words.push(word),
                    Err(err) => {
                        for word in &words {
                            memory.free_quietly(word.offset());
                        }
                        return Err(err);
                    }
                }
            }
        }

        let stack: Vec<u64> = words.iter().map(|w| w.raw()).collect();
        let multi = self.call_raw(&stack)?;
        Ok(GuestResult {
            instance: self.instance,
            function: self.name,
            word: multi,
        })
    }

    fn check_args(&mut self, args: &[Value]) -> Result<()> {
        if let Some(declared) = &self.params {
            if declared.len() != args.len() {
                return Err(BridgeError::ParamCountMismatch {
                    function: self.name.clone(),
                    expected: declared.len(),
                    received: args.len(),
                });
            }
            for (index, (arg, &expected)) in args.iter().zip(declared).enumerate() {
                if arg.value_type() != expected {
                    return Err(BridgeError::ParamTypeMismatch {
                        function: self.name.clone(),
                        index,
                        expected,
                        actual: arg.value_type(),
                    });
                }
            }
        }

        let arity = self
            .instance
            .export_arity(&self.name)
            .ok_or_else(|| BridgeError::MissingExport(self.name.clone()))?;
        if arity != args.len() {
            return Err(BridgeError::ParamCountMismatch {
                function: self.name.clone(),
                expected: arity,
                received: args.len(),
            });
        }

        for arg in args {
            arg.wire_size()?;
        }
        Ok(())
    }
}

/// The packed result of one guest call.
///
/// Reading consumes the reader and frees the guest memory behind it, so the
/// same results cannot be read (or freed) twice:
///
/// ```compile_fail
/// # fn demo(result: packwire_host::GuestResult<'_>) -> packwire_host::Result<()> {
/// let first = result.read()?;
/// let second = result.read()?;
/// # Ok(())
/// # }
/// ```
#[must_use = "results hold guest memory until read"]
pub struct GuestResult<'a> {
    instance: &'a mut dyn GuestInstance,
    function: String,
    word: u64,
}

impl<'a> GuestResult<'a> {
    /// The raw word the guest returned.
    pub fn word(&self) -> u64 {
        self.word
    }

    /// True when the function returned no results.
    pub fn is_empty(&self) -> bool {
        self.word == 0
    }

    /// Reads every result in order and frees their guest memory.
    pub fn read(self) -> Result<Vec<Value>> {
        if self.word == 0 {
            return Ok(Vec::new());
        }
        let multi = self.multi()?;
        let mut memory = GuestMemory::new(self.instance);
        let words = memory.read_multi(multi.raw())?;

        let mut values = Vec::with_capacity(words.len());
        let mut outcome = Ok(());
        for &word in &words {
            match memory.read_value(word) {
                Ok(value) => values.push(value),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        let freed = free_words(&mut memory, &words, multi);
        outcome?;
        freed?;
        debug!(function = %self.function, results = values.len(), "read guest results");
        Ok(values)
    }

    /// Returns the inner words without reifying them. Only the array block
    /// is freed; the value blocks now belong to the caller.
    pub fn into_words(self) -> Result<Vec<PackedWord>> {
        if self.word == 0 {
            return Ok(Vec::new());
        }
        let multi = self.multi()?;
        let mut memory = GuestMemory::new(self.instance);
        let words = memory.read_multi(multi.raw())?;
        memory.free(multi.offset())?;
        Ok(words)
    }

    fn multi(&self) -> Result<MultiPackedWord> {
        MultiPackedWord::from_raw(self.word).map_err(|_| BridgeError::NotAPackedArray {
            tag: PackedWord::from_raw(self.word).tag(),
        })
    }
}

fn free_words(memory: &mut GuestMemory<'_>, words: &[PackedWord], multi: MultiPackedWord) -> Result<()> {
    let mut seen = HashSet::new();
    let mut first_err = None;
    for word in words {
        let offset = word.offset();
        if offset == 0 || !seen.insert(offset) {
            continue;
        }
        if let Err(err) = memory.free(offset) {
            first_err.get_or_insert(err);
        }
    }
    if let Err(err) = memory.free(multi.offset()) {
        first_err.get_or_insert(err);
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
