//! In-memory guest used by unit tests.

use std::collections::HashMap;

use packwire::{bytes_to_words, words_to_bytes, MultiPackedWord, PackedWord, Value};

use crate::error::{BridgeError, Result};
use crate::instance::GuestInstance;

const MEMORY_SIZE: usize = 64 * 1024;
const HEAP_START: u32 = 8;

type Export = Box<dyn FnMut(&mut MockInstance, &[u64]) -> Option<u64>>;

/// A fake guest with one page of memory, a bump allocator that tracks live
/// blocks and rejects double frees, and scriptable exports.
pub struct MockInstance {
    memory: Vec<u8>,
    next: u32,
    live: HashMap<u32, u32>,
    mallocs: usize,
    malloc_budget: Option<usize>,
    fail_writes: bool,
    exports: HashMap<String, (usize, Option<Export>)>,
    calls: HashMap<String, usize>,
}

impl MockInstance {
    pub fn new() -> Self {
        Self {
            memory: vec![0; MEMORY_SIZE],
            next: HEAP_START,
            live: HashMap::new(),
            mallocs: 0,
            malloc_budget: None,
            fail_writes: false,
            exports: HashMap::new(),
            calls: HashMap::new(),
        }
    }

    pub fn with_export<F>(mut self, name: &str, arity: usize, f: F) -> Self
    where
        F: FnMut(&mut MockInstance, &[u64]) -> Option<u64> + 'static,
    {
        self.exports
            .insert(name.to_string(), (arity, Some(Box::new(f))));
        self
    }

    /// Every write through the engine trait fails.
    pub fn with_write_failure(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Lets the next `n` exported `malloc` calls succeed, then returns null.
    pub fn fail_malloc_after(&mut self, n: usize) {
        self.malloc_budget = Some(n);
    }

    /// Number of exported `malloc` calls so far.
    pub fn mallocs(&self) -> usize {
        self.mallocs
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.get(name).copied().unwrap_or(0)
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    fn bump(&mut self, size: u32) -> u32 {
        let offset = self.next;
        let end = offset as usize + size.max(1) as usize;
        assert!(end <= MEMORY_SIZE, "mock guest out of memory");
        self.next = ((end + 7) & !7) as u32;
        self.live.insert(offset, size);
        offset
    }

    fn guest_malloc(&mut self, size: u32) -> u32 {
        self.mallocs += 1;
        if let Some(budget) = self.malloc_budget.as_mut() {
            if *budget == 0 {
                return 0;
            }
            *budget -= 1;
        }
        self.bump(size)
    }

    fn guest_free(&mut self, offset: u32) -> Result<()> {
        if offset == 0 {
            return Ok(());
        }
        match self.live.remove(&offset) {
            Some(_) => Ok(()),
            None => Err(BridgeError::Call {
                function: "free".into(),
                reason: format!("double free of offset {offset}"),
            }),
        }
    }

    // Guest-side helpers: what compiled guest code would do with its own
    // allocator. They bypass the malloc counters and failure injection.

    pub fn alloc_value(&mut self, value: &Value) -> PackedWord {
        let bytes = value.to_bytes();
        let offset = self.bump(bytes.len() as u32);
        self.copy_in(offset, &bytes);
        PackedWord::new(value.value_type(), offset, bytes.len() as u32).unwrap()
    }

    pub fn alloc_multi(&mut self, words: &[PackedWord]) -> MultiPackedWord {
        let raw: Vec<u64> = words.iter().map(|w| w.raw()).collect();
        let bytes = words_to_bytes(&raw);
        let offset = self.bump(bytes.len() as u32);
        self.copy_in(offset, &bytes);
        MultiPackedWord::new(offset, bytes.len() as u32).unwrap()
    }

    pub fn read_value(&self, word: PackedWord) -> Value {
        let ty = word.value_type().unwrap();
        Value::from_bytes(ty, self.span(word.offset(), word.size())).unwrap()
    }

    pub fn read_multi(&self, word: u64) -> Vec<PackedWord> {
        let multi = MultiPackedWord::from_raw(word).unwrap();
        bytes_to_words(self.span(multi.offset(), multi.size()))
            .into_iter()
            .map(PackedWord::from_raw)
            .collect()
    }

    fn span(&self, offset: u32, len: u32) -> &[u8] {
        &self.memory[offset as usize..offset as usize + len as usize]
    }

    fn copy_in(&mut self, offset: u32, bytes: &[u8]) {
        self.memory[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }
}

impl GuestInstance for MockInstance {
    fn module_name(&self) -> &str {
        "mock"
    }

    fn read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let end = offset as u64 + len as u64;
        if end > MEMORY_SIZE as u64 {
            return Err(BridgeError::ReadOutOfRange {
                offset,
                len,
                memory_size: MEMORY_SIZE as u64,
            });
        }
        Ok(self.span(offset, len).to_vec())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(BridgeError::Engine("injected write failure".into()));
        }
        let end = offset as u64 + bytes.len() as u64;
        if end > MEMORY_SIZE as u64 {
            return Err(BridgeError::WriteOutOfRange {
                offset,
                len: bytes.len(),
                memory_size: MEMORY_SIZE as u64,
            });
        }
        self.copy_in(offset, bytes);
        Ok(())
    }

    fn call(&mut self, function: &str, args: &[u64]) -> Result<Option<u64>> {
        match function {
            "malloc" => Ok(Some(self.guest_malloc(args[0] as u32) as u64)),
            "free" => self.guest_free(args[0] as u32).map(|_| None),
            _ => {
                let (_, slot) = self
                    .exports
                    .get_mut(function)
                    .ok_or_else(|| BridgeError::MissingExport(function.to_string()))?;
                let mut f = slot.take().expect("export re-entered");
                *self.calls.entry(function.to_string()).or_default() += 1;
                let result = f(self, args);
                if let Some((_, slot)) = self.exports.get_mut(function) {
                    *slot = Some(f);
                }
                Ok(result)
            }
        }
    }

    fn export_arity(&mut self, function: &str) -> Option<usize> {
        match function {
            "malloc" | "free" => Some(1),
            _ => self.exports.get(function).map(|(arity, _)| *arity),
        }
    }

    fn memory_size(&mut self) -> u64 {
        MEMORY_SIZE as u64
    }
}
