//! # Testing
//!
//! Simulated collaborators that count what the engine does with them

use std::collections::BTreeMap;
use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::code::arm64::{in_branch_range, INSN_SIZE, VENEER_SIZE};
use crate::config::EngineConfig;
use crate::insn::{AllocError, CodeSlot, InsnAllocator, InsnFlags, InsnSlot};
use crate::module::{ModuleRef, ModuleRefs, ModuleTable};
use crate::patch::Collaborators;
use crate::patcher::{TextError, TextPatcher};
use crate::symbol::{Symbol, SymbolResolver, SymbolTable};
use crate::trampoline::TRAMPOLINE_SIZE;
use crate::user::{PatchOwner, UserPatchSpec};

/// Address of the default hook target
pub const TARGET: usize = 0x4000_1000;
/// Address of the default handler. Only its address matters, it is never read.
pub const HANDLER: usize = 0x4080_0000;
/// First word of simulated functions: `stp x29, x30, [sp, #-16]!`
pub const PROLOGUE: u32 = 0xA9BF_7BFD;

/// Words of code addressed by synthetic addresses
#[derive(Debug, Default)]
pub struct SimText {
    /// Mapped words
    words: Mutex<BTreeMap<usize, u32>>,
    /// Flushed ranges
    flushes: Mutex<Vec<(usize, usize)>>,
    /// Successful writes
    writes: AtomicUsize,
    /// Makes every write fail
    fail_writes: AtomicBool,
}

impl SimText {
    /// Maps `words` starting at `address`
    pub fn map(&self, address: usize, words: &[u32]) {
        let mut mapped = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        for (i, word) in words.iter().enumerate() {
            mapped.insert(address + i * INSN_SIZE, *word);
        }
    }

    /// Word at `address`
    pub fn word(&self, address: usize) -> u32 {
        self.words.lock().unwrap()[&address]
    }

    /// Overwrites `address` behind the engine's back
    pub fn set_word(&self, address: usize, word: u32) {
        self.words.lock().unwrap().insert(address, word);
    }

    /// Returns true if a flush started at `address`
    pub fn flushed(&self, address: usize) -> bool {
        self.flushes
            .lock()
            .unwrap()
            .iter()
            .any(|(start, _)| *start == address)
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every following write fail
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

unsafe impl TextPatcher for SimText {
    unsafe fn read_insn(&self, address: usize) -> Result<u32, TextError> {
        if address % INSN_SIZE != 0 {
            return Err(TextError::Misaligned(address));
        }
        let words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        words.get(&address).copied().ok_or(TextError::Unmapped(address))
    }

    unsafe fn write_insn(&self, address: usize, insn: u32) -> Result<(), TextError> {
        let mut words = self.words.lock().unwrap_or_else(PoisonError::into_inner);
        match words.get_mut(&address) {
            Some(word) if !self.fail_writes.load(Ordering::SeqCst) => {
                *word = insn;
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(TextError::Unmapped(address)),
        }
    }

    fn flush_icache(&self, address: usize, len: usize) {
        self.flushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((address, len));
    }
}

/// Symbol table counting lookups
#[derive(Debug, Default)]
pub struct CountingSymbols {
    /// Registered symbols
    pub table: SymbolTable,
    /// Lookups so far
    lookups: AtomicUsize,
}

impl CountingSymbols {
    /// Lookups so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SymbolResolver for CountingSymbols {
    fn resolve(&self, name: &str, module: Option<&str>) -> Option<Symbol> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.table.resolve(name, module)
    }
}

/// Module table counting references
#[derive(Debug, Default)]
pub struct CountingModules {
    /// Loaded modules
    pub table: ModuleTable,
    /// Successful acquisitions
    acquired: AtomicUsize,
    /// Releases
    released: AtomicUsize,
}

impl CountingModules {
    /// Successful acquisitions so far
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Releases so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl ModuleRefs for CountingModules {
    fn acquire(&self, name: &str) -> Option<ModuleRef> {
        let module = self.table.acquire(name)?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Some(module)
    }

    fn release(&self, module: ModuleRef) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.table.release(module);
    }
}

/// Allocator handing out trampolines at synthetic addresses
#[derive(Debug, Default)]
pub struct MockAllocator {
    /// Allocations so far, used to space out addresses
    count: AtomicUsize,
    /// Allocations not freed yet
    live: AtomicUsize,
    /// Flags of every allocation request
    flags: Mutex<Vec<InsnFlags>>,
    /// Place trampolines out of branch range, behind a veneer
    far: AtomicBool,
    /// Refuse every request
    exhausted: AtomicBool,
}

impl MockAllocator {
    /// Allocations not freed yet
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Allocations so far
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Flags of every allocation request
    pub fn flags(&self) -> Vec<InsnFlags> {
        self.flags.lock().unwrap().clone()
    }

    /// Places following trampolines out of branch range
    pub fn place_far(&self) {
        self.far.store(true, Ordering::SeqCst);
    }

    /// Refuses following requests
    pub fn exhaust(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
    }
}

impl InsnAllocator for MockAllocator {
    fn allocate(
        &self,
        target: usize,
        _module: Option<&ModuleRef>,
        flags: InsnFlags,
    ) -> Result<InsnSlot, AllocError> {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(flags);
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(AllocError::OutOfMemory { target });
        }

        let n = self.count.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        if self.far.load(Ordering::SeqCst) {
            let trampoline = 0x7F00_0000_0000 + n * 0x1000;
            let plt = target + 0x0080_0000 + n * VENEER_SIZE;
            Ok(InsnSlot {
                trampoline: CodeSlot::with_address(trampoline, vec![0u8; TRAMPOLINE_SIZE]),
                plt: Some(CodeSlot::with_address(plt, vec![0u8; VENEER_SIZE])),
            })
        } else {
            let trampoline = target + 0x0100_0000 + n * 0x1000;
            debug_assert!(in_branch_range(target, trampoline));
            Ok(InsnSlot {
                trampoline: CodeSlot::with_address(trampoline, vec![0u8; TRAMPOLINE_SIZE]),
                plt: None,
            })
        }
    }

    fn free(&self, slot: InsnSlot, _module: Option<&ModuleRef>) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        drop(slot);
    }
}

/// Caller memory holding hook requests
struct Arena {
    /// Backing words, never reallocated
    buf: Vec<u64>,
    /// Bytes handed out
    used: usize,
}

impl Arena {
    /// Copies `bytes` in and returns their address
    fn push(&mut self, bytes: &[u8]) -> usize {
        let start = (self.used + 7) & !7;
        let base = self.buf.as_mut_ptr() as *mut u8;
        assert!(start + bytes.len() <= self.buf.len() * 8, "arena full");
        // Safety: bounds checked above
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), bytes.len()) };
        self.used = start + bytes.len();
        base as usize + start
    }

    /// Memory range of the arena
    fn range(&self) -> Range<usize> {
        let start = self.buf.as_ptr() as usize;
        start..start + self.buf.len() * 8
    }
}

/// Counting collaborators, an owner and memory for its requests
pub struct Fixture {
    /// Engine settings
    pub config: EngineConfig,
    /// Collaborators as the engine sees them
    pub env: Collaborators,
    /// Caller the requests come from
    pub owner: Arc<PatchOwner>,
    /// Symbols
    pub symbols: Arc<CountingSymbols>,
    /// Modules
    pub modules: Arc<CountingModules>,
    /// Trampoline memory
    pub allocator: Arc<MockAllocator>,
    /// Code
    pub text: Arc<SimText>,
    /// Owner memory for requests
    arena: Mutex<Arena>,
}

impl Fixture {
    /// Creates a fixture without any symbols
    pub fn new() -> Self {
        let symbols = Arc::new(CountingSymbols::default());
        let modules = Arc::new(CountingModules::default());
        let allocator = Arc::new(MockAllocator::default());
        let text = Arc::new(SimText::default());
        let arena = Arena {
            buf: vec![0u64; 512],
            used: 0,
        };
        // Safety: the arena lives as long as the owner, and the handler range is never read
        let owner = unsafe {
            PatchOwner::new("test", vec![arena.range(), HANDLER..HANDLER + 0x1000])
        };

        Self {
            config: EngineConfig::default(),
            env: Collaborators {
                symbols: symbols.clone(),
                modules: modules.clone(),
                allocator: allocator.clone(),
                text: text.clone(),
            },
            owner: Arc::new(owner),
            symbols,
            modules,
            allocator,
            text,
            arena: Mutex::new(arena),
        }
    }

    /// Defines a function `name` of `module` at `address`, loading the module
    pub fn define(&self, name: &str, module: Option<&str>, address: usize) {
        self.define_with(name, module, address, PROLOGUE);
    }

    /// Defines a function whose first instruction is `first`
    pub fn define_with(&self, name: &str, module: Option<&str>, address: usize, first: u32) {
        self.symbols.table.insert(name, module, address, 64);
        self.text.map(address, &[first, PROLOGUE, PROLOGUE, PROLOGUE]);
        if let Some(module) = module {
            self.modules.table.load(module);
        }
    }

    /// Places a request for `name` in owner memory
    pub fn spec(&self, name: &str, module: Option<&str>) -> *const UserPatchSpec {
        self.spec_with(name, module, HANDLER)
    }

    /// Places a request with an arbitrary handler in owner memory
    pub fn spec_with(
        &self,
        name: &str,
        module: Option<&str>,
        handler: usize,
    ) -> *const UserPatchSpec {
        let mut arena = self.arena.lock().unwrap();
        let mut push_str = |s: &str| {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            arena.push(&bytes)
        };
        let name = push_str(name);
        let module = module.map_or(0, &mut push_str);
        let spec = UserPatchSpec {
            name: name as *const _,
            module: module as *const _,
            handler,
        };
        // Safety: any initialized struct can be viewed as bytes
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &spec as *const UserPatchSpec as *const u8,
                size_of::<UserPatchSpec>(),
            )
        };
        arena.push(bytes) as *const UserPatchSpec
    }
}
