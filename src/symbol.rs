//! # Symbol
//!
//! Resolution of `(name, module)` pairs to live code addresses

use std::sync::{PoisonError, RwLock};

/// Result of a symbol lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Address of the first match
    pub address: usize,
    /// Size of the first match in bytes
    pub size: usize,
    /// Number of symbols that matched the lookup
    pub count: usize,
}

/// Maps symbol names to addresses
pub trait SymbolResolver: Send + Sync {
    /// Looks up `name` in `module`, or in the core image when `module` is `None`.
    ///
    /// Returns `None` when nothing matches. When several symbols match, the first one is returned along with the
    /// total `count`.
    fn resolve(&self, name: &str, module: Option<&str>) -> Option<Symbol>;
}

/// One registered symbol
#[derive(Debug, Clone)]
struct Entry {
    /// Symbol name
    name: String,
    /// Owning module, `None` for the core image
    module: Option<String>,
    /// Address of the symbol
    address: usize,
    /// Size of the symbol
    size: usize,
}

/// An in-memory symbol table
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Registered symbols, in registration order
    symbols: RwLock<Vec<Entry>>,
}

impl SymbolTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a symbol. Duplicate names are allowed and make lookups ambiguous.
    pub fn insert(&self, name: &str, module: Option<&str>, address: usize, size: usize) {
        self.symbols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                name: name.to_string(),
                module: module.map(str::to_string),
                address,
                size,
            });
    }

    /// Removes every symbol belonging to `module`
    pub fn remove_module(&self, module: &str) {
        self.symbols
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.module.as_deref() != Some(module));
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, name: &str, module: Option<&str>) -> Option<Symbol> {
        let symbols = self.symbols.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches = symbols
            .iter()
            .filter(|entry| entry.name == name && entry.module.as_deref() == module);
        let first = matches.next()?;
        Some(Symbol {
            address: first.address,
            size: first.size,
            count: 1 + matches.count(),
        })
    }
}
