//! # Module
//!
//! Module references keep a module loaded while one of its functions is hooked

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use log::debug;

/// A held reference to a loaded module.
///
/// Deliberately not `Clone`: every reference is handed back to [`ModuleRefs::release`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct ModuleRef {
    /// Module name
    name: String,
    /// Identifier assigned by the module service
    id: usize,
}

impl ModuleRef {
    /// Creates a reference token. Only module services should call this.
    pub fn new(name: impl Into<String>, id: usize) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier assigned by the module service
    pub fn id(&self) -> usize {
        self.id
    }
}

/// Service that pins modules in memory
pub trait ModuleRefs: Send + Sync {
    /// Takes a reference on the module called `name`. Returns `None` if it isn't loaded.
    fn acquire(&self, name: &str) -> Option<ModuleRef>;
    /// Drops a reference taken with [`ModuleRefs::acquire`]
    fn release(&self, module: ModuleRef);
}

/// State of one module in a [`ModuleTable`]
#[derive(Debug)]
struct ModuleState {
    /// Identifier handed out in references
    id: usize,
    /// Outstanding references
    refs: usize,
}

/// Contents of a [`ModuleTable`]
#[derive(Debug, Default)]
struct Modules {
    /// Loaded modules by name
    modules: BTreeMap<String, ModuleState>,
    /// Last identifier handed out, never reused
    next_id: usize,
}

/// A table of loaded modules with reference counts
#[derive(Debug, Default)]
pub struct ModuleTable {
    /// Loaded modules
    inner: Mutex<Modules>,
}

impl ModuleTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as loaded
    pub fn load(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.modules.contains_key(name) {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.modules.insert(name.to_string(), ModuleState { id, refs: 0 });
        }
    }

    /// Unloads `name`. Refused (returning false) while references are held.
    pub fn unload(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.modules.get(name).map(|state| state.refs) {
            Some(0) => {
                inner.modules.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Outstanding references on `name`
    pub fn refs(&self, name: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.modules.get(name).map_or(0, |state| state.refs)
    }
}

impl ModuleRefs for ModuleTable {
    fn acquire(&self, name: &str) -> Option<ModuleRef> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let state = inner.modules.get_mut(name)?;
        state.refs += 1;
        debug!("ref module {} ({} refs)", name, state.refs);
        Some(ModuleRef::new(name, state.id))
    }

    fn release(&self, module: ModuleRef) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.modules.get_mut(module.name()) {
            Some(state) if state.id == module.id() && state.refs > 0 => {
                state.refs -= 1;
                debug!("unref module {} ({} refs)", module.name(), state.refs);
            }
            _ => debug!("stale reference to module {}", module.name()),
        }
    }
}
