//! Interned symbols.
//!
//! Symbols are immediate values: a `Symbol` is just an index into the
//! process-wide `SymbolTable`, so two symbols with the same spelling are
//! always bit-equal. Interning is append-only; symbols are never freed.

use std::collections::HashMap;
use std::fmt;

/// An interned symbol. Cheap to copy and compare.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

/// The intern table mapping spellings to symbols and back.
#[derive(Default)]
pub struct SymbolTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning the existing symbol if already present.
    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&id) = self.index.get(name) {
            return Symbol(id);
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        Symbol(id)
    }

    /// Look up the spelling of a symbol.
    pub fn name(&self, sym: Symbol) -> &str {
        &self.names[sym.as_index()]
    }

    /// Look up a symbol without interning.
    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.index.get(name).map(|&id| Symbol(id))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
