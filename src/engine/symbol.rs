//! Symbol interning for fast symbol comparison and reduced memory usage
//!
//! Every name the engine tracks (faces, implementation symbols, namespace
//! entries) is interned into a process-wide table backed by lasso's
//! `ThreadedRodeo`. The table is created on first use and lives for the rest
//! of the process, so a `Symbol` is a 4-byte key with O(1) comparison and a
//! `&'static str` view of its text.
//!
//! # Example
//! ```
//! use specjit::engine::symbol::{intern, Symbol};
//!
//! let s1 = intern("helper");
//! let s2 = Symbol::new("helper");
//! assert_eq!(s1, s2);
//! assert_eq!(s1.as_str(), "helper");
//! ```

use lasso::{Spur, ThreadedRodeo};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

/// Global interner for symbols - lazily initialized, thread-safe
static INTERNER: OnceLock<ThreadedRodeo> = OnceLock::new();

/// Get or initialize the global interner
#[inline]
fn interner() -> &'static ThreadedRodeo {
    INTERNER.get_or_init(ThreadedRodeo::new)
}

/// A set of symbols, as used for predicted callee sets
pub type SymbolSet = HashSet<Symbol>;

/// Interned symbol - 4 bytes, O(1) comparison
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Symbol(Spur);

impl Symbol {
    /// Create a new symbol from a string (interns if new)
    #[inline]
    pub fn new(s: &str) -> Self {
        Symbol(interner().get_or_intern(s))
    }

    /// Create a new symbol from an owned string
    #[inline]
    pub fn from_string(s: String) -> Self {
        Symbol(interner().get_or_intern(s))
    }

    /// Get the string representation of this symbol
    #[inline]
    pub fn as_str(&self) -> &'static str {
        interner().resolve(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Symbol {
    #[inline]
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    #[inline]
    fn from(s: String) -> Self {
        Symbol::from_string(s)
    }
}

impl AsRef<str> for Symbol {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Intern a string and return a Symbol
#[inline]
pub fn intern(s: &str) -> Symbol {
    Symbol::new(s)
}
