//! Indirection stubs
//!
//! A [`StubCell`] is the engine's model of a lazy call-through trampoline:
//! a fixed callable address whose jump target starts unset and is written
//! exactly once, atomically, when the symbol's body materializes. Callers
//! racing the rewrite observe either "unresolved" (and block on the
//! symbol's task) or the final body address; there is no intermediate
//! state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::code::{CodeAddr, CodeMap};
use crate::engine::error::{EngineResult, InvariantViolation};
use crate::engine::symbol::Symbol;

/// Per-symbol redirect with a write-once jump target
pub struct StubCell {
    symbol: Symbol,
    addr: CodeAddr,
    /// Zero while unresolved; the body address afterwards
    target: AtomicU64,
}

impl StubCell {
    pub(crate) fn new(symbol: Symbol, addr: CodeAddr) -> Self {
        Self {
            symbol,
            addr,
            target: AtomicU64::new(CodeAddr::NULL.as_u64()),
        }
    }

    /// The face symbol this stub redirects for
    #[inline]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    /// The stub's own callable address
    #[inline]
    pub fn addr(&self) -> CodeAddr {
        self.addr
    }

    /// The current jump target, if the rewrite has happened
    #[inline]
    pub fn target(&self) -> Option<CodeAddr> {
        let raw = self.target.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(CodeAddr::from_raw(raw))
        }
    }

    /// Whether the one-time rewrite has happened
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.target.load(Ordering::Acquire) != 0
    }

    /// Perform the one-time target rewrite. Returns true if this call won
    /// the race; losers leave the winning target untouched.
    pub fn resolve(&self, target: CodeAddr) -> bool {
        self.target
            .compare_exchange(
                0,
                target.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl fmt::Debug for StubCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubCell")
            .field("symbol", &self.symbol)
            .field("addr", &self.addr)
            .field("target", &self.target())
            .finish()
    }
}

/// Creates and tracks the session's stubs, one per face symbol
pub struct StubManager {
    code: Arc<CodeMap>,
    stubs: RwLock<HashMap<Symbol, Arc<StubCell>>>,
}

impl StubManager {
    /// Create a manager allocating out of the given code map
    pub fn new(code: Arc<CodeMap>) -> Self {
        Self {
            code,
            stubs: RwLock::new(HashMap::new()),
        }
    }

    /// Create the stub for a face symbol. At most one stub may exist per
    /// symbol; a duplicate request is a bookkeeping error.
    pub fn create_stub(&self, symbol: Symbol) -> EngineResult<Arc<StubCell>> {
        let mut stubs = self.stubs.write();
        if stubs.contains_key(&symbol) {
            return Err(InvariantViolation::DuplicateStub(symbol).into());
        }
        let stub = self.code.install_stub(symbol);
        stubs.insert(symbol, stub.clone());
        Ok(stub)
    }

    /// Look up the stub for a face symbol
    pub fn get(&self, symbol: Symbol) -> Option<Arc<StubCell>> {
        self.stubs.read().get(&symbol).cloned()
    }

    /// Number of stubs created so far
    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    /// Whether no stubs have been created
    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// Current resolution state of every stub, for diagnostics
    pub fn snapshot(&self) -> Vec<(Symbol, CodeAddr, Option<CodeAddr>)> {
        self.stubs
            .read()
            .values()
            .map(|s| (s.symbol(), s.addr(), s.target()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::symbol::intern;

    #[test]
    fn test_stub_starts_unresolved() {
        let code = Arc::new(CodeMap::new());
        let mgr = StubManager::new(code);
        let stub = mgr.create_stub(intern("f")).unwrap();
        assert!(!stub.is_resolved());
        assert_eq!(stub.target(), None);
    }

    #[test]
    fn test_resolve_writes_once() {
        let code = Arc::new(CodeMap::new());
        let mgr = StubManager::new(code);
        let stub = mgr.create_stub(intern("g")).unwrap();

        let body = CodeAddr::from_raw(0x2000);
        assert!(stub.resolve(body));
        assert_eq!(stub.target(), Some(body));

        // second rewrite loses and changes nothing
        assert!(!stub.resolve(CodeAddr::from_raw(0x3000)));
        assert_eq!(stub.target(), Some(body));
    }

    #[test]
    fn test_duplicate_stub_fails_fast() {
        let code = Arc::new(CodeMap::new());
        let mgr = StubManager::new(code);
        mgr.create_stub(intern("h")).unwrap();
        assert!(mgr.create_stub(intern("h")).is_err());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_concurrent_resolvers_agree() {
        let code = Arc::new(CodeMap::new());
        let mgr = StubManager::new(code);
        let stub = mgr.create_stub(intern("race")).unwrap();
        let body = CodeAddr::from_raw(0x4000);

        let winners: usize = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let stub = stub.clone();
                    scope.spawn(move || usize::from(stub.resolve(body)))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(stub.target(), Some(body));
    }
}
