//! Executable address space and code registry
//!
//! The engine never hands out raw pointers: every callable thing (stub,
//! compiled body, native host function) lives in a [`CodeMap`] under an
//! opaque [`CodeAddr`]. Installing a compiled body here is the "link" step
//! of the pipeline: it is the moment a function gains an address and
//! becomes reachable from generated code.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::stubs::StubCell;
use crate::engine::symbol::Symbol;
use crate::unit::Op;

/// Base of the synthetic address space; low addresses stay unmapped so an
/// uninitialized or zero target is always invalid
const CODE_BASE: u64 = 0x1000;

/// Spacing between allocated addresses
const CODE_ALIGN: u64 = 16;

/// An opaque address in the session's code map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeAddr(u64);

impl CodeAddr {
    /// The unmapped null address
    pub const NULL: CodeAddr = CodeAddr(0);

    /// Reconstruct an address from its raw integer form, as received from
    /// the speculation hook
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        CodeAddr(raw)
    }

    /// The raw integer form handed to generated code
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the unmapped null address
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A function body produced by the compile backend, not yet linked
#[derive(Debug, Clone)]
pub struct CompiledCode {
    /// The name the function was defined under
    pub name: Symbol,
    /// Argument count
    pub arity: u8,
    /// Emitted instruction stream
    pub ops: Arc<[Op]>,
    /// Estimated size of the emitted code in bytes
    pub code_size: usize,
}

/// A linked, executable function body
#[derive(Debug, Clone)]
pub struct CompiledFn {
    /// The name the function was defined under
    pub name: Symbol,
    /// The body's entry address
    pub addr: CodeAddr,
    /// Argument count
    pub arity: u8,
    /// Executable instruction stream
    pub ops: Arc<[Op]>,
    /// Estimated size of the emitted code in bytes
    pub code_size: usize,
}

/// Signature for native host functions callable from generated code
pub type NativeFn = Arc<dyn Fn(&[i64]) -> Result<i64, String> + Send + Sync>;

/// A native host function installed in the code map
pub struct NativeEntry {
    /// The symbol the function is published under
    pub name: Symbol,
    /// Argument count
    pub arity: u8,
    /// The function itself
    pub func: NativeFn,
}

impl fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEntry")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Everything an address can map to
#[derive(Debug, Clone)]
pub enum CodeEntity {
    /// An indirection stub; callable before its symbol is compiled
    Stub(Arc<StubCell>),
    /// A compiled function body
    Body(Arc<CompiledFn>),
    /// A native host function
    Native(Arc<NativeEntry>),
}

/// Thread-safe address allocator and entity registry
pub struct CodeMap {
    next: AtomicU64,
    entities: RwLock<HashMap<CodeAddr, CodeEntity>>,
}

impl CodeMap {
    /// Create an empty code map
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(CODE_BASE),
            entities: RwLock::new(HashMap::new()),
        }
    }

    fn alloc(&self) -> CodeAddr {
        CodeAddr(self.next.fetch_add(CODE_ALIGN, Ordering::Relaxed))
    }

    /// Allocate an address for a new stub and register it
    pub fn install_stub(&self, symbol: Symbol) -> Arc<StubCell> {
        let addr = self.alloc();
        let stub = Arc::new(StubCell::new(symbol, addr));
        self.entities
            .write()
            .insert(addr, CodeEntity::Stub(stub.clone()));
        stub
    }

    /// Link a compiled body: assign its address and make it reachable
    pub fn install_body(&self, code: CompiledCode) -> Arc<CompiledFn> {
        let addr = self.alloc();
        let fun = Arc::new(CompiledFn {
            name: code.name,
            addr,
            arity: code.arity,
            ops: code.ops,
            code_size: code.code_size,
        });
        self.entities
            .write()
            .insert(addr, CodeEntity::Body(fun.clone()));
        fun
    }

    /// Register a native host function and return its address
    pub fn install_native(&self, name: Symbol, arity: u8, func: NativeFn) -> CodeAddr {
        let addr = self.alloc();
        let entry = Arc::new(NativeEntry { name, arity, func });
        self.entities.write().insert(addr, CodeEntity::Native(entry));
        addr
    }

    /// Look up the entity mapped at an address
    pub fn get(&self, addr: CodeAddr) -> Option<CodeEntity> {
        self.entities.read().get(&addr).cloned()
    }

    /// Number of mapped entities
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Whether the map holds no entities
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl Default for CodeMap {
    fn default() -> Self {
        CodeMap::new()
    }
}
