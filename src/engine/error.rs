//! Error taxonomy for the materialization engine
//!
//! Three families, with different propagation rules:
//!
//! - [`InvariantViolation`]: duplicate or missing bookkeeping entries and
//!   broken post-instrumentation units. These are programming errors; a
//!   synchronous API surfaces them as `Err`, a worker thread or the
//!   speculation hook routes them to the session's error reporter and
//!   aborts only the offending operation.
//! - [`CompileError`]: the backend rejected a function. The owning task
//!   transitions to failed and every current and future waiter observes a
//!   clone of the same failure.
//! - The remaining [`EngineError`] variants: per-call failures (missing
//!   symbols, arity mismatches, bad addresses) that fail the specific
//!   request only.
//!
//! Every error is `Clone` because a single task failure fans out to an
//! arbitrary number of blocked and future waiters.

use std::fmt;
use std::sync::Arc;

use crate::engine::code::CodeAddr;
use crate::engine::exec::ExecError;
use crate::engine::symbol::Symbol;
use crate::unit::WellFormedError;

/// Bookkeeping invariants checked at module boundaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A face symbol already has an alias record
    DuplicateAlias(Symbol),
    /// Alias lookup for a face that was never recorded
    UnknownAlias(Symbol),
    /// A stub already exists for this face symbol
    DuplicateStub(Symbol),
    /// Predictions already registered for this caller address
    DuplicatePrediction(CodeAddr),
    /// The speculation hook fired for an address with no registered entry
    UnknownSpeculationAddress(CodeAddr),
    /// A materialization task already exists for this symbol
    DuplicateTask(Symbol),
    /// A request named a symbol with no materialization task
    UnknownTask(Symbol),
    /// The instrumentation pass produced a unit that fails validation
    InstrumentationBrokeUnit {
        unit: String,
        error: WellFormedError,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateAlias(sym) => {
                write!(f, "implementation already recorded for face symbol {}", sym)
            }
            Self::UnknownAlias(sym) => {
                write!(f, "no implementation recorded for face symbol {}", sym)
            }
            Self::DuplicateStub(sym) => write!(f, "stub already created for symbol {}", sym),
            Self::DuplicatePrediction(addr) => {
                write!(f, "predictions already registered for caller {}", addr)
            }
            Self::UnknownSpeculationAddress(addr) => {
                write!(f, "speculation reported for unregistered caller {}", addr)
            }
            Self::DuplicateTask(sym) => {
                write!(f, "materialization task already exists for {}", sym)
            }
            Self::UnknownTask(sym) => write!(f, "no materialization task for {}", sym),
            Self::InstrumentationBrokeUnit { unit, error } => {
                write!(f, "instrumentation broke unit {}: {}", unit, error)
            }
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Failures raised by the compile backend for a single function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The function body exceeds the backend's size limit
    CodeTooLarge {
        function: Symbol,
        ops: usize,
        limit: usize,
    },
    /// Any other backend rejection
    Backend { function: Symbol, message: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodeTooLarge {
                function,
                ops,
                limit,
            } => write!(
                f,
                "function {} has {} ops, backend limit is {}",
                function, ops, limit
            ),
            Self::Backend { function, message } => {
                write!(f, "backend failed to compile {}: {}", function, message)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Top-level error type for every engine operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An internal bookkeeping invariant was violated
    Invariant(InvariantViolation),
    /// The compile backend failed a materialization task
    Compile(CompileError),
    /// A compiled body faulted during execution
    Execution(ExecError),
    /// No definition for the symbol in the searched namespace or its fallbacks
    MissingSymbol { symbol: Symbol, namespace: String },
    /// The namespace already defines this symbol
    DuplicateDefinition { symbol: Symbol, namespace: String },
    /// A namespace with this name already exists in the session
    DuplicateNamespace(String),
    /// A unit failed structural validation before instrumentation
    MalformedUnit {
        unit: String,
        error: WellFormedError,
    },
    /// A call was dispatched to a function with the wrong argument count
    ArityMismatch {
        function: Symbol,
        expected: u8,
        got: usize,
    },
    /// The address maps to nothing in the session's code map
    InvalidAddress(CodeAddr),
    /// A native host function reported a failure
    Native { symbol: Symbol, message: String },
    /// The session is shutting down and accepts no new work
    ShuttingDown,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invariant(v) => write!(f, "invariant violation: {}", v),
            Self::Compile(e) => write!(f, "compile failure: {}", e),
            Self::Execution(e) => write!(f, "execution fault: {}", e),
            Self::MissingSymbol { symbol, namespace } => {
                write!(f, "symbol {} not found in namespace {}", symbol, namespace)
            }
            Self::DuplicateDefinition { symbol, namespace } => {
                write!(f, "symbol {} already defined in namespace {}", symbol, namespace)
            }
            Self::DuplicateNamespace(name) => write!(f, "namespace {} already exists", name),
            Self::MalformedUnit { unit, error } => {
                write!(f, "unit {} is malformed: {}", unit, error)
            }
            Self::ArityMismatch {
                function,
                expected,
                got,
            } => write!(
                f,
                "function {} expects {} arguments, got {}",
                function, expected, got
            ),
            Self::InvalidAddress(addr) => write!(f, "address {} is not mapped", addr),
            Self::Native { symbol, message } => {
                write!(f, "native function {} failed: {}", symbol, message)
            }
            Self::ShuttingDown => write!(f, "session is shutting down"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<InvariantViolation> for EngineError {
    fn from(v: InvariantViolation) -> Self {
        EngineError::Invariant(v)
    }
}

impl From<CompileError> for EngineError {
    fn from(e: CompileError) -> Self {
        EngineError::Compile(e)
    }
}

impl From<ExecError> for EngineError {
    fn from(e: ExecError) -> Self {
        EngineError::Execution(e)
    }
}

/// Result alias used across the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Process-level sink for errors raised on worker threads or from the
/// speculation hook, where no caller is waiting for a `Result`
pub type ErrorReporter = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// The default reporter: a `tracing` error event
pub fn tracing_reporter() -> ErrorReporter {
    Arc::new(|error| {
        tracing::error!(target: "specjit::session", error = %error, "engine error");
    })
}
