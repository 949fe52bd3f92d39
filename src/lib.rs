/// specjit - Speculative Lazy Materialization Engine
///
/// This library provides the lazy, speculative compilation core of a JIT
/// engine: functions are callable before they are compiled, running code
/// reports its likely callees so they can be compiled ahead of need, and a
/// worker pool materializes bodies concurrently with at-most-once
/// bookkeeping per symbol.
///
/// # Architecture
///
/// A unit of code moves through three stages:
///
/// 1. **Instrumentation** (`engine::instrument`)
///    - Walks every function for statically-known call sites
///    - Inserts the speculation entry hook ahead of the first instruction
///    - Preserves structural validity of the unit
///
/// 2. **Lazy installation** (`engine::session`, `engine::stubs`)
///    - Each function gets an indirection stub, an alias record, and a
///      pending materialization task; faces are published immediately
///    - Nothing compiles until a stub is called or a prediction fires
///
/// 3. **Materialization** (`engine::dispatch`)
///    - Genuine calls block on the symbol's one task; speculative requests
///      enqueue the same task without blocking the running caller
///    - On resolution, predictions register, the owning namespace learns
///      the address, and the stub's target is rewritten exactly once
///
/// # Example
///
/// ```rust
/// use specjit::{CompilationUnit, FunctionDef, JitSession, Op};
///
/// let session = JitSession::new();
/// let unit = CompilationUnit::new("demo").with_function(FunctionDef::new(
///     "double",
///     1,
///     vec![Op::PushArg(0), Op::PushConst(2), Op::Mul, Op::Ret],
/// ));
/// session.add_unit(unit).unwrap();
///
/// // first call compiles through the stub; later calls jump straight in
/// assert_eq!(session.call_entry("double", &[21]).unwrap(), 42);
/// ```
///
/// # Guarantees
///
/// - **At-most-one compilation per symbol**: concurrent genuine calls and
///   speculative triggers fold into a single task and observe the same
///   address or the same failure
/// - **Trampoline correctness**: a stub blocks callers until its body
///   exists, then jumps directly forever after; the target rewrite is a
///   single atomic word store
/// - **Non-blocking speculation**: the entry hook costs one table lookup
///   and a set copy on the running thread, independent of compile times
pub mod engine;
pub mod unit;

pub use engine::code::{CodeAddr, CodeEntity, CodeMap, CompiledCode, CompiledFn, NativeFn};
pub use engine::error::{
    tracing_reporter, CompileError, EngineError, EngineResult, ErrorReporter, InvariantViolation,
};
pub use engine::exec::ExecError;
pub use engine::pipeline::{CompilePipeline, OpcodeBackend};
pub use engine::session::{JitSession, SessionConfig};
pub use engine::symbol::{intern, Symbol, SymbolSet};
pub use unit::{CompilationUnit, FunctionDef, Op, WellFormedError};
