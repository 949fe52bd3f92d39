//! Compile backend seam
//!
//! The engine never generates machine code itself; it hands instrumented
//! functions to whatever implements [`CompilePipeline`] and links the
//! result into the session's code map. The [`OpcodeBackend`] is the
//! reference implementation: it emits the instrumented op stream directly,
//! which is enough to execute bodies and to exercise every materialization
//! path. Tests wrap the trait to count invocations, add latency, or
//! inject failures.

use crate::engine::code::CompiledCode;
use crate::engine::error::CompileError;
use crate::unit::FunctionDef;

/// Estimated machine bytes per emitted op, for code size accounting
const BYTES_PER_OP: usize = 8;

/// The backend that turns one instrumented function into executable code
pub trait CompilePipeline: Send + Sync {
    /// Compile a single function. Called on worker threads; must be safe to
    /// invoke for different functions concurrently.
    fn compile(&self, function: &FunctionDef) -> Result<CompiledCode, CompileError>;
}

/// Reference backend emitting the op stream as-is
pub struct OpcodeBackend {
    max_ops: usize,
}

impl OpcodeBackend {
    /// Backend with the default body size limit
    pub fn new() -> Self {
        Self { max_ops: 64 * 1024 }
    }

    /// Backend with a custom body size limit
    pub fn with_limit(max_ops: usize) -> Self {
        Self { max_ops }
    }
}

impl Default for OpcodeBackend {
    fn default() -> Self {
        OpcodeBackend::new()
    }
}

impl CompilePipeline for OpcodeBackend {
    fn compile(&self, function: &FunctionDef) -> Result<CompiledCode, CompileError> {
        if function.ops.len() > self.max_ops {
            return Err(CompileError::CodeTooLarge {
                function: function.name,
                ops: function.ops.len(),
                limit: self.max_ops,
            });
        }
        Ok(CompiledCode {
            name: function.name,
            arity: function.arity,
            ops: function.ops.clone().into(),
            code_size: function.ops.len() * BYTES_PER_OP,
        })
    }
}
