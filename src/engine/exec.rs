//! Execution of compiled bodies
//!
//! A compiled body is an op stream over word-sized values, run on a small
//! operand stack. Every `Call` site resolves its callee's face symbol
//! through the session's main namespace and dispatches to whatever address
//! that yields, usually a stub; that is how lazy materialization gets
//! triggered by real calls. `EnterHook` reports the running
//! function's own entry address to the speculator and continues
//! immediately.
//!
//! The structural validator rules most faults out before a body ever
//! compiles; the checks here cover code arriving from a backend the
//! validator never saw.

use std::fmt;

use smallvec::SmallVec;

use crate::engine::code::{CodeAddr, CompiledFn};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::session::JitSession;
use crate::engine::symbol::Symbol;
use crate::unit::Op;

/// Faults raised while executing a compiled body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// An op popped more words than the stack holds
    StackUnderflow { function: Symbol, offset: usize },
    /// An argument load outside the caller-supplied arguments
    BadArgIndex { function: Symbol, index: u8 },
    /// The body finished without producing a result word
    MissingResult { function: Symbol },
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow { function, offset } => {
                write!(f, "stack underflow in {} at op {}", function, offset)
            }
            Self::BadArgIndex { function, index } => {
                write!(f, "bad argument index {} in {}", index, function)
            }
            Self::MissingResult { function } => {
                write!(f, "function {} finished without a result", function)
            }
        }
    }
}

impl std::error::Error for ExecError {}

/// Run one compiled body to completion
pub(crate) fn run(session: &JitSession, body: &CompiledFn, args: &[i64]) -> EngineResult<i64> {
    if args.len() != body.arity as usize {
        return Err(EngineError::ArityMismatch {
            function: body.name,
            expected: body.arity,
            got: args.len(),
        });
    }

    let mut stack: SmallVec<[i64; 8]> = SmallVec::new();

    for (offset, op) in body.ops.iter().enumerate() {
        match *op {
            Op::EnterHook => session.speculator().speculate_for(body.addr.as_u64()),
            Op::PushConst(value) => stack.push(value),
            Op::PushArg(index) => match args.get(index as usize) {
                Some(value) => stack.push(*value),
                None => {
                    return Err(ExecError::BadArgIndex {
                        function: body.name,
                        index,
                    }
                    .into())
                }
            },
            Op::Add | Op::Sub | Op::Mul => {
                let (rhs, lhs) = pop2(&mut stack, body.name, offset)?;
                let result = match *op {
                    Op::Add => lhs.wrapping_add(rhs),
                    Op::Sub => lhs.wrapping_sub(rhs),
                    _ => lhs.wrapping_mul(rhs),
                };
                stack.push(result);
            }
            Op::Call { callee, argc } => {
                let call_args = pop_args(&mut stack, argc, body.name, offset)?;
                let target = session.resolve_face(callee)?;
                let result = session.call_address(target, &call_args)?;
                stack.push(result);
            }
            Op::CallIndirect { argc } => {
                let target = pop1(&mut stack, body.name, offset)?;
                let call_args = pop_args(&mut stack, argc, body.name, offset)?;
                let result =
                    session.call_address(CodeAddr::from_raw(target as u64), &call_args)?;
                stack.push(result);
            }
            Op::Ret => {
                return stack.pop().ok_or_else(|| {
                    ExecError::MissingResult {
                        function: body.name,
                    }
                    .into()
                })
            }
        }
    }

    Err(ExecError::MissingResult {
        function: body.name,
    }
    .into())
}

fn pop1(
    stack: &mut SmallVec<[i64; 8]>,
    function: Symbol,
    offset: usize,
) -> Result<i64, ExecError> {
    stack
        .pop()
        .ok_or(ExecError::StackUnderflow { function, offset })
}

fn pop2(
    stack: &mut SmallVec<[i64; 8]>,
    function: Symbol,
    offset: usize,
) -> Result<(i64, i64), ExecError> {
    let first = pop1(stack, function, offset)?;
    let second = pop1(stack, function, offset)?;
    Ok((first, second))
}

fn pop_args(
    stack: &mut SmallVec<[i64; 8]>,
    argc: u8,
    function: Symbol,
    offset: usize,
) -> Result<SmallVec<[i64; 4]>, ExecError> {
    let mut args: SmallVec<[i64; 4]> = SmallVec::new();
    for _ in 0..argc {
        args.push(pop1(stack, function, offset)?);
    }
    args.reverse();
    Ok(args)
}
