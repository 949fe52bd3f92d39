//! Compilation unit representation
//!
//! A [`CompilationUnit`] is the input handed to the engine: a named batch of
//! function definitions over a small word-sized stack IR. Units arrive
//! already parsed; the engine only walks them for call sites, inserts the
//! speculation entry hook, and hands them to the compile pipeline.
//!
//! The structural validator here is the well-formedness check the
//! instrumentation pass is required to preserve: it simulates operand stack
//! depth, rejects out-of-range argument loads, and pins the entry hook to
//! the first slot of a body.

use std::fmt;

use crate::engine::symbol::{intern, Symbol};

/// A single stack-IR instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Push an immediate word
    PushConst(i64),
    /// Push the caller-supplied argument at the given index
    PushArg(u8),
    /// Pop two words, push their wrapping sum
    Add,
    /// Pop two words, push their wrapping difference
    Sub,
    /// Pop two words, push their wrapping product
    Mul,
    /// Pop `argc` argument words and call the named function through its face
    /// symbol; push the single result word
    Call { callee: Symbol, argc: u8 },
    /// Pop a target address word, then `argc` argument words, and call the
    /// address; push the single result word. Targets are unknown statically,
    /// so these sites never contribute predictions.
    CallIndirect { argc: u8 },
    /// Report this function's entry to the speculation runtime. Inserted by
    /// the instrumentation pass; legal only as the first instruction.
    EnterHook,
    /// Pop the single result word and return it
    Ret,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::PushConst(v) => write!(f, "push.const {}", v),
            Op::PushArg(i) => write!(f, "push.arg {}", i),
            Op::Add => write!(f, "add"),
            Op::Sub => write!(f, "sub"),
            Op::Mul => write!(f, "mul"),
            Op::Call { callee, argc } => write!(f, "call {} /{}", callee, argc),
            Op::CallIndirect { argc } => write!(f, "call.indirect /{}", argc),
            Op::EnterHook => write!(f, "enter.hook"),
            Op::Ret => write!(f, "ret"),
        }
    }
}

/// A single function definition inside a compilation unit
#[derive(Debug, Clone)]
pub struct FunctionDef {
    /// The face symbol callers use to reach this function
    pub name: Symbol,
    /// Number of argument words the function expects
    pub arity: u8,
    /// The function body
    pub ops: Vec<Op>,
}

impl FunctionDef {
    /// Define a function from its name, arity, and body
    pub fn new(name: &str, arity: u8, ops: Vec<Op>) -> Self {
        Self {
            name: intern(name),
            arity,
            ops,
        }
    }
}

/// A named batch of function definitions handed to the engine as one unit
/// of compilation work
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    /// Unit name; also names the implementation namespace the unit's bodies
    /// will live in
    pub name: String,
    /// The unit's function definitions
    pub functions: Vec<FunctionDef>,
}

impl CompilationUnit {
    /// Create an empty unit
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    /// Add a function definition, builder-style
    pub fn with_function(mut self, function: FunctionDef) -> Self {
        self.functions.push(function);
        self
    }

    /// Look up a function definition by name
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        let sym = intern(name);
        self.functions.iter().find(|f| f.name == sym)
    }

    /// Check structural validity of every function in the unit
    pub fn validate(&self) -> Result<(), WellFormedError> {
        for function in &self.functions {
            validate_function(function)?;
        }
        Ok(())
    }

    /// Convenience wrapper around [`CompilationUnit::validate`]
    pub fn is_well_formed(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Structural validity violations detected in a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WellFormedError {
    /// A function has no instructions at all
    EmptyBody { function: Symbol },
    /// A function body does not end in `Ret`
    MissingRet { function: Symbol },
    /// Instructions follow a `Ret`
    CodeAfterRet { function: Symbol, offset: usize },
    /// An instruction pops more words than the stack holds
    StackUnderflow { function: Symbol, offset: usize },
    /// `Ret` executed with a stack depth other than one
    UnbalancedStack { function: Symbol, depth: usize },
    /// `PushArg` index is outside the function's arity
    ArgOutOfRange {
        function: Symbol,
        index: u8,
        arity: u8,
    },
    /// `EnterHook` anywhere but the first instruction
    MisplacedHook { function: Symbol, offset: usize },
}

impl fmt::Display for WellFormedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBody { function } => write!(f, "function {} has an empty body", function),
            Self::MissingRet { function } => {
                write!(f, "function {} does not end in ret", function)
            }
            Self::CodeAfterRet { function, offset } => {
                write!(f, "function {} has code after ret at op {}", function, offset)
            }
            Self::StackUnderflow { function, offset } => {
                write!(f, "function {} underflows the stack at op {}", function, offset)
            }
            Self::UnbalancedStack { function, depth } => write!(
                f,
                "function {} returns with stack depth {} (expected 1)",
                function, depth
            ),
            Self::ArgOutOfRange {
                function,
                index,
                arity,
            } => write!(
                f,
                "function {} loads argument {} but has arity {}",
                function, index, arity
            ),
            Self::MisplacedHook { function, offset } => write!(
                f,
                "function {} has an entry hook at op {} (must be first)",
                function, offset
            ),
        }
    }
}

impl std::error::Error for WellFormedError {}

fn validate_function(function: &FunctionDef) -> Result<(), WellFormedError> {
    let name = function.name;
    if function.ops.is_empty() {
        return Err(WellFormedError::EmptyBody { function: name });
    }

    let last = function.ops.len() - 1;
    let mut depth: usize = 0;
    for (offset, op) in function.ops.iter().enumerate() {
        match *op {
            Op::PushConst(_) => depth += 1,
            Op::PushArg(index) => {
                if index >= function.arity {
                    return Err(WellFormedError::ArgOutOfRange {
                        function: name,
                        index,
                        arity: function.arity,
                    });
                }
                depth += 1;
            }
            Op::Add | Op::Sub | Op::Mul => {
                if depth < 2 {
                    return Err(WellFormedError::StackUnderflow {
                        function: name,
                        offset,
                    });
                }
                depth -= 1;
            }
            Op::Call { argc, .. } => {
                if depth < argc as usize {
                    return Err(WellFormedError::StackUnderflow {
                        function: name,
                        offset,
                    });
                }
                depth = depth - argc as usize + 1;
            }
            Op::CallIndirect { argc } => {
                // target word plus the arguments
                if depth < argc as usize + 1 {
                    return Err(WellFormedError::StackUnderflow {
                        function: name,
                        offset,
                    });
                }
                depth = depth - argc as usize;
            }
            Op::EnterHook => {
                if offset != 0 {
                    return Err(WellFormedError::MisplacedHook {
                        function: name,
                        offset,
                    });
                }
            }
            Op::Ret => {
                if offset != last {
                    return Err(WellFormedError::CodeAfterRet {
                        function: name,
                        offset,
                    });
                }
                if depth != 1 {
                    return Err(WellFormedError::UnbalancedStack {
                        function: name,
                        depth,
                    });
                }
                return Ok(());
            }
        }
    }

    Err(WellFormedError::MissingRet { function: name })
}
