//! Speculation instrumentation pass
//!
//! Runs over every function of a unit before the unit reaches the compile
//! backend. The call-site walker collects each function's statically-known
//! callees; functions with at least one get the entry hook inserted ahead
//! of their first instruction. Indirect call sites contribute nothing: a
//! missed prediction only costs prefetch benefit, never correctness.
//!
//! The pass must hand back a unit that still passes the structural
//! validator; breaking it is a bug in the pass itself, not in the input.

use std::collections::HashMap;

use tracing::trace;

use crate::engine::error::{EngineResult, InvariantViolation};
use crate::engine::symbol::{Symbol, SymbolSet};
use crate::unit::{CompilationUnit, FunctionDef, Op};

/// Signature for the replaceable call-site walker
pub type CallSiteWalker = fn(&FunctionDef) -> SymbolSet;

/// Default walker: direct `Call` sites only
pub fn direct_callees(function: &FunctionDef) -> SymbolSet {
    let mut callees = SymbolSet::new();
    for op in &function.ops {
        if let Op::Call { callee, .. } = op {
            callees.insert(*callee);
        }
    }
    callees
}

/// Rewrites units to report their predicted callees at function entry
pub struct InstrumentationPass {
    walker: CallSiteWalker,
}

impl InstrumentationPass {
    /// Pass with the default direct-call walker
    pub fn new() -> Self {
        Self {
            walker: direct_callees,
        }
    }

    /// Replace the call-site walker
    pub fn set_walker(&mut self, walker: CallSiteWalker) {
        self.walker = walker;
    }

    /// Instrument every function of the unit in place. Returns the
    /// predicted callee set per instrumented function; functions with no
    /// statically-known callees are left untouched and absent from the map.
    pub fn run(&self, unit: &mut CompilationUnit) -> EngineResult<HashMap<Symbol, SymbolSet>> {
        let mut predicted = HashMap::new();

        for function in &mut unit.functions {
            let callees = (self.walker)(function);
            if callees.is_empty() {
                continue;
            }
            if !matches!(function.ops.first(), Some(Op::EnterHook)) {
                function.ops.insert(0, Op::EnterHook);
            }
            trace!(
                target: "specjit::instrument",
                function = %function.name,
                callees = callees.len(),
                "inserted entry hook"
            );
            predicted.insert(function.name, callees);
        }

        if let Err(error) = unit.validate() {
            return Err(InvariantViolation::InstrumentationBrokeUnit {
                unit: unit.name.clone(),
                error,
            }
            .into());
        }

        Ok(predicted)
    }
}

impl Default for InstrumentationPass {
    fn default() -> Self {
        InstrumentationPass::new()
    }
}
