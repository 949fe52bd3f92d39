//! Prediction table and the speculation runtime hook
//!
//! Once a compiled function's entry address is known, the set of callees
//! it is predicted to reach is registered here. When that function later
//! starts executing, its entry hook calls [`Speculator::speculate_for`]
//! with its own address; the speculator copies the predicted set out under
//! the lock and hands each symbol to the dispatcher as a detached,
//! best-effort materialization request. The executing thread pays for one
//! map lookup and one set copy, nothing more; alias resolution and
//! compilation happen on worker threads, racing (but never delaying) the
//! caller's own body.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::alias::AliasTable;
use crate::engine::code::CodeAddr;
use crate::engine::dispatch::{Demand, Dispatcher};
use crate::engine::error::{EngineError, EngineResult, ErrorReporter, InvariantViolation};
use crate::engine::symbol::{Symbol, SymbolSet};
use std::sync::Arc;

/// Caller address to predicted callee mapping, plus the machinery to act
/// on a prediction
pub struct Speculator {
    alias: Arc<AliasTable>,
    dispatch: Arc<Dispatcher>,
    predictions: Mutex<HashMap<CodeAddr, SymbolSet>>,
    reporter: ErrorReporter,
}

impl Speculator {
    /// Create a speculator resolving through the given alias table and
    /// dispatching onto the given dispatcher
    pub fn new(alias: Arc<AliasTable>, dispatch: Arc<Dispatcher>, reporter: ErrorReporter) -> Self {
        Self {
            alias,
            dispatch,
            predictions: Mutex::new(HashMap::new()),
            reporter,
        }
    }

    /// Record the predicted callees for a caller whose address just became
    /// known. Predictions are immutable: a second registration for the same
    /// address is a bookkeeping error and leaves the first intact.
    pub fn register(&self, caller: CodeAddr, predicted: SymbolSet) -> EngineResult<()> {
        let mut predictions = self.predictions.lock();
        if predictions.contains_key(&caller) {
            return Err(InvariantViolation::DuplicatePrediction(caller).into());
        }
        debug!(
            target: "specjit::speculate",
            caller = %caller,
            predicted = predicted.len(),
            "predictions registered"
        );
        predictions.insert(caller, predicted);
        Ok(())
    }

    /// The predicted callee set for a caller, if registered
    pub fn predicted(&self, caller: CodeAddr) -> Option<SymbolSet> {
        self.predictions.lock().get(&caller).cloned()
    }

    /// Number of registered callers
    pub fn len(&self) -> usize {
        self.predictions.lock().len()
    }

    /// Whether no predictions are registered
    pub fn is_empty(&self) -> bool {
        self.predictions.lock().is_empty()
    }

    /// The runtime hook: generated code reports its own entry address the
    /// moment it starts executing. Never blocks and never panics across
    /// the generated-code boundary; every failure is reported and dropped.
    pub fn speculate_for(&self, caller: u64) {
        let caller = CodeAddr::from_raw(caller);
        let predicted = {
            let predictions = self.predictions.lock();
            match predictions.get(&caller) {
                Some(set) => set.clone(),
                None => {
                    let err: EngineError =
                        InvariantViolation::UnknownSpeculationAddress(caller).into();
                    (self.reporter)(&err);
                    return;
                }
            }
        };

        for face in predicted {
            let alias = self.alias.clone();
            let dispatch = self.dispatch.clone();
            let reporter = self.reporter.clone();
            let queued = self.dispatch.spawn_detached(move || {
                resolve_and_ensure(face, &alias, &dispatch, &reporter)
            });
            if !queued {
                debug!(
                    target: "specjit::speculate",
                    symbol = %face,
                    "dropping speculative request, queue full or shutting down"
                );
            }
        }
    }
}

/// Worker-side half of a speculative request: find the implementation and
/// fold into (or start) its materialization. A face with no alias record
/// is a prediction for a symbol this session never installed; speculation
/// is best-effort, so it is dropped.
fn resolve_and_ensure(
    face: Symbol,
    alias: &AliasTable,
    dispatch: &Dispatcher,
    reporter: &ErrorReporter,
) {
    match alias.lookup(face) {
        Ok(record) => {
            if let Err(err) = dispatch.ensure(record.implementation, Demand::Speculative) {
                reporter(&err);
            }
        }
        Err(_) => {
            debug!(
                target: "specjit::speculate",
                symbol = %face,
                "predicted symbol has no implementation record, dropping"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::code::CodeMap;
    use crate::engine::error::{tracing_reporter, EngineError};
    use crate::engine::pipeline::OpcodeBackend;
    use crate::engine::symbol::intern;

    fn speculator() -> Speculator {
        let code = Arc::new(CodeMap::new());
        let dispatch = Arc::new(Dispatcher::new(
            Arc::new(OpcodeBackend::new()),
            code,
            1,
            4,
        ));
        Speculator::new(Arc::new(AliasTable::new()), dispatch, tracing_reporter())
    }

    #[test]
    fn test_register_and_lookup() {
        let spec = speculator();
        let caller = CodeAddr::from_raw(0x2000);
        let mut set = SymbolSet::new();
        set.insert(intern("callee"));
        spec.register(caller, set.clone()).unwrap();
        assert_eq!(spec.predicted(caller), Some(set));
    }

    #[test]
    fn test_duplicate_registration_keeps_original() {
        let spec = speculator();
        let caller = CodeAddr::from_raw(0x2000);

        let mut original = SymbolSet::new();
        original.insert(intern("a"));
        spec.register(caller, original.clone()).unwrap();

        let mut replacement = SymbolSet::new();
        replacement.insert(intern("b"));
        let err = spec.register(caller, replacement).unwrap_err();
        assert_eq!(
            err,
            EngineError::Invariant(InvariantViolation::DuplicatePrediction(caller))
        );
        assert_eq!(spec.predicted(caller), Some(original));
    }

    #[test]
    fn test_unregistered_caller_reports_and_drops() {
        let code = Arc::new(CodeMap::new());
        let dispatch = Arc::new(Dispatcher::new(
            Arc::new(OpcodeBackend::new()),
            code,
            1,
            4,
        ));
        let reports: Arc<Mutex<Vec<EngineError>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let reporter: ErrorReporter = Arc::new(move |err| sink.lock().push(EngineError::clone(err)));
        let spec = Speculator::new(Arc::new(AliasTable::new()), dispatch, reporter);

        spec.speculate_for(0xdead);
        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0],
            EngineError::Invariant(InvariantViolation::UnknownSpeculationAddress(_))
        ));
    }
}
