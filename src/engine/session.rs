//! The engine session
//!
//! A [`JitSession`] owns every piece of mutable engine state (namespaces,
//! alias table, prediction table, stubs, code map, and the materialization
//! dispatcher) and is passed by reference to anything that needs them.
//! Nothing here is ambient except the process-wide symbol intern table.
//!
//! Adding a unit instruments it, creates a stub and a materialization task
//! per function, and publishes the faces into the main namespace; nothing
//! compiles until a stub is called or a speculative request lands.
//! Dropping (or explicitly shutting down) the session drains in-flight
//! compilation before the workers are released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::engine::alias::{AliasRecord, AliasTable};
use crate::engine::code::{CodeAddr, CodeEntity, CodeMap, NativeFn};
use crate::engine::dispatch::{Dispatcher, PendingWork};
use crate::engine::error::{
    tracing_reporter, EngineError, EngineResult, ErrorReporter, InvariantViolation,
};
use crate::engine::exec;
use crate::engine::instrument::{CallSiteWalker, InstrumentationPass};
use crate::engine::namespace::{search_namespaces, Namespace};
use crate::engine::pipeline::{CompilePipeline, OpcodeBackend};
use crate::engine::speculator::Speculator;
use crate::engine::stubs::{StubCell, StubManager};
use crate::engine::symbol::{intern, Symbol};
use crate::unit::CompilationUnit;

/// Session construction parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker threads in the materialization pool
    pub worker_threads: usize,
    /// Queue slots per worker in the pool's submission channel
    pub queue_multiplier: usize,
    /// Name of the namespace faces are published into
    pub main_namespace: String,
    /// Name of the namespace native host functions are published into
    pub host_namespace: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            queue_multiplier: 4,
            main_namespace: "main".into(),
            host_namespace: "host".into(),
        }
    }
}

/// Process-wide engine session
pub struct JitSession {
    code: Arc<CodeMap>,
    alias: Arc<AliasTable>,
    stubs: StubManager,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    main_ns: Arc<Namespace>,
    host_ns: Arc<Namespace>,
    dispatcher: Arc<Dispatcher>,
    speculator: Arc<Speculator>,
    pass: InstrumentationPass,
    reporter: ErrorReporter,
}

impl JitSession {
    /// Session with default config and the reference backend
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default(), Arc::new(OpcodeBackend::new()))
    }

    /// Session with default config and a custom backend
    pub fn with_pipeline(pipeline: Arc<dyn CompilePipeline>) -> Self {
        Self::with_config(SessionConfig::default(), pipeline)
    }

    /// Session with explicit config and backend
    pub fn with_config(config: SessionConfig, pipeline: Arc<dyn CompilePipeline>) -> Self {
        Self::with_reporter(config, pipeline, tracing_reporter())
    }

    /// Session with an explicit process-level error reporter
    pub fn with_reporter(
        config: SessionConfig,
        pipeline: Arc<dyn CompilePipeline>,
        reporter: ErrorReporter,
    ) -> Self {
        let worker_threads = config.worker_threads.max(1);
        let queue_depth = (worker_threads * config.queue_multiplier).max(1);

        let code = Arc::new(CodeMap::new());
        let alias = Arc::new(AliasTable::new());
        let dispatcher = Arc::new(Dispatcher::new(
            pipeline,
            code.clone(),
            worker_threads,
            queue_depth,
        ));
        let speculator = Arc::new(Speculator::new(
            alias.clone(),
            dispatcher.clone(),
            reporter.clone(),
        ));

        let main_ns = Arc::new(Namespace::new(config.main_namespace.clone()));
        let host_ns = Arc::new(Namespace::new(config.host_namespace.clone()));
        main_ns.set_fallback(search_namespaces(vec![host_ns.clone()]));

        let mut namespaces = HashMap::new();
        namespaces.insert(config.main_namespace.clone(), main_ns.clone());
        namespaces.insert(config.host_namespace.clone(), host_ns.clone());

        Self {
            stubs: StubManager::new(code.clone()),
            code,
            alias,
            namespaces: RwLock::new(namespaces),
            main_ns,
            host_ns,
            dispatcher,
            speculator,
            pass: InstrumentationPass::new(),
            reporter,
        }
    }

    /// Replace the instrumentation pass's call-site walker
    pub fn set_walker(&mut self, walker: CallSiteWalker) {
        self.pass.set_walker(walker);
    }

    /// The session's speculator
    pub fn speculator(&self) -> &Speculator {
        &self.speculator
    }

    /// The session's dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The session's alias table
    pub fn alias_table(&self) -> &AliasTable {
        &self.alias
    }

    /// The namespace faces are published into
    pub fn main_namespace(&self) -> &Arc<Namespace> {
        &self.main_ns
    }

    /// Create a fresh namespace owned by this session
    pub fn create_namespace(&self, name: impl Into<String>) -> EngineResult<Arc<Namespace>> {
        let name = name.into();
        let mut namespaces = self.namespaces.write();
        if namespaces.contains_key(&name) {
            return Err(EngineError::DuplicateNamespace(name));
        }
        let namespace = Arc::new(Namespace::new(name.clone()));
        namespaces.insert(name, namespace.clone());
        Ok(namespace)
    }

    /// Look up a namespace by name
    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().get(name).cloned()
    }

    /// Publish a native host function; callable immediately through the
    /// main namespace's fallback
    pub fn define_native<F>(&self, name: &str, arity: u8, func: F) -> EngineResult<CodeAddr>
    where
        F: Fn(&[i64]) -> Result<i64, String> + Send + Sync + 'static,
    {
        let symbol = intern(name);
        let func: NativeFn = Arc::new(func);
        let addr = self.code.install_native(symbol, arity, func);
        self.host_ns.define(symbol, addr)?;
        Ok(addr)
    }

    /// Add a unit: instrument it, install a stub, alias record, and
    /// materialization task per function, and publish the faces. Compiles
    /// nothing; the first genuine or speculative request does.
    pub fn add_unit(&self, mut unit: CompilationUnit) -> EngineResult<()> {
        let unit_name = unit.name.clone();
        unit.validate().map_err(|error| EngineError::MalformedUnit {
            unit: unit_name.clone(),
            error,
        })?;

        let predicted = self.pass.run(&mut unit)?;

        for function in &unit.functions {
            if self.alias.contains(function.name) {
                return Err(InvariantViolation::DuplicateAlias(function.name).into());
            }
        }

        let impl_ns = self.create_namespace(format!("{}.impl", unit_name))?;

        let mut aliases = Vec::with_capacity(unit.functions.len());
        let mut faces = Vec::with_capacity(unit.functions.len());
        for function in unit.functions {
            let face = function.name;
            let implementation = intern(&format!("{}$body", face.as_str()));
            let stub = self.stubs.create_stub(face)?;

            self.dispatcher.add_task(
                implementation,
                PendingWork {
                    face,
                    function,
                    namespace: impl_ns.clone(),
                    stub: stub.clone(),
                },
            )?;

            if let Some(set) = predicted.get(&face) {
                let speculator = self.speculator.clone();
                let set = set.clone();
                let reporter = self.reporter.clone();
                self.dispatcher.when_resolved(
                    implementation,
                    Box::new(move |result| match result {
                        Ok(addr) => {
                            if let Err(err) = speculator.register(addr, set) {
                                reporter(&err);
                            }
                        }
                        Err(err) => reporter(&err),
                    }),
                )?;
            }

            aliases.push((
                face,
                AliasRecord {
                    implementation,
                    namespace: impl_ns.clone(),
                },
            ));
            faces.push((face, stub.addr()));
        }

        // publish: aliases first, faces last, so a racing caller that can
        // see a face can always resolve its record and task
        self.alias.record_batch(aliases)?;
        for (face, addr) in faces {
            self.main_ns.define(face, addr)?;
        }

        debug!(target: "specjit::session", unit = %unit_name, "unit added");
        Ok(())
    }

    /// Resolve an entry point to its callable address (usually a stub).
    /// Never triggers compilation.
    pub fn lookup_entry(&self, name: &str) -> EngineResult<CodeAddr> {
        self.resolve_face(intern(name))
    }

    /// Resolve a face symbol through the main namespace
    pub(crate) fn resolve_face(&self, symbol: Symbol) -> EngineResult<CodeAddr> {
        self.main_ns
            .resolve(symbol)
            .ok_or_else(|| EngineError::MissingSymbol {
                symbol,
                namespace: self.main_ns.name().to_string(),
            })
    }

    /// Call whatever lives at an address. A stub either jumps through its
    /// resolved target or blocks this thread on the symbol's one
    /// materialization, rewrites the target, and proceeds.
    pub fn call_address(&self, addr: CodeAddr, args: &[i64]) -> EngineResult<i64> {
        match self.code.get(addr) {
            None => Err(EngineError::InvalidAddress(addr)),
            Some(CodeEntity::Body(body)) => exec::run(self, &body, args),
            Some(CodeEntity::Native(native)) => {
                if args.len() != native.arity as usize {
                    return Err(EngineError::ArityMismatch {
                        function: native.name,
                        expected: native.arity,
                        got: args.len(),
                    });
                }
                (native.func)(args).map_err(|message| EngineError::Native {
                    symbol: native.name,
                    message,
                })
            }
            Some(CodeEntity::Stub(stub)) => {
                let target = match stub.target() {
                    Some(target) => target,
                    None => self.resolve_stub(&stub)?,
                };
                self.call_address(target, args)
            }
        }
    }

    /// Convenience: look an entry point up and call it
    pub fn call_entry(&self, name: &str, args: &[i64]) -> EngineResult<i64> {
        let addr = self.lookup_entry(name)?;
        self.call_address(addr, args)
    }

    /// First call through an unresolved stub: fold into the symbol's one
    /// materialization task, wait for it, and perform (or lose, to an
    /// identical winner) the one-time target rewrite.
    fn resolve_stub(&self, stub: &StubCell) -> EngineResult<CodeAddr> {
        let record = self.alias.lookup(stub.symbol())?;
        let addr = self.dispatcher.await_ready(record.implementation)?;
        stub.resolve(addr);
        Ok(addr)
    }

    /// Render namespaces, task states, and stub targets for diagnostics
    pub fn dump_state(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "namespaces:");
        for (name, ns) in self.namespaces.read().iter() {
            let _ = writeln!(out, "  {} ({} definitions)", name, ns.len());
            let mut defs = ns.snapshot();
            defs.sort_by_key(|(sym, _)| sym.as_str());
            for (sym, addr) in defs {
                let _ = writeln!(out, "    {} -> {}", sym, addr);
            }
        }

        let _ = writeln!(out, "tasks:");
        let mut tasks = self.dispatcher.task_snapshot();
        tasks.sort_by_key(|(sym, _)| sym.as_str());
        for (sym, state) in tasks {
            let _ = writeln!(out, "  {}: {}", sym, state);
        }

        let _ = writeln!(out, "stubs:");
        let mut stubs = self.stubs.snapshot();
        stubs.sort_by_key(|(sym, _, _)| sym.as_str());
        for (sym, addr, target) in stubs {
            match target {
                Some(target) => {
                    let _ = writeln!(out, "  {} @ {} -> {}", sym, addr, target);
                }
                None => {
                    let _ = writeln!(out, "  {} @ {} -> <unresolved>", sym, addr);
                }
            }
        }
        out
    }

    /// Drain in-flight compilation and join the workers. Dropping the
    /// session does the same.
    pub fn shutdown(self) {
        self.dispatcher.shutdown();
    }
}

impl Default for JitSession {
    fn default() -> Self {
        JitSession::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{FunctionDef, Op};

    fn call(callee: &str, argc: u8) -> Op {
        Op::Call {
            callee: intern(callee),
            argc,
        }
    }

    #[test]
    fn test_add_unit_publishes_faces_lazily() {
        let session = JitSession::new();
        let unit = CompilationUnit::new("u").with_function(FunctionDef::new(
            "double",
            1,
            vec![Op::PushArg(0), Op::PushConst(2), Op::Mul, Op::Ret],
        ));
        session.add_unit(unit).unwrap();

        let addr = session.lookup_entry("double").unwrap();
        assert!(!addr.is_null());
        // nothing compiled yet: the entry resolves to an unresolved stub
        assert_eq!(
            session.dispatcher().task(intern("double$body")).unwrap().state_name(),
            "pending"
        );
    }

    #[test]
    fn test_call_entry_compiles_and_runs() {
        let session = JitSession::new();
        let unit = CompilationUnit::new("u").with_function(FunctionDef::new(
            "double",
            1,
            vec![Op::PushArg(0), Op::PushConst(2), Op::Mul, Op::Ret],
        ));
        session.add_unit(unit).unwrap();

        assert_eq!(session.call_entry("double", &[21]).unwrap(), 42);
        assert_eq!(
            session.dispatcher().task(intern("double$body")).unwrap().state_name(),
            "ready"
        );
    }

    #[test]
    fn test_missing_entry() {
        let session = JitSession::new();
        assert!(matches!(
            session.lookup_entry("ghost"),
            Err(EngineError::MissingSymbol { .. })
        ));
    }

    #[test]
    fn test_malformed_unit_rejected() {
        let session = JitSession::new();
        let unit = CompilationUnit::new("bad")
            .with_function(FunctionDef::new("f", 0, vec![Op::PushConst(1)]));
        assert!(matches!(
            session.add_unit(unit),
            Err(EngineError::MalformedUnit { .. })
        ));
    }

    #[test]
    fn test_duplicate_face_across_units() {
        let session = JitSession::new();
        let mk = || {
            CompilationUnit::new("u1").with_function(FunctionDef::new(
                "f",
                0,
                vec![Op::PushConst(1), Op::Ret],
            ))
        };
        let mut first = mk();
        first.name = "a".into();
        let mut second = mk();
        second.name = "b".into();

        session.add_unit(first).unwrap();
        assert!(matches!(
            session.add_unit(second),
            Err(EngineError::Invariant(InvariantViolation::DuplicateAlias(_)))
        ));
    }

    #[test]
    fn test_native_reachable_through_fallback() {
        let session = JitSession::new();
        session
            .define_native("host_mul", 2, |args| Ok(args[0] * args[1]))
            .unwrap();

        let unit = CompilationUnit::new("u").with_function(FunctionDef::new(
            "six_times",
            1,
            vec![
                Op::PushArg(0),
                Op::PushConst(6),
                call("host_mul", 2),
                Op::Ret,
            ],
        ));
        session.add_unit(unit).unwrap();

        assert_eq!(session.call_entry("six_times", &[7]).unwrap(), 42);
    }

    #[test]
    fn test_native_arity_checked() {
        let session = JitSession::new();
        let addr = session.define_native("one", 1, |args| Ok(args[0])).unwrap();
        assert!(matches!(
            session.call_address(addr, &[1, 2]),
            Err(EngineError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn test_dump_state_lists_components() {
        let session = JitSession::new();
        let unit = CompilationUnit::new("u").with_function(FunctionDef::new(
            "f",
            0,
            vec![Op::PushConst(1), Op::Ret],
        ));
        session.add_unit(unit).unwrap();

        let dump = session.dump_state();
        assert!(dump.contains("namespaces:"));
        assert!(dump.contains("u.impl"));
        assert!(dump.contains("f$body: pending"));
        assert!(dump.contains("<unresolved>"));
    }
}
