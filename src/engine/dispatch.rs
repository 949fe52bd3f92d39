//! Materialization dispatcher
//!
//! The process-wide scheduler for compilation work. Every symbol gets
//! exactly one [`SymbolTask`] carrying its pending work; workers claim a
//! task at most once, so any number of genuine callers and speculative
//! triggers fold into a single compilation. Task state moves through
//!
//! ```text
//! pending ──> in-flight ──> resolved ──> ready
//!                  │
//!                  └──────> failed
//! ```
//!
//! where *resolved* means the body has an address (continuations
//! registered via [`Dispatcher::when_resolved`] fire here, before the
//! symbol is callable) and *ready* means the stub has been rewritten and
//! the namespace updated. Waiters block on the task's condvar; a failure
//! is cloned to every current and future waiter.
//!
//! Workers are named OS threads blocking on a bounded crossbeam channel.
//! Speculative submissions use `try_send` and fall back to compiling
//! inline on the submitting worker when the queue is full; genuine
//! submissions block. On shutdown the channel is closed and workers drain
//! everything already queued before they are joined.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::engine::code::{CodeAddr, CodeMap};
use crate::engine::error::{EngineError, EngineResult, InvariantViolation};
use crate::engine::namespace::Namespace;
use crate::engine::pipeline::CompilePipeline;
use crate::engine::stubs::StubCell;
use crate::engine::symbol::Symbol;
use crate::unit::FunctionDef;

/// A boxed job for the worker pool
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Continuation invoked once a symbol's address is known (or its task failed)
pub type ResolvedCallback = Box<dyn FnOnce(Result<CodeAddr, EngineError>) + Send + 'static>;

/// Who is asking for a symbol to be materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    /// A caller that will block until the symbol is ready
    Genuine,
    /// A best-effort prefetch; may be dropped under pressure
    Speculative,
}

/// Everything a worker needs to materialize one symbol
pub struct PendingWork {
    /// The face symbol callers use
    pub face: Symbol,
    /// The instrumented function body
    pub function: FunctionDef,
    /// The namespace that will own the compiled body
    pub namespace: Arc<Namespace>,
    /// The stub to rewrite once the body has an address
    pub stub: Arc<StubCell>,
}

enum TaskPhase {
    Pending(Box<PendingWork>),
    InFlight,
    Resolved(CodeAddr),
    Ready(CodeAddr),
    Failed(EngineError),
}

struct TaskState {
    phase: TaskPhase,
    /// Set once a materialization job has been queued, so redundant ensures
    /// do not enqueue duplicates
    submitted: bool,
    callbacks: Vec<ResolvedCallback>,
}

/// Per-symbol materialization state
pub struct SymbolTask {
    symbol: Symbol,
    state: Mutex<TaskState>,
    ready: Condvar,
}

impl SymbolTask {
    fn new(symbol: Symbol, work: PendingWork) -> Self {
        Self {
            symbol,
            state: Mutex::new(TaskState {
                phase: TaskPhase::Pending(Box::new(work)),
                submitted: false,
                callbacks: Vec::new(),
            }),
            ready: Condvar::new(),
        }
    }

    /// The implementation symbol this task materializes
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    /// Current lifecycle state, for diagnostics
    pub fn state_name(&self) -> &'static str {
        match self.state.lock().phase {
            TaskPhase::Pending(_) => "pending",
            TaskPhase::InFlight => "in-flight",
            TaskPhase::Resolved(_) => "resolved",
            TaskPhase::Ready(_) => "ready",
            TaskPhase::Failed(_) => "failed",
        }
    }
}

/// Worker pool and per-symbol task table
pub struct Dispatcher {
    pipeline: Arc<dyn CompilePipeline>,
    code: Arc<CodeMap>,
    tasks: DashMap<Symbol, Arc<SymbolTask>>,
    pool: WorkerPool,
}

impl Dispatcher {
    /// Create a dispatcher with the given backend and pool geometry
    pub fn new(
        pipeline: Arc<dyn CompilePipeline>,
        code: Arc<CodeMap>,
        worker_threads: usize,
        queue_depth: usize,
    ) -> Self {
        Self {
            pipeline,
            code,
            tasks: DashMap::new(),
            pool: WorkerPool::new(worker_threads, queue_depth),
        }
    }

    /// Number of worker threads
    pub fn worker_threads(&self) -> usize {
        self.pool.num_threads
    }

    /// Create the unique task for a symbol. A second task for the same
    /// symbol is a bookkeeping error.
    pub fn add_task(&self, symbol: Symbol, work: PendingWork) -> EngineResult<Arc<SymbolTask>> {
        use dashmap::mapref::entry::Entry;
        match self.tasks.entry(symbol) {
            Entry::Occupied(_) => Err(InvariantViolation::DuplicateTask(symbol).into()),
            Entry::Vacant(slot) => {
                let task = Arc::new(SymbolTask::new(symbol, work));
                slot.insert(task.clone());
                Ok(task)
            }
        }
    }

    /// Look up the task for a symbol
    pub fn task(&self, symbol: Symbol) -> Option<Arc<SymbolTask>> {
        self.tasks.get(&symbol).map(|t| t.value().clone())
    }

    /// Submit the symbol's task to the pool iff it is still pending and not
    /// already queued; every other state makes this a no-op, which is what
    /// folds concurrent requests into one compilation.
    pub fn ensure(&self, symbol: Symbol, demand: Demand) -> EngineResult<()> {
        let task = self
            .task(symbol)
            .ok_or(InvariantViolation::UnknownTask(symbol))?;

        {
            let mut state = task.state.lock();
            let pending = matches!(state.phase, TaskPhase::Pending(_));
            if !pending || state.submitted {
                return Ok(());
            }
            state.submitted = true;
        }

        let job = self.materialize_job(task.clone());
        let queued = match demand {
            Demand::Genuine => self.pool.spawn(job),
            Demand::Speculative => self.pool.try_spawn(job),
        };
        if !queued {
            match demand {
                Demand::Genuine => {
                    // pool is gone; nothing will ever run this task
                    fail_task(&task, EngineError::ShuttingDown);
                    return Err(EngineError::ShuttingDown);
                }
                Demand::Speculative => {
                    debug!(
                        target: "specjit::dispatch",
                        symbol = %symbol,
                        "queue full, materializing speculative request inline"
                    );
                    run_materialization(&task, &*self.pipeline, &self.code);
                }
            }
        }
        Ok(())
    }

    /// Block until the symbol's task is ready or failed, folding into any
    /// in-flight work first.
    pub fn await_ready(&self, symbol: Symbol) -> EngineResult<CodeAddr> {
        self.ensure(symbol, Demand::Genuine)?;
        let task = self
            .task(symbol)
            .ok_or(InvariantViolation::UnknownTask(symbol))?;

        let mut state = task.state.lock();
        loop {
            match &state.phase {
                TaskPhase::Ready(addr) => return Ok(*addr),
                TaskPhase::Failed(err) => return Err(err.clone()),
                _ => task.ready.wait(&mut state),
            }
        }
    }

    /// Register a continuation for the moment the symbol's address is
    /// known. Fires on the resolving worker thread, strictly before the
    /// task becomes ready; if the task already has an address (or already
    /// failed) the continuation runs immediately on the calling thread.
    pub fn when_resolved(&self, symbol: Symbol, callback: ResolvedCallback) -> EngineResult<()> {
        let task = self
            .task(symbol)
            .ok_or(InvariantViolation::UnknownTask(symbol))?;

        let mut state = task.state.lock();
        match &state.phase {
            TaskPhase::Resolved(addr) | TaskPhase::Ready(addr) => {
                let addr = *addr;
                drop(state);
                callback(Ok(addr));
            }
            TaskPhase::Failed(err) => {
                let err = err.clone();
                drop(state);
                callback(Err(err));
            }
            _ => state.callbacks.push(callback),
        }
        Ok(())
    }

    /// Run an arbitrary job on the pool without waiting for it. Returns
    /// false (dropping the job) if the queue is full or the pool is gone.
    pub(crate) fn spawn_detached(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.pool.try_spawn(Box::new(job))
    }

    /// Lifecycle state of every task, for diagnostics
    pub fn task_snapshot(&self) -> Vec<(Symbol, &'static str)> {
        self.tasks
            .iter()
            .map(|entry| (entry.value().symbol(), entry.value().state_name()))
            .collect()
    }

    /// Close the queue, drain everything already submitted, and join the
    /// workers. Idempotent.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn materialize_job(&self, task: Arc<SymbolTask>) -> Job {
        let pipeline = self.pipeline.clone();
        let code = self.code.clone();
        Box::new(move || run_materialization(&task, &*pipeline, &code))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Claim and run one task. A task that is no longer pending was claimed by
/// someone else and is left alone.
fn run_materialization(task: &Arc<SymbolTask>, pipeline: &dyn CompilePipeline, code: &CodeMap) {
    let work = {
        let mut state = task.state.lock();
        match std::mem::replace(&mut state.phase, TaskPhase::InFlight) {
            TaskPhase::Pending(work) => work,
            other => {
                state.phase = other;
                return;
            }
        }
    };

    debug!(target: "specjit::dispatch", symbol = %task.symbol, face = %work.face, "materializing");

    match pipeline.compile(&work.function) {
        Ok(compiled) => {
            let body = code.install_body(compiled);
            let addr = body.addr;

            // address is known: fire continuations before the symbol
            // becomes callable
            let callbacks = {
                let mut state = task.state.lock();
                state.phase = TaskPhase::Resolved(addr);
                std::mem::take(&mut state.callbacks)
            };
            for callback in callbacks {
                callback(Ok(addr));
            }

            if let Err(err) = work.namespace.define(task.symbol, addr) {
                warn!(
                    target: "specjit::dispatch",
                    symbol = %task.symbol,
                    error = %err,
                    "could not define resolved symbol"
                );
            }
            work.stub.resolve(addr);

            {
                let mut state = task.state.lock();
                state.phase = TaskPhase::Ready(addr);
            }
            task.ready.notify_all();
            debug!(target: "specjit::dispatch", symbol = %task.symbol, addr = %addr, "ready");
        }
        Err(err) => {
            warn!(target: "specjit::dispatch", symbol = %task.symbol, error = %err, "materialization failed");
            fail_task(task, EngineError::Compile(err));
        }
    }
}

fn fail_task(task: &Arc<SymbolTask>, err: EngineError) {
    let callbacks = {
        let mut state = task.state.lock();
        state.phase = TaskPhase::Failed(err.clone());
        std::mem::take(&mut state.callbacks)
    };
    for callback in callbacks {
        callback(Err(err.clone()));
    }
    task.ready.notify_all();
}

/// Fixed pool of named worker threads fed from a bounded channel
struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl WorkerPool {
    fn new(num_threads: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(queue_depth);

        let workers: Vec<_> = (0..num_threads)
            .map(|id| {
                let rx = receiver.clone();
                thread::Builder::new()
                    .name(format!("specjit-worker-{}", id))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn materialization worker thread")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            num_threads,
        }
    }

    /// Blocking submit. False only once the pool has shut down.
    fn spawn(&self, job: Job) -> bool {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Non-blocking submit. False when the queue is full or the pool has
    /// shut down.
    fn try_spawn(&self, job: Job) -> bool {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.try_send(job).is_ok(),
            None => false,
        }
    }

    /// Close the channel, let workers drain what is queued, join them.
    fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

/// Worker thread main loop: drains jobs until the channel closes
fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::code::CompiledCode;
    use crate::engine::error::CompileError;
    use crate::engine::pipeline::OpcodeBackend;
    use crate::engine::stubs::StubManager;
    use crate::engine::symbol::intern;
    use crate::unit::Op;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingPipeline {
        inner: OpcodeBackend,
        compiles: AtomicUsize,
        delay: Duration,
    }

    impl CountingPipeline {
        fn new(delay: Duration) -> Self {
            Self {
                inner: OpcodeBackend::new(),
                compiles: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl CompilePipeline for CountingPipeline {
        fn compile(&self, function: &FunctionDef) -> Result<CompiledCode, CompileError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.compile(function)
        }
    }

    struct FailingPipeline;

    impl CompilePipeline for FailingPipeline {
        fn compile(&self, function: &FunctionDef) -> Result<CompiledCode, CompileError> {
            Err(CompileError::Backend {
                function: function.name,
                message: "injected".into(),
            })
        }
    }

    struct Fixture {
        code: Arc<CodeMap>,
        stubs: StubManager,
        namespace: Arc<Namespace>,
    }

    impl Fixture {
        fn new() -> Self {
            let code = Arc::new(CodeMap::new());
            Self {
                stubs: StubManager::new(code.clone()),
                namespace: Arc::new(Namespace::new("unit.impl")),
                code,
            }
        }

        fn work(&self, face: &str) -> PendingWork {
            PendingWork {
                face: intern(face),
                function: FunctionDef::new(face, 0, vec![Op::PushConst(7), Op::Ret]),
                namespace: self.namespace.clone(),
                stub: self.stubs.create_stub(intern(face)).unwrap(),
            }
        }
    }

    #[test]
    fn test_await_ready_materializes() {
        let fx = Fixture::new();
        let dispatcher = Dispatcher::new(
            Arc::new(OpcodeBackend::new()),
            fx.code.clone(),
            2,
            8,
        );
        let body = intern("f$body");
        dispatcher.add_task(body, fx.work("f")).unwrap();

        let addr = dispatcher.await_ready(body).unwrap();
        assert!(!addr.is_null());
        // namespace got the definition and the stub was rewritten
        assert_eq!(fx.namespace.resolve_local(body), Some(addr));
        assert_eq!(fx.stubs.get(intern("f")).unwrap().target(), Some(addr));
    }

    #[test]
    fn test_duplicate_task_fails() {
        let fx = Fixture::new();
        let dispatcher =
            Dispatcher::new(Arc::new(OpcodeBackend::new()), fx.code.clone(), 1, 4);
        let body = intern("dup$body");
        dispatcher.add_task(body, fx.work("dup")).unwrap();
        let again = PendingWork {
            face: intern("dup"),
            function: FunctionDef::new("dup", 0, vec![Op::PushConst(1), Op::Ret]),
            namespace: fx.namespace.clone(),
            stub: fx.stubs.get(intern("dup")).unwrap(),
        };
        assert!(matches!(
            dispatcher.add_task(body, again),
            Err(EngineError::Invariant(InvariantViolation::DuplicateTask(_)))
        ));
    }

    #[test]
    fn test_concurrent_waiters_fold_into_one_compile() {
        let fx = Fixture::new();
        let pipeline = Arc::new(CountingPipeline::new(Duration::from_millis(30)));
        let dispatcher = Arc::new(Dispatcher::new(
            pipeline.clone(),
            fx.code.clone(),
            4,
            16,
        ));
        let body = intern("hot$body");
        dispatcher.add_task(body, fx.work("hot")).unwrap();

        let addrs: Vec<_> = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let dispatcher = dispatcher.clone();
                    scope.spawn(move || dispatcher.await_ready(body).unwrap())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(pipeline.compiles.load(Ordering::SeqCst), 1);
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_failure_reaches_every_waiter() {
        let fx = Fixture::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(FailingPipeline),
            fx.code.clone(),
            2,
            8,
        ));
        let body = intern("bad$body");
        dispatcher.add_task(body, fx.work("bad")).unwrap();

        let first = dispatcher.await_ready(body).unwrap_err();
        let second = dispatcher.await_ready(body).unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(first, EngineError::Compile(_)));
        // failed materialization must not rewrite the stub
        assert!(!fx.stubs.get(intern("bad")).unwrap().is_resolved());
    }

    #[test]
    fn test_when_resolved_fires_before_ready() {
        let fx = Fixture::new();
        let dispatcher = Dispatcher::new(
            Arc::new(OpcodeBackend::new()),
            fx.code.clone(),
            2,
            8,
        );
        let body = intern("cb$body");
        dispatcher.add_task(body, fx.work("cb")).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        dispatcher
            .when_resolved(
                body,
                Box::new(move |res| {
                    assert!(res.is_ok());
                    flag.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();

        dispatcher.await_ready(body).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_when_resolved_on_terminal_task_fires_immediately() {
        let fx = Fixture::new();
        let dispatcher = Dispatcher::new(
            Arc::new(OpcodeBackend::new()),
            fx.code.clone(),
            2,
            8,
        );
        let body = intern("late$body");
        dispatcher.add_task(body, fx.work("late")).unwrap();
        let addr = dispatcher.await_ready(body).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        dispatcher
            .when_resolved(
                body,
                Box::new(move |res| {
                    assert_eq!(res.unwrap(), addr);
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let fx = Fixture::new();
        let pipeline = Arc::new(CountingPipeline::new(Duration::from_millis(20)));
        let dispatcher = Dispatcher::new(pipeline.clone(), fx.code.clone(), 1, 8);
        let body = intern("drain$body");
        dispatcher.add_task(body, fx.work("drain")).unwrap();
        dispatcher.ensure(body, Demand::Speculative).unwrap();

        dispatcher.shutdown();
        assert_eq!(pipeline.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.task(body).unwrap().state_name(), "ready");
    }

    #[test]
    fn test_unknown_task() {
        let fx = Fixture::new();
        let dispatcher =
            Dispatcher::new(Arc::new(OpcodeBackend::new()), fx.code.clone(), 1, 4);
        assert!(matches!(
            dispatcher.await_ready(intern("nobody$body")),
            Err(EngineError::Invariant(InvariantViolation::UnknownTask(_)))
        ));
    }
}
