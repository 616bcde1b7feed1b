//! Host hook wiring and the event loop.
//!
//! [`Engine`] connects the interop layer, the task queue and the module
//! table to a [`ScriptHost`], the embedding scripting runtime. Each hook the
//! runtime raises becomes a task:
//! - promise continuation -> `Promise` task
//! - module fetch -> resolve, record, `ModuleParse` task
//! - module ready -> `ModuleEvaluate` task once the whole graph is parsed
//! - wrapper finalization -> debounced `LifecycleScan` task

use std::cell::{Cell, Ref, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::error::{InteropError, InteropResult};
use crate::module::{GraphStatus, ModuleError, ModuleRecord, ModuleResolver, ModuleResult, ModuleState, ModuleTable};
use crate::runtime::{
    Interop, InteropConfig, ModuleId, Scheduler, SchedulerConfig, ScriptFunction, ScriptValue,
    SweepReport, TaskId, TaskKind,
};

/// The embedding scripting runtime, seen from the engine.
pub trait ScriptHost {
    /// Run a parsed module body. Dependencies have already been evaluated.
    fn evaluate_module(&self, module: &ModuleRecord) -> InteropResult<()>;

    /// A module failed to resolve, parse or evaluate.
    fn module_error(&self, module: Option<&ModuleRecord>, error: &ModuleError) {
        let name = module.map(|m| m.path.display().to_string());
        log::warn!("module error in {}: {}", name.as_deref().unwrap_or("<entry>"), error);
    }

    /// A task raised an exception nobody else can receive.
    fn report_error(&self, error: &InteropError) {
        log::error!("uncaught: {}", error);
    }

    /// Periodic idle processing.
    fn idle(&self) -> InteropResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub interop: InteropConfig,
    pub scheduler: SchedulerConfig,
    /// Extensions tried for extension-less specifiers; `None` keeps the
    /// resolver defaults.
    pub module_extensions: Option<Vec<String>>,
}

struct EngineInner<H> {
    host: H,
    interop: Interop,
    scheduler: Scheduler,
    modules: RefCell<ModuleTable>,
    /// Modules waiting for their import graph to finish parsing.
    pending_roots: RefCell<Vec<ModuleId>>,
    scan_task: Cell<Option<TaskId>>,
    idle_task: Cell<Option<TaskId>>,
}

/// Handle to an engine. Clones share state.
pub struct Engine<H: ScriptHost + 'static> {
    inner: Rc<EngineInner<H>>,
}

impl<H: ScriptHost + 'static> Clone for Engine<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: ScriptHost + 'static> Engine<H> {
    pub fn new(host: H, config: EngineConfig) -> Self {
        let mut resolver = ModuleResolver::new();
        if let Some(exts) = config.module_extensions {
            resolver = resolver.with_extensions(exts);
        }
        Self {
            inner: Rc::new(EngineInner {
                host,
                interop: Interop::new(config.interop),
                scheduler: Scheduler::new(config.scheduler),
                modules: RefCell::new(ModuleTable::new(resolver)),
                pending_roots: RefCell::new(Vec::new()),
                scan_task: Cell::new(None),
                idle_task: Cell::new(None),
            }),
        }
    }

    pub fn host(&self) -> &H {
        &self.inner.host
    }

    pub fn interop(&self) -> &Interop {
        &self.inner.interop
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn modules(&self) -> Ref<'_, ModuleTable> {
        self.inner.modules.borrow()
    }

    fn weak(&self) -> Weak<EngineInner<H>> {
        Rc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<EngineInner<H>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ========================================================================
    // Script-facing scheduling
    // ========================================================================

    /// Promise continuation hook.
    pub fn enqueue_promise_job(&self, func: ScriptFunction, args: Vec<ScriptValue>) -> TaskId {
        self.inner
            .scheduler
            .enqueue_promise_job(move |_| func.call(&args).map(drop))
    }

    pub fn set_timeout(&self, func: ScriptFunction, delay_ms: f64, args: Vec<ScriptValue>) -> TaskId {
        self.inner
            .scheduler
            .set_timeout(delay_ms, move |_| func.call(&args).map(drop))
    }

    pub fn set_interval(&self, func: ScriptFunction, period_ms: f64, args: Vec<ScriptValue>) -> TaskId {
        self.inner
            .scheduler
            .set_interval(period_ms, move |_| func.call(&args).map(drop))
    }

    /// `clearTimeout` / `clearInterval`.
    pub fn clear_task(&self, id: TaskId) -> bool {
        self.inner.scheduler.cancel(id)
    }

    /// Start the periodic idle tick.
    pub fn start_idle(&self) -> TaskId {
        if let Some(id) = self.inner.idle_task.get() {
            if self.inner.scheduler.is_pending(id) {
                return id;
            }
        }
        let period = self.inner.scheduler.config().idle_interval;
        let weak = self.weak();
        let id = self.inner.scheduler.schedule(TaskKind::Idle { period }, period, move |_| {
            match Self::upgrade(&weak) {
                Some(engine) => engine.inner.host.idle(),
                None => Ok(()),
            }
        });
        self.inner.idle_task.set(Some(id));
        id
    }

    pub fn stop_idle(&self) {
        if let Some(id) = self.inner.idle_task.take() {
            self.inner.scheduler.cancel(id);
        }
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Load and, once its graph is parsed, evaluate the entry module.
    pub fn load_entry(&self, specifier: &str) -> ModuleResult<ModuleId> {
        self.load(specifier, None)
    }

    /// Dynamic import: like `load_entry`, relative to `importer`.
    pub fn load(&self, specifier: &str, importer: Option<ModuleId>) -> ModuleResult<ModuleId> {
        let id = self.import_module(specifier, importer)?;
        self.inner.pending_roots.borrow_mut().push(id);
        self.check_roots();
        Ok(id)
    }

    /// Module fetch hook: resolve and record `specifier`, queueing one parse
    /// task the first time its canonical path is seen.
    pub fn import_module(&self, specifier: &str, importer: Option<ModuleId>) -> ModuleResult<ModuleId> {
        let (id, is_new) = self.inner.modules.borrow_mut().fetch(specifier, importer)?;
        if is_new {
            let weak = self.weak();
            self.inner
                .scheduler
                .schedule(TaskKind::ModuleParse(id), Duration::ZERO, move |_| {
                    if let Some(engine) = Self::upgrade(&weak) {
                        engine.parse_step(id);
                    }
                    Ok(())
                });
        }
        Ok(id)
    }

    fn parse_step(&self, id: ModuleId) {
        let parsed = self.inner.modules.borrow_mut().parse(id);
        match parsed {
            Ok(specifiers) => {
                let mut imports = Vec::with_capacity(specifiers.len());
                for specifier in &specifiers {
                    match self.import_module(specifier, Some(id)) {
                        Ok(dep) => imports.push(dep),
                        Err(err) => {
                            self.inner.modules.borrow_mut().fail(id, err.clone());
                            self.report_module_error(id, &err);
                        }
                    }
                }
                self.inner.modules.borrow_mut().set_imports(id, imports);
            }
            Err(err) => self.report_module_error(id, &err),
        }
        self.check_roots();
    }

    /// Module ready hook: queue evaluation for every root whose graph is
    /// completely parsed.
    fn check_roots(&self) {
        let mut ready = Vec::new();
        {
            let modules = self.inner.modules.borrow();
            self.inner.pending_roots.borrow_mut().retain(|&root| {
                match modules.graph_status(root) {
                    GraphStatus::Pending => true,
                    GraphStatus::Ready => {
                        ready.push(root);
                        false
                    }
                    GraphStatus::Failed => {
                        log::debug!("module graph of {} failed; not evaluating", root);
                        false
                    }
                }
            });
        }
        for root in ready {
            let weak = self.weak();
            self.inner
                .scheduler
                .schedule(TaskKind::ModuleEvaluate(root), Duration::ZERO, move |_| {
                    if let Some(engine) = Self::upgrade(&weak) {
                        engine.evaluate_step(root);
                    }
                    Ok(())
                });
        }
    }

    fn evaluate_step(&self, root: ModuleId) {
        let order = self.inner.modules.borrow().evaluation_order(root);
        for id in order {
            let record = {
                let mut modules = self.inner.modules.borrow_mut();
                match modules.get(id) {
                    Some(r) if r.state == ModuleState::Parsed => {}
                    Some(r) if r.state == ModuleState::Failed => return,
                    _ => continue,
                }
                modules.set_state(id, ModuleState::Evaluating);
                match modules.get(id) {
                    Some(r) => r.clone(),
                    None => continue,
                }
            };

            log::debug!("evaluating module {} ({})", id, record.path.display());
            match self.inner.host.evaluate_module(&record) {
                Ok(()) => self.inner.modules.borrow_mut().set_state(id, ModuleState::Evaluated),
                Err(err) => {
                    let err = {
                        let mut modules = self.inner.modules.borrow_mut();
                        let err = ModuleError::evaluation_error(record.path.clone(), err.to_string())
                            .with_dependency_chain(modules.dependency_chain(Some(id)));
                        modules.fail(id, err.clone());
                        err
                    };
                    self.report_module_error(id, &err);
                    return;
                }
            }
        }
    }

    fn report_module_error(&self, id: ModuleId, err: &ModuleError) {
        let record = self.inner.modules.borrow().get(id).cloned();
        self.inner.host.module_error(record.as_ref(), err);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Object finalization hook: coalesce orphan events into one scan after
    /// the configured delay.
    pub fn schedule_lifecycle_scan(&self) -> Option<TaskId> {
        if !self.inner.interop.take_scan_request() {
            return None;
        }
        if let Some(id) = self.inner.scan_task.get() {
            if self.inner.scheduler.is_pending(id) {
                return Some(id);
            }
        }
        let weak = self.weak();
        let delay = self.inner.interop.config().scan_delay;
        let id = self
            .inner
            .scheduler
            .schedule(TaskKind::LifecycleScan, delay, move |_| {
                if let Some(engine) = Self::upgrade(&weak) {
                    engine.inner.scan_task.set(None);
                    engine.inner.interop.collect_garbage();
                }
                Ok(())
            });
        self.inner.scan_task.set(Some(id));
        Some(id)
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// One sweep of the run-queue. Task errors go to the host.
    pub fn run_ready(&self, now: Instant) -> SweepReport {
        self.schedule_lifecycle_scan();
        let report = self.inner.scheduler.run_ready(now);
        for (_, _, err) in &report.errors {
            self.inner.host.report_error(err);
        }
        self.schedule_lifecycle_scan();
        report
    }

    /// Run until nothing but idle ticks remains.
    pub fn run_event_loop(&self) {
        loop {
            self.run_ready(Instant::now());
            if !self.inner.scheduler.has_work() {
                break;
            }
            if let Some(next) = self.inner.scheduler.next_ready_time() {
                let now = Instant::now();
                if next > now {
                    let max = self.inner.scheduler.config().max_sleep;
                    std::thread::sleep((next - now).min(max));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHost {
        evaluated: RefCell<Vec<String>>,
        errors: RefCell<Vec<String>>,
        idle_ticks: Cell<usize>,
    }

    impl ScriptHost for RecordingHost {
        fn evaluate_module(&self, module: &ModuleRecord) -> InteropResult<()> {
            let name = module
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if module.source.as_deref().is_some_and(|s| s.contains("throw")) {
                return Err(InteropError::thrown("module threw"));
            }
            self.evaluated.borrow_mut().push(name);
            Ok(())
        }

        fn module_error(&self, _module: Option<&ModuleRecord>, error: &ModuleError) {
            self.errors.borrow_mut().push(error.to_string());
        }

        fn report_error(&self, error: &InteropError) {
            self.errors.borrow_mut().push(error.to_string());
        }

        fn idle(&self) -> InteropResult<()> {
            self.idle_ticks.set(self.idle_ticks.get() + 1);
            Ok(())
        }
    }

    fn later(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[test]
    fn test_promise_jobs_report_errors() {
        let engine = Engine::new(RecordingHost::default(), EngineConfig::default());
        let f = ScriptFunction::new("fail", |_| Err(InteropError::thrown("nope")));
        engine.enqueue_promise_job(f, vec![]);
        engine.run_ready(later(1));
        assert_eq!(engine.host().errors.borrow().len(), 1);
    }

    #[test]
    fn test_timers_pass_arguments() {
        let engine = Engine::new(RecordingHost::default(), EngineConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let f = ScriptFunction::new("tick", move |args| {
            s.borrow_mut().push(args.to_vec());
            Ok(ScriptValue::Undefined)
        });
        engine.set_timeout(f.clone(), 5.0, vec![ScriptValue::Number(1.0)]);
        let cancelled = engine.set_timeout(f, 5.0, vec![ScriptValue::Number(2.0)]);
        assert!(engine.clear_task(cancelled));
        engine.run_ready(later(1));
        assert_eq!(*seen.borrow(), vec![vec![ScriptValue::Number(1.0)]]);
    }

    #[test]
    fn test_idle_ticks_do_not_keep_the_loop_alive() {
        let engine = Engine::new(RecordingHost::default(), EngineConfig::default());
        let id = engine.start_idle();
        assert_eq!(engine.start_idle(), id);
        engine.run_ready(later(1));
        engine.run_ready(later(2));
        assert_eq!(engine.host().idle_ticks.get(), 2);
        engine.run_event_loop();
        engine.stop_idle();
        assert!(!engine.scheduler().is_pending(id));
    }

    #[test]
    fn test_orphans_schedule_one_scan() {
        let engine = Engine::new(RecordingHost::default(), EngineConfig::default());
        let a = engine.interop().create("i").unwrap();
        let b = engine.interop().create("i").unwrap();
        drop(a);
        let first = engine.schedule_lifecycle_scan();
        assert!(first.is_some());
        drop(b);
        assert_eq!(engine.schedule_lifecycle_scan(), first);
        assert_eq!(engine.interop().heap_stats().live_buffers, 2);

        let report = engine.run_ready(later(1));
        assert_eq!(report.executed, 1);
        assert_eq!(engine.interop().heap_stats().live_buffers, 0);
    }
}
