//! Single-threaded cooperative run-queue.
//!
//! Every piece of deferred work (promise continuations, timers, module
//! parse/evaluate steps, idle ticks, lifecycle scans) is a [`Task`] in one
//! queue ordered by ready time. A sweep pops the ready tasks and runs each to
//! completion. Cancellation only sets a flag; the task is dropped the next
//! time the sweep reaches it.
//!
//! The queue lives behind `Rc<RefCell<..>>` and the borrow is released while
//! a task runs, so tasks can schedule or cancel other tasks (or themselves).

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{InteropError, InteropResult};
use crate::runtime::task::{Job, QueueEntry, Task, TaskId, TaskKind};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the host idle tick.
    pub idle_interval: Duration,
    /// Longest single sleep of the event loop.
    pub max_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(16),
            max_sleep: Duration::from_millis(100),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub executed: usize,
    pub cancelled: usize,
    pub errors: Vec<(TaskId, TaskKind, InteropError)>,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    tasks: HashMap<TaskId, Task>,
    next_id: TaskId,
    next_seq: u64,
    /// Task currently executing and whether it was cancelled meanwhile.
    running: Option<(TaskId, bool)>,
    /// Periodic tasks that already ran in this sweep and wait to be
    /// requeued, with their cancelled flag.
    deferred: HashMap<TaskId, bool>,
    executed_total: u64,
}

impl QueueState {
    fn push(&mut self, task: Task) {
        let entry = QueueEntry {
            at: task.ready_at,
            seq: self.next_seq,
            id: task.id,
        };
        self.next_seq += 1;
        self.heap.push(entry);
        self.tasks.insert(task.id, task);
    }
}

/// Handle to the run-queue. Clones share the queue.
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    state: Rc<RefCell<QueueState>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Rc::new(RefCell::new(QueueState {
                next_id: 1,
                ..QueueState::default()
            })),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue `job` to run `delay` from now.
    pub fn schedule<F>(&self, kind: TaskKind, delay: Duration, job: F) -> TaskId
    where
        F: FnMut(&Scheduler) -> InteropResult<()> + 'static,
    {
        self.schedule_at(kind, Instant::now() + delay, Box::new(job))
    }

    pub fn schedule_at(&self, kind: TaskKind, ready_at: Instant, job: Job) -> TaskId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.push(Task::new(id, kind, ready_at, job));
        log::trace!("scheduled task {} ({})", id, kind);
        id
    }

    /// Promise continuation; runs on the next sweep.
    pub fn enqueue_promise_job<F>(&self, job: F) -> TaskId
    where
        F: FnMut(&Scheduler) -> InteropResult<()> + 'static,
    {
        self.schedule(TaskKind::Promise, Duration::ZERO, job)
    }

    /// Negative delays clamp to zero.
    pub fn set_timeout<F>(&self, delay_ms: f64, job: F) -> TaskId
    where
        F: FnMut(&Scheduler) -> InteropResult<()> + 'static,
    {
        self.schedule(TaskKind::Timeout, millis(delay_ms), job)
    }

    pub fn set_interval<F>(&self, period_ms: f64, job: F) -> TaskId
    where
        F: FnMut(&Scheduler) -> InteropResult<()> + 'static,
    {
        let period = millis(period_ms);
        self.schedule(TaskKind::Interval { period }, period, job)
    }

    /// Flag `id` as cancelled. Returns false for unknown or finished tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.state.borrow_mut();
        if let Some((running, cancelled)) = state.running.as_mut() {
            if *running == id {
                *cancelled = true;
                return true;
            }
        }
        if let Some(cancelled) = state.deferred.get_mut(&id) {
            let was_live = !*cancelled;
            *cancelled = true;
            return was_live;
        }
        match state.tasks.get_mut(&id) {
            Some(task) if !task.cancelled => {
                task.cancelled = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        let state = self.state.borrow();
        if let Some(cancelled) = state.deferred.get(&id) {
            return !cancelled;
        }
        state.tasks.get(&id).is_some_and(|t| !t.cancelled)
    }

    /// Tasks still queued, cancelled ones included until swept.
    pub fn len(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when something other than idle ticks is queued.
    pub fn has_work(&self) -> bool {
        self.state
            .borrow()
            .tasks
            .values()
            .any(|t| !t.cancelled && !t.kind.is_idle())
    }

    pub fn executed_total(&self) -> u64 {
        self.state.borrow().executed_total
    }

    /// Earliest ready time among live tasks.
    pub fn next_ready_time(&self) -> Option<Instant> {
        self.state
            .borrow()
            .tasks
            .values()
            .filter(|t| !t.cancelled)
            .map(|t| t.ready_at)
            .min()
    }

    /// One sweep: run every task ready at `now`, soonest first.
    ///
    /// Self-rescheduling tasks go back on the queue after the sweep, so a
    /// zero-period interval cannot starve everything else.
    pub fn run_ready(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut requeue = Vec::new();

        loop {
            let mut task = {
                let mut state = self.state.borrow_mut();
                match state.heap.peek() {
                    Some(entry) if entry.at <= now => {}
                    _ => break,
                }
                let Some(entry) = state.heap.pop() else { break };
                let Some(task) = state.tasks.remove(&entry.id) else {
                    continue;
                };
                if task.cancelled {
                    report.cancelled += 1;
                    continue;
                }
                state.running = Some((task.id, false));
                task
            };

            log::trace!("running task {} ({})", task.id, task.kind);
            let result = (task.job)(self);
            report.executed += 1;

            let cancelled_while_running = {
                let mut state = self.state.borrow_mut();
                state.executed_total += 1;
                state.running.take().is_some_and(|(_, cancelled)| cancelled)
            };
            if let Err(err) = result {
                log::warn!("task {} ({}) failed: {}", task.id, task.kind, err);
                report.errors.push((task.id, task.kind, err));
            }

            match task.kind.period() {
                Some(period) if !cancelled_while_running => {
                    task.ready_at = now + period;
                    self.state.borrow_mut().deferred.insert(task.id, false);
                    requeue.push(task);
                }
                _ => {}
            }
        }

        if !requeue.is_empty() {
            let mut state = self.state.borrow_mut();
            for task in requeue {
                // Cancelled by a later task of the same sweep.
                if state.deferred.remove(&task.id) == Some(true) {
                    report.cancelled += 1;
                    continue;
                }
                state.push(task);
            }
        }
        report
    }

    /// Sweep and sleep until nothing but idle ticks remain. Errors from
    /// tasks go to `on_error`.
    pub fn run_event_loop(&self, mut on_error: impl FnMut(TaskId, TaskKind, InteropError)) {
        loop {
            let now = Instant::now();
            let report = self.run_ready(now);
            for (id, kind, err) in report.errors {
                on_error(id, kind, err);
            }
            if !self.has_work() {
                break;
            }
            if let Some(next) = self.next_ready_time() {
                let now = Instant::now();
                if next > now {
                    std::thread::sleep((next - now).min(self.config.max_sleep));
                }
            }
        }
    }
}

fn millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}
