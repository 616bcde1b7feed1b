use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::InteropResult;
use crate::runtime::scheduler::Scheduler;

/// Task ids are handed to script (`clearTimeout`), so they stay well inside
/// the exactly representable number range.
pub type TaskId = u64;

/// Index of a module record in the module table.
pub type ModuleId = usize;

/// The work a task runs. It gets the scheduler so it can queue follow-up
/// work without owning a handle to it.
pub type Job = Box<dyn FnMut(&Scheduler) -> InteropResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A promise continuation; always zero-delay.
    Promise,
    Timeout,
    /// Reschedules itself `period` after each run until cancelled.
    Interval { period: Duration },
    ModuleParse(ModuleId),
    ModuleEvaluate(ModuleId),
    /// Host idle processing; reschedules itself like an interval.
    Idle { period: Duration },
    LifecycleScan,
}

impl TaskKind {
    /// Period for self-rescheduling kinds.
    pub fn period(&self) -> Option<Duration> {
        match self {
            TaskKind::Interval { period } | TaskKind::Idle { period } => Some(*period),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TaskKind::Idle { .. })
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Promise => write!(f, "promise"),
            TaskKind::Timeout => write!(f, "timeout"),
            TaskKind::Interval { period } => write!(f, "interval({:?})", period),
            TaskKind::ModuleParse(id) => write!(f, "module-parse({})", id),
            TaskKind::ModuleEvaluate(id) => write!(f, "module-evaluate({})", id),
            TaskKind::Idle { .. } => write!(f, "idle"),
            TaskKind::LifecycleScan => write!(f, "lifecycle-scan"),
        }
    }
}

pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) ready_at: Instant,
    pub(crate) cancelled: bool,
    pub(crate) job: Job,
}

impl Task {
    pub fn new(id: TaskId, kind: TaskKind, ready_at: Instant, job: Job) -> Self {
        Self {
            id,
            kind,
            ready_at,
            cancelled: false,
            job,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Run-queue position of a task: soonest first, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub at: Instant,
    pub seq: u64,
    pub id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the earliest entry.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
