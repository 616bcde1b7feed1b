//! Runtime kernel for native interop
//!
//! This module holds everything that lives for the duration of an engine:
//! - The script value model and native wrappers (value.rs, native.rs)
//! - Host-allocated native memory and its lifecycle scan (heap.rs)
//! - Loaded libraries (library.rs) and memory probing (probe.rs)
//! - Callback trampolines (callback.rs)
//! - The script-facing binding surface (interop.rs)
//! - The cooperative task queue (task.rs, scheduler.rs)

pub mod callback;
pub mod heap;
pub mod interop;
pub mod library;
pub mod native;
pub mod probe;
pub mod scheduler;
pub mod task;
pub mod value;

pub use heap::{HeapStats, NativeHeap, ScanReport};
pub use interop::{CodePoolStats, Interop, InteropConfig};
pub use native::{NativeFunction, NativeObject, NativePointer, Storage};
pub use scheduler::{Scheduler, SchedulerConfig, SweepReport};
pub use task::{ModuleId, TaskId, TaskKind};
pub use value::{ScriptArray, ScriptFunction, ScriptObject, ScriptValue};
