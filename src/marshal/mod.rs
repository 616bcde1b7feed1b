//! Marshalling between script values and native memory.
//!
//! Three traversals over the same signature grammar:
//! - [`sizer`]: argument-slot assignment for a parameter list
//! - [`to_native`]: script value -> native bytes
//! - [`from_native`]: native bytes -> script value
//!
//! plus the per-call scratch [`arena`] they allocate from.

pub mod arena;
pub mod from_native;
pub mod sizer;
pub mod to_native;

pub use arena::{ArenaGuard, ArenaStack, MarshalArena};
pub use from_native::{FromNative, read_c_string};
pub use sizer::{ArgFrame, ArgPassing, ArgSlot, SLOT_SIZE, StackArgSizer, check_passable, returns_in_memory};
pub use to_native::{CallbackFactory, NoCallbacks, TempAlloc, ToNative};
