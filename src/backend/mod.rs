//! Native code backend
//!
//! Everything that depends on the machine: C layout rules, the call shims
//! that build argument frames by hand, and generated callback trampolines.
//!
//! Architecture:
//! - `layout.rs` - Memory layout calculation for structs/unions/arrays
//! - `invoke.rs` - Call planning: packing arguments, decoding results
//! - `call.rs` - Per-architecture inline assembly call shims
//! - `thunk.rs` - Executable trampoline templates and the code slot pool

pub mod call;
pub mod invoke;
pub mod layout;
pub mod thunk;

pub use call::RawReturn;
pub use invoke::{CallPlan, PackedCall, ReturnKind};
pub use layout::{StructLayout, TypeLayout, compound_layout, size_of, type_layout};
pub use thunk::{CodePool, THUNK_SLOT_SIZE};

/// Whether native calls and callbacks are available on this target.
pub fn is_supported_target() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "x86"))
}
