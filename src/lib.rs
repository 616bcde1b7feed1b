//! Native interop and scheduling engine
//!
//! Lets script code call native shared-library entry points, exchange
//! typed native data with them, hand script functions to native code as
//! callbacks, and schedule asynchronous work on a cooperative event loop.
//!
//! Layout:
//! - `types` - Signature grammar, parser and named-type registry
//! - `backend` - C layout, call shims, callback trampolines
//! - `marshal` - Script <-> native conversion and the per-call arena
//! - `runtime` - Value model, native heap, libraries, interop facade, scheduler
//! - `module` - ES module resolution and loading
//! - `engine` - Host hooks and the event loop

pub mod backend;
pub mod engine;
pub mod error;
pub mod marshal;
pub mod module;
pub mod runtime;
pub mod types;

#[cfg(test)]
mod tests;

pub use engine::{Engine, EngineConfig, ScriptHost};
pub use error::{InteropError, InteropResult};
pub use runtime::{Interop, InteropConfig, ScriptFunction, ScriptValue};
