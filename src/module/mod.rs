//! ES module resolution and loading
//!
//! - `resolver.rs` - Specifier normalisation and canonical table keys
//! - `loader.rs` - Module table, swc-based import extraction, graph ordering
//! - `diagnostics.rs` - Module errors with dependency chains and suggestions
//!
//! Parse and evaluate steps are driven as scheduler tasks by the engine.

pub mod diagnostics;
pub mod loader;
pub mod resolver;

pub use diagnostics::{DependencyInfo, ModuleError, ModuleErrorKind, ModuleResult, SourceLocation};
pub use loader::{GraphStatus, ModuleRecord, ModuleState, ModuleTable, ParsedSource, parse_module};
pub use resolver::{ModuleResolver, ResolvedModule};
