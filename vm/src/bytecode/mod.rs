//! Bytecode program format and loader (§3.4, §6).

mod loader;
pub(crate) mod program;

pub use loader::{load, LoaderError};
pub use program::{DebugInfo, ForeignDescriptor, FunctionEntry, Program};
