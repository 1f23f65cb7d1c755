pub mod error;
pub mod memory;
pub mod pe;
pub mod report;
pub mod scan;
pub mod schema;

pub use error::{Error, Result};
pub use memory::{Address, ReadMemory};
#[cfg(windows)]
pub use memory::{MemoryReader, ModuleInfo, OwnedHandle, ProcessHandle, find_pid_by_name};
pub use pe::{ForwardTarget, ResolvedExport};
pub use scan::{GlobalSignature, Pattern, builtin_signatures, find_pattern, resolve_rip_relative};
pub use schema::{ClassBinding, ClassField, SchemaSystem, TypeScope};
