mod address;
#[cfg(windows)]
mod handle;
#[cfg(windows)]
mod process;
mod reader;

#[cfg(test)]
pub mod mock;

pub use address::Address;
#[cfg(windows)]
pub use handle::OwnedHandle;
#[cfg(windows)]
pub use process::{MemoryReader, ModuleInfo, ProcessHandle, find_pid_by_name};
pub use reader::{ReadMemory, read_pod};

#[cfg(test)]
pub use mock::{MockMemory, MockMemoryBuilder};
