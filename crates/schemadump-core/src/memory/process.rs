use std::ffi::c_void;
use std::mem;

use tracing::{debug, warn};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32, Module32First, Module32Next, PROCESSENTRY32,
    Process32First, Process32Next, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{OpenProcess, PROCESS_ALL_ACCESS};

use crate::error::{Error, Result};
use crate::memory::handle::OwnedHandle;
use crate::memory::reader::ReadMemory;
use crate::pe::{self, ForwardTarget, ResolvedExport};

/// How many forward hops `module_export` will follow before giving up.
const FORWARD_HOP_LIMIT: usize = 8;

/// A module loaded in the target process, as produced by a ToolHelp snapshot.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u32,
}

/// An attached target process: its PID, an owned full-access handle, and the
/// base/size of its main module.
///
/// The handle is released when the value is dropped; all read/write and
/// snapshot operations require the value to stay alive.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub process_name: String,
    pub base_address: u64,
    pub module_size: u32,
    handle: OwnedHandle,
}

impl ProcessHandle {
    /// Attach to the first running process whose image name matches `name`
    /// byte-for-byte.
    pub fn attach(name: &str) -> Result<Self> {
        let pid =
            find_pid_by_name(name).ok_or_else(|| Error::ProcessNotFound(name.to_string()))?;
        Self::open(pid)
    }

    /// Open `pid` with full access and record its main module.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }.map_err(|e| {
            Error::ProcessOpenFailed {
                pid,
                message: e.message(),
            }
        })?;
        let handle = OwnedHandle::new(handle);
        if !handle.is_valid() {
            return Err(Error::ProcessOpenFailed {
                pid,
                message: "OpenProcess returned an invalid handle".to_string(),
            });
        }

        // The first snapshot entry is the main executable image.
        let main_module = first_module(pid);
        if main_module.is_none() {
            warn!("could not snapshot modules of pid {pid}; base address unknown");
        }
        let main_module = main_module.unwrap_or(ModuleInfo {
            name: String::new(),
            base: 0,
            size: 0,
        });

        Ok(Self {
            pid,
            process_name: main_module.name,
            base_address: main_module.base,
            module_size: main_module.size,
            handle,
        })
    }

    /// Copy `buffer.len()` bytes out of the target at `address`. Success iff
    /// the OS call succeeds in full.
    pub fn read_memory(&self, address: u64, buffer: &mut [u8]) -> bool {
        unsafe {
            ReadProcessMemory(
                self.handle.raw(),
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len(),
                None,
            )
        }
        .is_ok()
    }

    /// Copy `buffer` into the target at `address`.
    pub fn write_memory(&self, address: u64, buffer: &[u8]) -> bool {
        unsafe {
            WriteProcessMemory(
                self.handle.raw(),
                address as *const c_void,
                buffer.as_ptr() as *const c_void,
                buffer.len(),
                None,
            )
        }
        .is_ok()
    }

    /// Base address of the module named `name` (ASCII case-insensitive).
    pub fn module_base(&self, name: &str) -> Option<u64> {
        self.module_info(name).map(|module| module.base)
    }

    /// Snapshot lookup of a single module by name (ASCII case-insensitive).
    pub fn module_info(&self, name: &str) -> Option<ModuleInfo> {
        modules_of(self.pid)?
            .into_iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
    }

    /// Names of every loaded module, in snapshot order. `None` only if the
    /// snapshot itself fails.
    pub fn loaded_modules(&self) -> Option<Vec<String>> {
        Some(
            modules_of(self.pid)?
                .into_iter()
                .map(|module| module.name)
                .collect(),
        )
    }

    /// Resolve an exported symbol of a loaded module, following forwarded
    /// exports through the module list. Any failure along the chain
    /// degrades to `None`.
    pub fn module_export(&self, module_name: &str, symbol: &str) -> Option<u64> {
        let reader = MemoryReader::new(self);
        let mut base = self.module_base(module_name)?;
        let mut symbol = symbol.to_string();

        for _ in 0..FORWARD_HOP_LIMIT {
            let resolved = match pe::resolve_export(&reader, base, &symbol).ok()?? {
                ResolvedExport::Address(address) => return Some(address),
                ResolvedExport::Forwarded { module, target } => (module, target),
            };

            base = self.module_base(&resolved.0)?;
            match resolved.1 {
                ForwardTarget::Name(name) => symbol = name,
                ForwardTarget::Ordinal(ordinal) => {
                    return match pe::resolve_export_by_ordinal(&reader, base, ordinal).ok()?? {
                        ResolvedExport::Address(address) => Some(address),
                        // A forward to another forward by ordinal is not
                        // followed further.
                        ResolvedExport::Forwarded { .. } => None,
                    };
                }
            }
        }

        debug!("export {symbol} exceeded the forward hop limit");
        None
    }
}

/// Reader over an attached process, for use behind the [`ReadMemory`] seam.
#[derive(Debug, Clone, Copy)]
pub struct MemoryReader<'a> {
    process: &'a ProcessHandle,
}

impl<'a> MemoryReader<'a> {
    pub fn new(process: &'a ProcessHandle) -> Self {
        Self { process }
    }
}

impl ReadMemory for MemoryReader<'_> {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        if self.process.read_memory(address, &mut buffer) {
            Ok(buffer)
        } else {
            Err(Error::MemoryReadFailed { address, size })
        }
    }

    fn base_address(&self) -> u64 {
        self.process.base_address
    }
}

/// PID of the first running process whose image name equals `name`
/// byte-for-byte. Snapshot failure collapses to `None`.
pub fn find_pid_by_name(name: &str) -> Option<u32> {
    let snapshot = match unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) } {
        Ok(handle) => OwnedHandle::new(handle),
        Err(e) => {
            debug!("process snapshot failed: {e}");
            return None;
        }
    };

    let mut entry = PROCESSENTRY32 {
        dwSize: mem::size_of::<PROCESSENTRY32>() as u32,
        ..Default::default()
    };

    // Process32First produces the first entry itself; testing it here keeps
    // that entry in the walk.
    if unsafe { Process32First(snapshot.raw(), &mut entry) }.is_err() {
        return None;
    }
    loop {
        if ansi_bytes(&entry.szExeFile) == name.as_bytes() {
            return Some(entry.th32ProcessID);
        }
        if unsafe { Process32Next(snapshot.raw(), &mut entry) }.is_err() {
            break;
        }
    }

    None
}

fn modules_of(pid: u32) -> Option<Vec<ModuleInfo>> {
    let snapshot =
        match unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) } {
            Ok(handle) => OwnedHandle::new(handle),
            Err(e) => {
                debug!("module snapshot of pid {pid} failed: {e}");
                return None;
            }
        };

    let mut entry = MODULEENTRY32 {
        dwSize: mem::size_of::<MODULEENTRY32>() as u32,
        ..Default::default()
    };

    if unsafe { Module32First(snapshot.raw(), &mut entry) }.is_err() {
        return None;
    }

    let mut modules = Vec::new();
    loop {
        modules.push(ModuleInfo {
            name: String::from_utf8_lossy(&ansi_bytes(&entry.szModule)).into_owned(),
            base: entry.modBaseAddr as u64,
            size: entry.modBaseSize,
        });
        if unsafe { Module32Next(snapshot.raw(), &mut entry) }.is_err() {
            break;
        }
    }

    Some(modules)
}

fn first_module(pid: u32) -> Option<ModuleInfo> {
    modules_of(pid)?.into_iter().next()
}

/// The NUL-terminated prefix of a fixed-size ANSI name field.
fn ansi_bytes(raw: &[i8]) -> Vec<u8> {
    raw.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect()
}
