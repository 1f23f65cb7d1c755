//! Signature scanning against a module's mapped image.

mod pattern;

pub use pattern::Pattern;

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::memory::{Address, ReadMemory};
use crate::pe;

/// The driver signatures all target 7-byte `MOV r64, [rip+disp32]` /
/// `LEA r64, [rip+disp32]` encodings, whose displacement starts at byte 3.
/// Call sites needing other encodings must post-adjust.
const RIP_DISP_OFFSET: u64 = 3;
const RIP_INSTRUCTION_LEN: u64 = 7;

/// Scan the image mapped at `module_base` for the first occurrence of
/// `pattern`.
///
/// The DOS and NT headers are validated and the scan covers the whole mapped
/// image (`SizeOfImage`), copied out of the target in one read. A clean miss
/// is `Ok(None)`; a malformed image or failed read is an error.
pub fn find_pattern<R: ReadMemory + ?Sized>(
    reader: &R,
    module_base: u64,
    pattern: &Pattern,
) -> Result<Option<Address>> {
    let headers = pe::parse_headers(reader, module_base)?;
    let image = reader.read_bytes(module_base, headers.size_of_image as usize)?;

    Ok(pattern
        .find_in(&image)
        .map(|offset| Address::new(module_base + offset as u64)))
}

/// Follow the RIP-relative displacement of the instruction at `address`:
/// the signed disp32 at `address + 3`, relative to the end of the 7-byte
/// instruction. Any read failure degrades to `None`.
pub fn resolve_rip_relative<R: ReadMemory + ?Sized>(reader: &R, address: Address) -> Option<u64> {
    let displacement = reader.read_i32(address.value() + RIP_DISP_OFFSET).ok()?;
    Some(
        address
            .value()
            .wrapping_add_signed(displacement as i64)
            .wrapping_add(RIP_INSTRUCTION_LEN),
    )
}

/// A global variable locatable by code signature: scan for `pattern` in
/// `module`, resolve the RIP-relative slot, optionally dereference it once,
/// then apply `addend`.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalSignature {
    pub name: &'static str,
    pub module: &'static str,
    pub pattern: &'static str,
    pub deref: bool,
    pub addend: i64,
}

/// The fixed signature set the driver reports.
pub fn builtin_signatures() -> Vec<GlobalSignature> {
    vec![
        GlobalSignature {
            name: "dwEntityList",
            module: "client.dll",
            pattern: "48 8B 0D ? ? ? ? 48 89 7C 24 ? 8B FA C1 EB",
            deref: false,
            addend: 0,
        },
        GlobalSignature {
            name: "dwLocalPlayerController",
            module: "client.dll",
            pattern: "48 8B 0D ? ? ? ? F2 0F 11 44 24 ? F2 41 0F 10 00",
            deref: true,
            addend: 0x50,
        },
        GlobalSignature {
            name: "dwViewMatrix",
            module: "client.dll",
            pattern: "48 8D 0D ? ? ? ? 48 C1 E0 06",
            deref: false,
            addend: 0,
        },
    ]
}

/// Resolve one [`GlobalSignature`] to an absolute address in the target.
/// Every miss past pattern compilation degrades to `Ok(None)`.
pub fn resolve_global<R: ReadMemory + ?Sized>(
    reader: &R,
    module_base: u64,
    signature: &GlobalSignature,
) -> Result<Option<u64>> {
    let pattern = Pattern::parse(signature.pattern)?;

    let Some(site) = find_pattern(reader, module_base, &pattern)? else {
        debug!("{}: pattern not found", signature.name);
        return Ok(None);
    };
    let Some(mut target) = resolve_rip_relative(reader, site) else {
        return Ok(None);
    };

    if signature.deref {
        target = match reader.read_u64(target) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };
    }
    if signature.addend != 0 {
        target = target.wrapping_add_signed(signature.addend);
    }

    Ok(Some(target))
}
