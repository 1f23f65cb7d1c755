//! PE introspection over a foreign address space.
//!
//! Headers are parsed out of a 0x1000-byte probe read at the module base;
//! export resolution copies the whole export directory once and remaps its
//! RVAs into the local buffer.

use std::mem;

use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const NT_SIGNATURE: u32 = 0x4550; // "PE\0\0"
const HEADER_PROBE_SIZE: usize = 0x1000;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct ImageDosHeader {
    e_magic: u16,
    e_cblp: u16,
    e_cp: u16,
    e_crlc: u16,
    e_cparhdr: u16,
    e_minalloc: u16,
    e_maxalloc: u16,
    e_ss: u16,
    e_sp: u16,
    e_csum: u16,
    e_ip: u16,
    e_cs: u16,
    e_lfarlc: u16,
    e_ovno: u16,
    e_res: [u16; 4],
    e_oemid: u16,
    e_oeminfo: u16,
    e_res2: [u16; 10],
    e_lfanew: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct ImageFileHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct ImageOptionalHeader64 {
    magic: u16,
    major_linker_version: u8,
    minor_linker_version: u8,
    size_of_code: u32,
    size_of_initialized_data: u32,
    size_of_uninitialized_data: u32,
    address_of_entry_point: u32,
    base_of_code: u32,
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    major_operating_system_version: u16,
    minor_operating_system_version: u16,
    major_image_version: u16,
    minor_image_version: u16,
    major_subsystem_version: u16,
    minor_subsystem_version: u16,
    win32_version_value: u32,
    size_of_image: u32,
    size_of_headers: u32,
    checksum: u32,
    subsystem: u16,
    dll_characteristics: u16,
    size_of_stack_reserve: u64,
    size_of_stack_commit: u64,
    size_of_heap_reserve: u64,
    size_of_heap_commit: u64,
    loader_flags: u32,
    number_of_rva_and_sizes: u32,
    data_directory: [ImageDataDirectory; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct ImageNtHeaders64 {
    signature: u32,
    file_header: ImageFileHeader,
    optional_header: ImageOptionalHeader64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct ImageExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

/// Validated header facts needed by callers: the mapped image size and the
/// export data directory.
#[derive(Debug, Clone, Copy)]
pub struct PeHeaders {
    pub size_of_image: u32,
    pub export_directory: ImageDataDirectory,
}

/// The resolution of an exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedExport {
    /// Absolute address in the target.
    Address(u64),
    /// The export forwards into another module.
    Forwarded {
        /// Forwarded-to module, normalized to a `.dll` name.
        module: String,
        target: ForwardTarget,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardTarget {
    Name(String),
    Ordinal(u16),
}

/// Read and validate the DOS and NT headers of the module mapped at `base`.
pub fn parse_headers<R: ReadMemory + ?Sized>(reader: &R, base: u64) -> Result<PeHeaders> {
    let probe = reader.read_bytes(base, HEADER_PROBE_SIZE)?;

    let dos: ImageDosHeader = struct_at(&probe, 0)
        .ok_or_else(|| Error::invalid_image(base, "image smaller than a DOS header"))?;
    if dos.e_magic != DOS_MAGIC {
        return Err(Error::invalid_image(base, "DOS signature mismatch"));
    }
    if dos.e_lfanew <= 0 {
        return Err(Error::invalid_image(base, "bad e_lfanew"));
    }

    let nt: ImageNtHeaders64 = struct_at(&probe, dos.e_lfanew as usize)
        .ok_or_else(|| Error::invalid_image(base, "NT headers outside the header probe"))?;
    if nt.signature != NT_SIGNATURE {
        return Err(Error::invalid_image(base, "NT signature mismatch"));
    }

    Ok(PeHeaders {
        size_of_image: nt.optional_header.size_of_image,
        export_directory: nt.optional_header.data_directory[0],
    })
}

/// Resolve `symbol` through the export directory of the module at `base`.
///
/// `Ok(None)` is a clean miss (no directory, or no such name); a forwarded
/// export is reported as [`ResolvedExport::Forwarded`] rather than followed,
/// so the caller can route the hop through its own module list.
pub fn resolve_export<R: ReadMemory + ?Sized>(
    reader: &R,
    base: u64,
    symbol: &str,
) -> Result<Option<ResolvedExport>> {
    let Some((directory, table, exports)) = read_export_directory(reader, base)? else {
        return Ok(None);
    };

    for i in 0..exports.number_of_names as usize {
        let Some(name_rva) = table_u32(&table, &directory, exports.address_of_names, i) else {
            continue;
        };
        let Some(name) = local_c_string(&table, &directory, name_rva) else {
            continue;
        };
        if name != symbol {
            continue;
        }

        let Some(ordinal) = table_u16(&table, &directory, exports.address_of_name_ordinals, i)
        else {
            return Ok(None);
        };
        return resolve_function_rva(base, &directory, &table, &exports, ordinal as usize);
    }

    Ok(None)
}

/// Resolve an export by its biased ordinal (as it appears in forward strings
/// and import tables).
pub fn resolve_export_by_ordinal<R: ReadMemory + ?Sized>(
    reader: &R,
    base: u64,
    ordinal: u16,
) -> Result<Option<ResolvedExport>> {
    let Some((directory, table, exports)) = read_export_directory(reader, base)? else {
        return Ok(None);
    };

    let Some(index) = (ordinal as u32).checked_sub(exports.base) else {
        return Ok(None);
    };
    if index >= exports.number_of_functions {
        return Ok(None);
    }

    resolve_function_rva(base, &directory, &table, &exports, index as usize)
}

type ExportTable = (ImageDataDirectory, Vec<u8>, ImageExportDirectory);

fn read_export_directory<R: ReadMemory + ?Sized>(
    reader: &R,
    base: u64,
) -> Result<Option<ExportTable>> {
    let headers = parse_headers(reader, base)?;
    let directory = headers.export_directory;
    if directory.virtual_address == 0 || directory.size == 0 {
        debug!("module at {base:#x} has no export directory");
        return Ok(None);
    }

    let table = reader.read_bytes(base + directory.virtual_address as u64, directory.size as usize)?;
    let exports: ImageExportDirectory = struct_at(&table, 0)
        .ok_or_else(|| Error::invalid_image(base, "truncated export directory"))?;

    Ok(Some((directory, table, exports)))
}

fn resolve_function_rva(
    base: u64,
    directory: &ImageDataDirectory,
    table: &[u8],
    exports: &ImageExportDirectory,
    index: usize,
) -> Result<Option<ResolvedExport>> {
    let Some(fn_rva) = table_u32(table, directory, exports.address_of_functions, index) else {
        return Ok(None);
    };
    if fn_rva == 0 {
        return Ok(None);
    }

    // An RVA that lands inside the export directory is a forward string, not
    // code.
    let directory_range = directory.virtual_address..directory.virtual_address + directory.size;
    if directory_range.contains(&fn_rva) {
        let forwarded = local_c_string(table, directory, fn_rva)
            .as_deref()
            .and_then(parse_forwarder);
        return Ok(forwarded.map(|(module, target)| ResolvedExport::Forwarded { module, target }));
    }

    Ok(Some(ResolvedExport::Address(base + fn_rva as u64)))
}

/// `"OtherModule.Name"` or `"OtherModule.#ordinal"`, module normalized to a
/// `.dll` file name.
fn parse_forwarder(forward: &str) -> Option<(String, ForwardTarget)> {
    let (module, export) = forward.rsplit_once('.')?;
    if module.is_empty() || export.is_empty() {
        return None;
    }

    let target = match export.strip_prefix('#') {
        Some(ordinal) => ForwardTarget::Ordinal(ordinal.parse().ok()?),
        None => ForwardTarget::Name(export.to_string()),
    };

    Some((format!("{}.dll", module.to_ascii_lowercase()), target))
}

/// Reinterpret a header struct out of a copied buffer. `None` when the
/// buffer is too short.
fn struct_at<T: Copy>(buffer: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(mem::size_of::<T>())?;
    if end > buffer.len() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(buffer[offset..].as_ptr() as *const T) })
}

/// Remap a target RVA into the copied export directory buffer.
fn local_offset(directory: &ImageDataDirectory, rva: u32) -> Option<usize> {
    rva.checked_sub(directory.virtual_address).map(|o| o as usize)
}

fn table_u32(table: &[u8], directory: &ImageDataDirectory, array_rva: u32, index: usize) -> Option<u32> {
    let offset = local_offset(directory, array_rva)?.checked_add(index * 4)?;
    struct_at(table, offset)
}

fn table_u16(table: &[u8], directory: &ImageDataDirectory, array_rva: u32, index: usize) -> Option<u16> {
    let offset = local_offset(directory, array_rva)?.checked_add(index * 2)?;
    struct_at(table, offset)
}

fn local_c_string(table: &[u8], directory: &ImageDataDirectory, rva: u32) -> Option<String> {
    let start = local_offset(directory, rva)?;
    if start >= table.len() {
        return None;
    }
    let rest = &table[start..];
    let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    Some(String::from_utf8_lossy(&rest[..len]).into_owned())
}

/// Write a minimal valid DOS + NT header pair into a mock image, for tests
/// in this crate that need a scannable module.
#[cfg(test)]
pub(crate) fn write_test_headers(
    mock: &mut crate::memory::MockMemoryBuilder,
    base: u64,
    size_of_image: u32,
    export_va: u32,
    export_size: u32,
) {
    const LFANEW: u32 = 0x80;
    mock.write_u16(base, DOS_MAGIC);
    mock.write_u32(base + 0x3C, LFANEW);

    let nt = base + LFANEW as u64;
    mock.write_u32(nt, NT_SIGNATURE);
    // The optional header begins after the 4-byte signature and the 20-byte
    // file header.
    let optional = nt + 24;
    mock.write_u16(optional, 0x20B);
    mock.write_u32(optional + 56, size_of_image);
    mock.write_u32(optional + 112, export_va);
    mock.write_u32(optional + 116, export_size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MockMemory, MockMemoryBuilder};

    const BASE: u64 = 0x0001_4000_0000;
    const EXPORT_VA: u32 = 0x1000;
    const EXPORT_SIZE: u32 = 0x200;

    /// Image exporting:
    ///   - "Alpha"  (ordinal 1) -> rva 0x2000
    ///   - "FwdSym" (ordinal 2) -> forward string inside the directory
    ///   - ordinal 3 (unnamed)  -> rva 0x2040
    fn build_export_image() -> MockMemory {
        let mut mock = MockMemoryBuilder::new(BASE, 0x3000);
        write_test_headers(&mut mock, BASE, 0x3000, EXPORT_VA, EXPORT_SIZE);

        let dir = BASE + EXPORT_VA as u64;
        mock.write_u32(dir + 16, 1); // ordinal base
        mock.write_u32(dir + 20, 3); // number of functions
        mock.write_u32(dir + 24, 2); // number of names
        mock.write_u32(dir + 28, 0x1028); // functions
        mock.write_u32(dir + 32, 0x1034); // names
        mock.write_u32(dir + 36, 0x103C); // name ordinals

        mock.write_u32(dir + 0x28, 0x2000);
        mock.write_u32(dir + 0x2C, 0x1100);
        mock.write_u32(dir + 0x30, 0x2040);

        mock.write_u32(dir + 0x34, 0x1040);
        mock.write_u32(dir + 0x38, 0x1050);

        mock.write_u16(dir + 0x3C, 0);
        mock.write_u16(dir + 0x3E, 1);

        mock.write_str(dir + 0x40, "Alpha");
        mock.write_str(dir + 0x50, "FwdSym");
        mock.write_str(dir + 0x100, "HOST.TargetSym");

        mock.build()
    }

    #[test]
    fn test_parse_headers() {
        let memory = build_export_image();
        let headers = parse_headers(&memory, BASE).unwrap();
        assert_eq!(headers.size_of_image, 0x3000);
        assert_eq!(headers.export_directory.virtual_address, EXPORT_VA);
        assert_eq!(headers.export_directory.size, EXPORT_SIZE);
    }

    #[test]
    fn test_parse_headers_rejects_bad_magic() {
        let mut mock = MockMemoryBuilder::new(BASE, 0x2000);
        write_test_headers(&mut mock, BASE, 0x2000, 0, 0);
        mock.write_u16(BASE, 0x4142);
        let memory = mock.build();

        assert!(matches!(
            parse_headers(&memory, BASE),
            Err(Error::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_parse_headers_rejects_bad_nt_signature() {
        let mut mock = MockMemoryBuilder::new(BASE, 0x2000);
        write_test_headers(&mut mock, BASE, 0x2000, 0, 0);
        mock.write_u32(BASE + 0x80, 0x1111_1111);
        let memory = mock.build();

        assert!(matches!(
            parse_headers(&memory, BASE),
            Err(Error::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_resolve_named_export() {
        let memory = build_export_image();
        let resolved = resolve_export(&memory, BASE, "Alpha").unwrap();
        assert_eq!(resolved, Some(ResolvedExport::Address(BASE + 0x2000)));
    }

    #[test]
    fn test_missing_symbol_is_a_clean_miss() {
        let memory = build_export_image();
        assert_eq!(resolve_export(&memory, BASE, "Missing").unwrap(), None);
    }

    #[test]
    fn test_forwarded_export_detected() {
        let memory = build_export_image();
        let resolved = resolve_export(&memory, BASE, "FwdSym").unwrap();
        assert_eq!(
            resolved,
            Some(ResolvedExport::Forwarded {
                module: "host.dll".to_string(),
                target: ForwardTarget::Name("TargetSym".to_string()),
            })
        );
    }

    #[test]
    fn test_resolve_by_ordinal() {
        let memory = build_export_image();
        let resolved = resolve_export_by_ordinal(&memory, BASE, 3).unwrap();
        assert_eq!(resolved, Some(ResolvedExport::Address(BASE + 0x2040)));

        // Ordinal below the bias and past the table are misses.
        assert_eq!(resolve_export_by_ordinal(&memory, BASE, 0).unwrap(), None);
        assert_eq!(resolve_export_by_ordinal(&memory, BASE, 9).unwrap(), None);
    }

    #[test]
    fn test_no_export_directory_is_a_clean_miss() {
        let mut mock = MockMemoryBuilder::new(BASE, 0x2000);
        write_test_headers(&mut mock, BASE, 0x2000, 0, 0);
        let memory = mock.build();

        assert_eq!(resolve_export(&memory, BASE, "Alpha").unwrap(), None);
    }

    #[test]
    fn test_parse_forwarder_formats() {
        assert_eq!(
            parse_forwarder("NTDLL.RtlAllocateHeap"),
            Some((
                "ntdll.dll".to_string(),
                ForwardTarget::Name("RtlAllocateHeap".to_string())
            ))
        );
        assert_eq!(
            parse_forwarder("api-ms-win-core-memory-l1-1-0.#42"),
            Some((
                "api-ms-win-core-memory-l1-1-0.dll".to_string(),
                ForwardTarget::Ordinal(42)
            ))
        );
        assert_eq!(parse_forwarder("NoDotHere"), None);
        assert_eq!(parse_forwarder(".Name"), None);
    }
}
