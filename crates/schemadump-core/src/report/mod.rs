//! Output file emission: one header-style and one JSON file per type scope,
//! plus the machine-readable globals report. Files are overwritten on every
//! run.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::schema::ClassField;

/// Everything dumped for one type scope.
#[derive(Debug, Clone)]
pub struct ScopeReport {
    pub module_name: String,
    pub classes: Vec<ClassReport>,
}

#[derive(Debug, Clone)]
pub struct ClassReport {
    pub name: String,
    pub fields: Vec<ClassField>,
}

/// Module-relative addresses of the signature-scanned globals.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalOffsets<'a> {
    pub module: &'a str,
    pub offsets: BTreeMap<&'a str, String>,
}

pub fn ensure_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Write `<scope>.hpp`: one namespace per class, one `constexpr
/// std::ptrdiff_t` per field.
pub fn write_header_file(dir: &Path, scope: &ScopeReport) -> Result<PathBuf> {
    let path = dir.join(format!("{}.hpp", scope.module_name));

    let mut output = String::new();
    output.push_str("#pragma once\n\n#include <cstddef>\n\n");
    let _ = writeln!(output, "// Generated using schemadump");
    let _ = writeln!(output, "// {} UTC\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"));

    for class in &scope.classes {
        let _ = writeln!(output, "namespace {} {{", class.name);
        for field in &class.fields {
            let _ = writeln!(
                output,
                "    constexpr std::ptrdiff_t {} = {:#x};",
                field.name, field.offset
            );
        }
        output.push_str("}\n\n");
    }

    fs::write(&path, output)?;
    debug!("wrote {}", path.display());
    Ok(path)
}

/// Write `<scope>.json`: `{ class: { field: offset } }`, keys sorted.
pub fn write_json_file(dir: &Path, scope: &ScopeReport) -> Result<PathBuf> {
    let path = dir.join(format!("{}.json", scope.module_name));

    let mut classes: BTreeMap<&str, BTreeMap<&str, u32>> = BTreeMap::new();
    for class in &scope.classes {
        let fields = classes.entry(&class.name).or_default();
        for field in &class.fields {
            fields.insert(&field.name, field.offset);
        }
    }

    fs::write(&path, serde_json::to_string_pretty(&classes)?)?;
    debug!("wrote {}", path.display());
    Ok(path)
}

/// Write `offsets.json` with the globals rendered as module-relative hex.
pub fn write_offsets_file(
    dir: &Path,
    module: &str,
    offsets: &BTreeMap<&str, u64>,
) -> Result<PathBuf> {
    let path = dir.join("offsets.json");

    let report = GlobalOffsets {
        module,
        offsets: offsets
            .iter()
            .map(|(name, value)| (*name, format!("{value:#x}")))
            .collect(),
    };

    fs::write(&path, serde_json::to_string_pretty(&report)?)?;
    debug!("wrote {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_scope() -> ScopeReport {
        ScopeReport {
            module_name: "client.dll".to_string(),
            classes: vec![
                ClassReport {
                    name: "C_BaseEntity".to_string(),
                    fields: vec![
                        ClassField {
                            name: "m_iHealth".to_string(),
                            offset: 0x32C,
                        },
                        ClassField {
                            name: "m_vecOrigin".to_string(),
                            offset: 0x88,
                        },
                    ],
                },
                ClassReport {
                    name: "CSkeletonInstance".to_string(),
                    fields: Vec::new(),
                },
            ],
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("schemadump-{}-{tag}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_header_file_format() {
        let dir = temp_dir("hpp");
        let path = write_header_file(&dir, &sample_scope()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#pragma once\n\n#include <cstddef>\n\n"));
        assert!(content.contains("namespace C_BaseEntity {\n"));
        assert!(content.contains("    constexpr std::ptrdiff_t m_iHealth = 0x32c;\n"));
        assert!(content.contains("    constexpr std::ptrdiff_t m_vecOrigin = 0x88;\n"));
        assert!(content.contains("namespace CSkeletonInstance {\n"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_json_file_format() {
        let dir = temp_dir("json");
        let path = write_json_file(&dir, &sample_scope()).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["C_BaseEntity"]["m_iHealth"], 0x32C);
        assert_eq!(parsed["C_BaseEntity"]["m_vecOrigin"], 0x88);
        assert!(parsed["CSkeletonInstance"].as_object().unwrap().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_offsets_file_renders_hex() {
        let dir = temp_dir("offsets");
        let mut offsets = BTreeMap::new();
        offsets.insert("dwEntityList", 0x17A1B28u64);
        offsets.insert("dwViewMatrix", 0u64);
        let path = write_offsets_file(&dir, "client.dll", &offsets).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["module"], "client.dll");
        assert_eq!(parsed["offsets"]["dwEntityList"], "0x17a1b28");
        assert_eq!(parsed["offsets"]["dwViewMatrix"], "0x0");
        assert_eq!(path.file_name().unwrap(), "offsets.json");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_files_overwritten_per_run() {
        let dir = temp_dir("overwrite");
        write_json_file(&dir, &sample_scope()).unwrap();

        let smaller = ScopeReport {
            module_name: "client.dll".to_string(),
            classes: vec![ClassReport {
                name: "C_World".to_string(),
                fields: Vec::new(),
            }],
        };
        let path = write_json_file(&dir, &smaller).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(parsed.get("C_BaseEntity").is_none());
        assert!(parsed.get("C_World").is_some());

        let _ = fs::remove_dir_all(&dir);
    }
}
