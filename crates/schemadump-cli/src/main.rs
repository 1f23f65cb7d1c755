mod cli;

use anyhow::Result;
use clap::Parser;
use cli::Args;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("schemadump=info,schemadump_core=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    run(&args)
}

#[cfg(windows)]
fn run(args: &Args) -> Result<()> {
    use anyhow::Context;
    use schemadump_core::{MemoryReader, ProcessHandle, SchemaSystem, report, schema};
    use tracing::{info, warn};

    report::ensure_output_dir(&args.output)?;

    let process = match args.pid {
        Some(pid) => ProcessHandle::open(pid)?,
        None => ProcessHandle::attach(&args.process)?,
    };
    info!(
        "attached to {} (pid {}, base {:#x})",
        process.process_name, process.pid, process.base_address
    );

    let reader = MemoryReader::new(&process);

    let schema_base = process
        .module_base(schema::SCHEMA_SYSTEM_MODULE)
        .with_context(|| format!("{} is not loaded in the target", schema::SCHEMA_SYSTEM_MODULE))?;
    let schema_system = SchemaSystem::locate(&reader, schema_base)?
        .context("failed to locate the schema system")?;
    info!("schema system: {:#x}", schema_system.address());

    for scope in schema_system.type_scopes()? {
        if scope.module_name().is_empty() {
            warn!("skipping type scope with an unreadable module name");
            continue;
        }
        info!("generating files for {}...", scope.module_name());

        let scope_report = collect_scope(&scope);
        if scope_report.classes.is_empty() {
            warn!("{}: no readable classes, skipping", scope.module_name());
            continue;
        }

        report::write_header_file(&args.output, &scope_report)?;
        report::write_json_file(&args.output, &scope_report)?;
    }

    fetch_global_offsets(&process, &reader, args)?;

    info!("done!");
    Ok(())
}

#[cfg(windows)]
fn collect_scope<R: schemadump_core::ReadMemory + ?Sized>(
    scope: &schemadump_core::TypeScope<'_, R>,
) -> schemadump_core::report::ScopeReport {
    use schemadump_core::report::{ClassReport, ScopeReport};
    use tracing::info;

    let mut classes = Vec::new();
    for binding in scope.class_bindings() {
        let fields = binding.fields();
        info!("    > {} ({} fields)", binding.name(), fields.len());
        classes.push(ClassReport {
            name: binding.name().to_string(),
            fields,
        });
    }
    classes.sort_by(|a, b| a.name.cmp(&b.name));

    ScopeReport {
        module_name: scope.module_name().to_string(),
        classes,
    }
}

/// Resolve the built-in client signatures and report them module-relative.
/// Any miss degrades to a zero offset and a warning.
#[cfg(windows)]
fn fetch_global_offsets(
    process: &schemadump_core::ProcessHandle,
    reader: &schemadump_core::MemoryReader<'_>,
    args: &Args,
) -> Result<()> {
    use std::collections::BTreeMap;

    use schemadump_core::{builtin_signatures, report, scan};
    use tracing::{info, warn};

    let signatures = builtin_signatures();
    let client_module = signatures[0].module;
    let Some(client_base) = process.module_base(client_module) else {
        warn!("{client_module} is not loaded; skipping global offsets");
        return Ok(());
    };

    let mut offsets = BTreeMap::new();
    for signature in &signatures {
        let address = match scan::resolve_global(reader, client_base, signature) {
            Ok(Some(address)) => address,
            Ok(None) => {
                warn!("{}: signature not found", signature.name);
                0
            }
            Err(e) => {
                warn!("{}: {e}", signature.name);
                0
            }
        };

        let relative = if address == 0 {
            0
        } else {
            address.wrapping_sub(client_base)
        };
        info!("{}: {:#x}", signature.name, relative);
        offsets.insert(signature.name, relative);
    }

    report::write_offsets_file(&args.output, client_module, &offsets)?;
    Ok(())
}

#[cfg(not(windows))]
fn run(_args: &Args) -> Result<()> {
    anyhow::bail!("schemadump attaches through the Windows process APIs and only runs on Windows")
}
