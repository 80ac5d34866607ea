//! Reading and writing CAS files by extension, plus directory conversion.

use anyhow::{anyhow, bail, Context, Result};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use casgraph_core::{
    deserialize_binary_self_describing_with, deserialize_binary_with, deserialize_xmi_with,
    serialize_binary_with, serialize_xmi, Cas, CasConfig, XmiDiagnostic,
};
use casgraph_types::TypeSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasFormat {
    Xmi,
    Binary,
}

impl CasFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("xmi") | Some("xml") => Ok(CasFormat::Xmi),
            Some("casb") => Ok(CasFormat::Binary),
            _ => bail!(
                "cannot tell the format of {} (expected .xmi, .xml or .casb)",
                path.display()
            ),
        }
    }
}

pub struct Loaded {
    pub cas: Cas,
    pub diagnostics: Vec<XmiDiagnostic>,
}

/// Read a CAS file. Binary input without `ts` must carry its own type system.
pub fn read_cas(path: &Path, ts: Option<&Arc<TypeSystem>>, config: &CasConfig) -> Result<Loaded> {
    match CasFormat::from_path(path)? {
        CasFormat::Xmi => {
            let ts = ts.ok_or_else(|| anyhow!("XMI input {} needs --types", path.display()))?;
            let xml = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let load = deserialize_xmi_with(&xml, Arc::clone(ts), config.clone())
                .with_context(|| format!("failed to load {}", path.display()))?;
            Ok(Loaded {
                cas: load.cas,
                diagnostics: load.diagnostics,
            })
        }
        CasFormat::Binary => {
            let bytes =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            let cas = match ts {
                Some(ts) => deserialize_binary_with(&bytes, Arc::clone(ts), config.clone()),
                None => deserialize_binary_self_describing_with(&bytes, config.clone()),
            }
            .with_context(|| format!("failed to load {}", path.display()))?;
            Ok(Loaded {
                cas,
                diagnostics: Vec::new(),
            })
        }
    }
}

/// Write `cas` in the format named by `path`'s extension; returns the byte count.
pub fn write_cas(cas: &Cas, path: &Path, config: &CasConfig) -> Result<usize> {
    let bytes = match CasFormat::from_path(path)? {
        CasFormat::Xmi => serialize_xmi(cas)?.into_bytes(),
        CasFormat::Binary => serialize_binary_with(cas, &config.binary)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(bytes.len())
}

pub fn convert_file(
    input: &Path,
    output: &Path,
    ts: Option<&Arc<TypeSystem>>,
    config: &CasConfig,
) -> Result<(usize, Vec<XmiDiagnostic>)> {
    let loaded = read_cas(input, ts, config)?;
    let written = write_cas(&loaded.cas, output, config)?;
    tracing::debug!(
        input = %input.display(),
        output = %output.display(),
        structures = loaded.cas.fs_count(),
        bytes = written,
        "converted"
    );
    Ok((written, loaded.diagnostics))
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub converted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub warnings: usize,
}

/// `.xmi` files under `dir`, sorted.
pub fn xmi_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("xmi"))
        })
        .collect();
    files.sort();
    files
}

/// Convert every `.xmi` file under `dir` to `.casb` under `out_dir`, keeping
/// the relative layout. Files are converted in parallel; one failure does not
/// stop the others.
pub fn convert_tree(
    dir: &Path,
    out_dir: &Path,
    ts: &Arc<TypeSystem>,
    config: &CasConfig,
) -> Result<BatchReport> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let inputs = xmi_files(dir);
    tracing::info!(files = inputs.len(), dir = %dir.display(), "batch conversion");

    let results: Vec<(PathBuf, Result<(PathBuf, usize)>)> = inputs
        .par_iter()
        .map(|input| {
            let rel = input.strip_prefix(dir).unwrap_or(input);
            let output = out_dir.join(rel).with_extension("casb");
            let result = convert_file(input, &output, Some(ts), config)
                .map(|(_, diagnostics)| (output, diagnostics.len()));
            (input.clone(), result)
        })
        .collect();

    let mut report = BatchReport::default();
    for (input, result) in results {
        match result {
            Ok((output, warnings)) => {
                report.warnings += warnings;
                report.converted.push(output);
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::warn!(input = %input.display(), error = %message, "conversion failed");
                report.failed.push((input, message));
            }
        }
    }
    Ok(report)
}
