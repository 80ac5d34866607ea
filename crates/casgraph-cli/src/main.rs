//! Casgraph CLI
//!
//! - Inspecting type-system descriptors (`types`)
//! - Converting CAS files between XMI and the binary format (`convert`,
//!   `convert-batch`)
//! - Printing views, texts and index contents (`dump`)

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use casgraph_core::{CasConfig, XmiDiagnostic};
use casgraph_types::digest::format_fingerprint;
use casgraph_types::{load_type_system, TypeInfo, TypeKind, TypeSystem};

mod cas_io;
mod dump;

#[derive(Parser)]
#[command(name = "casgraph")]
#[command(author, version, about = "Casgraph: typed feature-structure documents")]
struct Cli {
    /// JSON settings file (extra indexes, XMI and binary options).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a descriptor (following its imports), commit it and list its types.
    Types {
        descriptor: PathBuf,
        /// Print JSON instead of a listing.
        #[arg(long)]
        json: bool,
        /// Include built-in `cas.*` types and array types.
        #[arg(long)]
        all: bool,
    },

    /// Convert a CAS file. Formats follow the extensions: `.xmi`/`.xml` or `.casb`.
    Convert {
        /// Type-system descriptor. Optional for self-describing `.casb` input.
        #[arg(long)]
        types: Option<PathBuf>,
        input: PathBuf,
        output: PathBuf,
        /// Varint-compressed binary body.
        #[arg(long)]
        compressed: bool,
        /// Store the type system in binary output.
        #[arg(long)]
        embed_types: bool,
        /// Skip unknown types and bad values in XMI input instead of failing.
        #[arg(long)]
        lenient: bool,
    },

    /// Print views, document texts and index contents of a CAS file.
    Dump {
        #[arg(long)]
        types: Option<PathBuf>,
        input: PathBuf,
        /// Also list every structure of this type (and its subtypes) with its values.
        #[arg(long)]
        select: Option<String>,
        #[arg(long)]
        lenient: bool,
    },

    /// Convert every `.xmi` file under a directory to `.casb`, in parallel.
    ConvertBatch {
        #[arg(long)]
        types: PathBuf,
        dir: PathBuf,
        out_dir: PathBuf,
        #[arg(long)]
        compressed: bool,
        #[arg(long)]
        embed_types: bool,
        #[arg(long)]
        lenient: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Types {
            descriptor,
            json,
            all,
        } => cmd_types(&descriptor, json, all),
        Commands::Convert {
            types,
            input,
            output,
            compressed,
            embed_types,
            lenient,
        } => {
            let config = with_flags(config, compressed, embed_types, lenient);
            cmd_convert(types.as_deref(), &input, &output, &config)
        }
        Commands::Dump {
            types,
            input,
            select,
            lenient,
        } => {
            let config = with_flags(config, false, false, lenient);
            cmd_dump(types.as_deref(), &input, select.as_deref(), &config)
        }
        Commands::ConvertBatch {
            types,
            dir,
            out_dir,
            compressed,
            embed_types,
            lenient,
        } => {
            let config = with_flags(config, compressed, embed_types, lenient);
            cmd_convert_batch(&types, &dir, &out_dir, &config)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout carries command output (including JSON); logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<CasConfig> {
    match path {
        Some(path) => CasConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(CasConfig::default()),
    }
}

/// Command-line switches only ever turn options on.
fn with_flags(mut config: CasConfig, compressed: bool, embed_types: bool, lenient: bool) -> CasConfig {
    config.binary.compressed |= compressed;
    config.binary.embed_type_system |= embed_types;
    if lenient {
        config.xmi.strict = false;
    }
    config
}

fn load_types(path: Option<&Path>) -> Result<Option<Arc<TypeSystem>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let (ts, _) = load_type_system(path)
        .with_context(|| format!("failed to load type system {}", path.display()))?;
    tracing::debug!(types = ts.type_count(), path = %path.display(), "type system loaded");
    Ok(Some(ts))
}

fn print_diagnostics(diagnostics: &[XmiDiagnostic]) {
    for d in diagnostics {
        println!("  {} {} (at byte {})", "skipped:".yellow(), d.message, d.position);
    }
}

// ============================================================================
// types
// ============================================================================

#[derive(Serialize)]
struct TypeListing {
    fingerprint: String,
    types: Vec<TypeEntry>,
}

#[derive(Serialize)]
struct TypeEntry {
    name: String,
    supertype: Option<String>,
    kind: String,
    features: Vec<FeatureEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_values: Option<Vec<String>>,
}

#[derive(Serialize)]
struct FeatureEntry {
    name: String,
    range: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    multiple_references_allowed: bool,
}

fn kind_label(kind: TypeKind) -> String {
    match kind {
        TypeKind::Top => "top".to_string(),
        TypeKind::Primitive(p) => p.name().to_string(),
        TypeKind::String => "string".to_string(),
        TypeKind::StringSubtype => "string subtype".to_string(),
        TypeKind::ArrayBase => "array base".to_string(),
        TypeKind::Array(_) => "array".to_string(),
        TypeKind::Structure => "structure".to_string(),
    }
}

/// Built-in `cas.*` types and the implicit array types of user types.
fn is_implicit(t: &TypeInfo) -> bool {
    t.name().starts_with("cas.") || t.is_array()
}

fn type_listing(ts: &TypeSystem, all: bool) -> TypeListing {
    let types = ts
        .types()
        .filter(|t| all || !is_implicit(t))
        .map(|t| TypeEntry {
            name: t.name().to_string(),
            supertype: t.supertype().map(|s| ts.type_name(s).to_string()),
            kind: kind_label(t.kind()),
            features: t
                .declared_features()
                .iter()
                .map(|f| {
                    let info = ts.feature_info(*f);
                    FeatureEntry {
                        name: info.name().to_string(),
                        range: ts.type_name(info.range()).to_string(),
                        multiple_references_allowed: info.multiple_references_allowed(),
                    }
                })
                .collect(),
            allowed_values: t.allowed_values().map(<[String]>::to_vec),
        })
        .collect();
    TypeListing {
        fingerprint: format_fingerprint(ts.fingerprint()),
        types,
    }
}

fn cmd_types(descriptor: &Path, json: bool, all: bool) -> Result<()> {
    let (ts, _) = load_type_system(descriptor)
        .with_context(|| format!("failed to load type system {}", descriptor.display()))?;
    let listing = type_listing(&ts, all);

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!(
        "{} {} ({} types, {})",
        "Type system".green().bold(),
        descriptor.display(),
        ts.type_count(),
        listing.fingerprint
    );
    for t in &listing.types {
        match &t.supertype {
            Some(sup) => println!("  {} < {}", t.name.cyan(), sup),
            None => println!("  {}", t.name.cyan()),
        }
        for f in &t.features {
            let multi = if f.multiple_references_allowed { " (shared)" } else { "" };
            println!("      {}: {}{}", f.name, f.range, multi);
        }
        if let Some(values) = &t.allowed_values {
            println!("      one of: {}", values.join(", "));
        }
    }
    Ok(())
}

// ============================================================================
// convert / dump
// ============================================================================

fn cmd_convert(types: Option<&Path>, input: &Path, output: &Path, config: &CasConfig) -> Result<()> {
    println!(
        "{} {}",
        "Converting".green().bold(),
        input.display()
    );
    let ts = load_types(types)?;
    let (written, diagnostics) = cas_io::convert_file(input, output, ts.as_ref(), config)?;
    print_diagnostics(&diagnostics);
    println!("  {} {} ({written} bytes)", "→".cyan(), output.display());
    Ok(())
}

fn cmd_dump(types: Option<&Path>, input: &Path, select: Option<&str>, config: &CasConfig) -> Result<()> {
    let ts = load_types(types)?;
    let loaded = cas_io::read_cas(input, ts.as_ref(), config)?;
    let select = match select {
        Some(name) => Some(
            loaded
                .cas
                .type_system()
                .get_type(name)
                .ok_or_else(|| anyhow!("unknown type `{name}`"))?,
        ),
        None => None,
    };
    println!("{} {}", "CAS".green().bold(), input.display());
    print_diagnostics(&loaded.diagnostics);
    print!("{}", dump::render(&loaded.cas, select)?);
    Ok(())
}

fn cmd_convert_batch(types: &Path, dir: &Path, out_dir: &Path, config: &CasConfig) -> Result<()> {
    println!(
        "{} {} → {}",
        "Converting directory".green().bold(),
        dir.display(),
        out_dir.display()
    );
    let ts = load_types(Some(types))?
        .ok_or_else(|| anyhow!("no type system loaded from {}", types.display()))?;
    let report = cas_io::convert_tree(dir, out_dir, &ts, config)?;

    for (input, error) in &report.failed {
        println!("  {} {}: {}", "failed:".red(), input.display(), error);
    }
    println!(
        "  {} {} converted, {} failed, {} skipped items",
        "→".cyan(),
        report.converted.len(),
        report.failed.len(),
        report.warnings
    );
    if !report.failed.is_empty() {
        bail!("{} of {} files failed", report.failed.len(), report.failed.len() + report.converted.len());
    }
    Ok(())
}
