//! Thin CLI wrapper over the core library. All configuration resolution
//! (`SNUG_STORAGE`, `~/.snug/config.yaml`) happens here; the library types
//! themselves take explicit constructor arguments and hold no global state.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use snug::archiver::{Archiver, ArchiverOptions};
use snug::chunk_store::{FsChunkStore, OrganizationStrategy};
use snug::digest::Algorithm;
use snug::extractor::{ExtractOptions, Extractor};
use snug::manifest::{ArchiveEntry, ManifestCodec};
use snug::validator::{ValidationLevel, Validator};
use snug::walker::WalkOptions;
use snug::HashCache;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Raise the default log filter to `debug` (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Walk SRC into a manifest at OUT, storing bytes by content hash.
    Archive {
        source: PathBuf,
        output: PathBuf,

        #[arg(long = "hash-algorithm", default_value = "sha256")]
        hash_algorithm: String,

        #[arg(long = "ignore-file")]
        ignore_file: Option<PathBuf>,

        #[arg(long = "follow-symlinks")]
        follow_symlinks: bool,
    },

    /// Materialize ARCHIVE's entries under DST.
    Extract {
        archive: PathBuf,
        destination: PathBuf,

        #[arg(long)]
        overwrite: bool,
    },

    /// Check that ARCHIVE's referenced chunks are present (and intact, if
    /// `--strict`).
    Validate {
        archive: PathBuf,

        #[arg(long)]
        strict: bool,

        #[arg(long)]
        quick: bool,
    },

    /// List ARCHIVE's entries.
    List {
        archive: PathBuf,

        #[arg(long)]
        detailed: bool,
    },

    /// Print ARCHIVE's format/version/hash-algorithm and entry counts.
    Info { archive: PathBuf },
}

/// `~/.snug/config.yaml`. Only `store_root` is recognized today; unknown
/// keys are ignored rather than rejected, since the CLI is the only
/// consumer and new keys should not break existing config files.
#[derive(Debug, Default, Deserialize)]
struct Config {
    store_root: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli.command) {
        eprintln!("snug: error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Archive { source, output, hash_algorithm, ignore_file, follow_symlinks } => {
            cmd_archive(&source, &output, &hash_algorithm, ignore_file.as_deref(), follow_symlinks)
        }
        Commands::Extract { archive, destination, overwrite } => cmd_extract(&archive, &destination, overwrite),
        Commands::Validate { archive, strict, quick } => cmd_validate(&archive, strict, quick),
        Commands::List { archive, detailed } => cmd_list(&archive, detailed),
        Commands::Info { archive } => cmd_info(&archive),
    }
}

fn cmd_archive(
    source: &Path,
    output: &Path,
    hash_algorithm: &str,
    ignore_file: Option<&Path>,
    follow_symlinks: bool,
) -> Result<()> {
    let algorithm = Algorithm::parse(hash_algorithm).with_context(|| format!("unknown hash algorithm: {hash_algorithm}"))?;
    if !algorithm.is_valid_primary() {
        bail!("{algorithm} is read-only for interoperability and cannot be used as a primary archive digest");
    }

    let ignore_patterns = match ignore_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading ignore file {}", path.display()))?
            .lines()
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };

    let store_root = resolve_store_root()?;
    let store = Arc::new(FsChunkStore::new(&store_root, OrganizationStrategy::default())?);

    let cache = HashCache::new(algorithm, snug::hash_cache::DEFAULT_MAX_CACHE_SIZE).with_persist_path(store_root.join(".hashcache.json"));
    cache.load()?;

    let options = ArchiverOptions {
        hash_algorithm: algorithm,
        walk_options: WalkOptions { follow_symlinks, ..WalkOptions::default() },
        ignore_patterns,
        ..ArchiverOptions::default()
    };

    let archiver = Archiver::new(store, &cache, options);
    let manifest = archiver.run(source, output)?;
    cache.save()?;

    println!("archived {} entries to {}", manifest.entries.len(), output.display());
    Ok(())
}

fn cmd_extract(archive: &Path, destination: &Path, overwrite: bool) -> Result<()> {
    let store_root = resolve_store_root()?;
    let store = Arc::new(FsChunkStore::new(&store_root, OrganizationStrategy::default())?);

    let bytes = std::fs::read(archive).with_context(|| format!("reading archive {}", archive.display()))?;
    let options = ExtractOptions { overwrite, ..ExtractOptions::default() };
    let manifest = Extractor::new(store, options).extract(&bytes, destination)?;

    println!("extracted {} entries to {}", manifest.entries.len(), destination.display());
    Ok(())
}

fn cmd_validate(archive: &Path, strict: bool, quick: bool) -> Result<()> {
    if strict && quick {
        bail!("--strict and --quick are mutually exclusive");
    }

    let level = if strict {
        ValidationLevel::Strict
    } else if quick {
        ValidationLevel::Quick
    } else {
        ValidationLevel::Default
    };

    let store_root = resolve_store_root()?;
    let store = Arc::new(FsChunkStore::new(&store_root, OrganizationStrategy::default())?);

    let bytes = std::fs::read(archive).with_context(|| format!("reading archive {}", archive.display()))?;
    let report = Validator::new(store).validate(&bytes, level)?;

    println!(
        "{} entries ({} files, {} dirs, {} symlinks)",
        report.counts.entries, report.counts.files, report.counts.dirs, report.counts.symlinks
    );
    for digest in &report.missing {
        println!("missing: {digest}");
    }
    for digest in &report.mismatched {
        println!("mismatched: {digest}");
    }
    for path in &report.bad_paths {
        println!("bad path: {path}");
    }

    if !report.ok {
        bail!("validation failed");
    }

    println!("ok");
    Ok(())
}

fn cmd_list(archive: &Path, detailed: bool) -> Result<()> {
    let bytes = std::fs::read(archive).with_context(|| format!("reading archive {}", archive.display()))?;
    let manifest = ManifestCodec::parse(&bytes)?;

    for entry in &manifest.entries {
        if !detailed {
            println!("{}", entry.path());
            continue;
        }

        match entry {
            ArchiveEntry::File { path, digest, size, .. } => println!("file\t{path}\t{size}\t{digest}"),
            ArchiveEntry::Directory { path, .. } => println!("dir\t{path}"),
            ArchiveEntry::Symlink { path, symlink_target, .. } => println!("symlink\t{path} -> {symlink_target}"),
        }
    }

    Ok(())
}

fn cmd_info(archive: &Path) -> Result<()> {
    let bytes = std::fs::read(archive).with_context(|| format!("reading archive {}", archive.display()))?;
    let manifest = ManifestCodec::parse(&bytes)?;

    let files = manifest.entries.iter().filter(|e| matches!(e, ArchiveEntry::File { .. })).count();
    let dirs = manifest.entries.iter().filter(|e| matches!(e, ArchiveEntry::Directory { .. })).count();
    let symlinks = manifest.entries.iter().filter(|e| matches!(e, ArchiveEntry::Symlink { .. })).count();

    println!("format:        snug");
    println!("version:       {}", manifest.version);
    println!("hashAlgorithm: {}", manifest.hash_algorithm);
    println!("entries:       {} ({files} files, {dirs} dirs, {symlinks} symlinks)", manifest.entries.len());
    println!("distinct hashes: {}", manifest.hashes.len());

    Ok(())
}

/// Resolution order: `SNUG_STORAGE` env var, then `store_root` in
/// `~/.snug/config.yaml`, then a `.snug-store` directory relative to the
/// current working directory.
fn resolve_store_root() -> Result<PathBuf> {
    if let Ok(from_env) = std::env::var("SNUG_STORAGE") {
        return Ok(PathBuf::from(from_env));
    }

    if let Some(home) = std::env::var_os("HOME") {
        let config_path = PathBuf::from(home).join(".snug").join("config.yaml");
        if config_path.exists() {
            let file = File::open(&config_path).with_context(|| format!("opening {}", config_path.display()))?;
            let config: Config =
                serde_yaml::from_reader(file).with_context(|| format!("parsing {}", config_path.display()))?;
            if let Some(root) = config.store_root {
                return Ok(root);
            }
        }
    }

    Ok(PathBuf::from(".snug-store"))
}
