use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use treepatch::{
    apply::{Applier, ApplyOptions},
    create, multipart, scanner, Compression, ModifyStrategy, PatchConfig, ProgressObserver,
    ScanOptions, VersionRegistry,
};

#[derive(Parser)]
#[command(name = "treepatch", version, about = "Directory-tree patch creator and applier")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing a source and a target directory
    Create {
        /// Directory holding the version being upgraded from
        #[arg(long)]
        from: PathBuf,
        /// Directory holding the version being upgraded to
        #[arg(long)]
        to: PathBuf,
        /// Label of the source version (defaults to its directory name)
        #[arg(long)]
        from_label: Option<String>,
        /// Label of the target version (defaults to its directory name)
        #[arg(long)]
        to_label: Option<String>,
        /// Key file path, relative to each tree root
        #[arg(long, short)]
        key_file: String,
        /// Output directory (defaults to the configured output_dir)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Base file name of the patch (defaults to "<from>-to-<to>")
        #[arg(long)]
        name: Option<String>,
        /// Split patches larger than this many bytes into parts
        #[arg(long)]
        max_part_size: Option<u64>,
        /// none, zstd or gzip
        #[arg(long)]
        compression: Option<Compression>,
        /// Carry modified files as binary diffs where smaller
        #[arg(long)]
        binary_diff: bool,
    },
    /// Apply a patch (or part 1 of a multi-part patch) to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Check preconditions and report, without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Do not back up the target (failures cannot be rolled back)
        #[arg(long)]
        no_backup: bool,
        /// Skip re-hashing the patched files
        #[arg(long)]
        no_verify: bool,
    },
    /// Check a directory against a patch's requirements, or summarize it
    Verify {
        /// Directory to check
        #[arg(long)]
        target: PathBuf,
        /// Patch whose preconditions the directory must satisfy
        #[arg(long, short)]
        patch: Option<PathBuf>,
    },
    /// Print a patch's header, versions and operations
    Info {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
    },
}

/// Drives an indicatif bar from library progress callbacks.
struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    fn new(prefix: &str) -> Self {
        let template = "{prefix:>10} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}";
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = ProgressBar::new(0).with_style(style).with_prefix(prefix.to_string());
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressObserver for BarObserver {
    fn on_progress(&self, current: u64, total: u64, label: &str) {
        if self.bar.length() != Some(total) {
            self.bar.set_length(total);
        }
        self.bar.set_position(current);
        self.bar.set_message(label.to_string());
    }
}

fn dir_label(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Directory not found: {}", path.display()))?;
    canonical
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("Cannot derive a version label from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with_target(false)
        .init();

    let config = PatchConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Create {
            from,
            to,
            from_label,
            to_label,
            key_file,
            output,
            name,
            max_part_size,
            compression,
            binary_diff,
        } => {
            let from_label = from_label.map_or_else(|| dir_label(&from), Ok)?;
            let to_label = to_label.map_or_else(|| dir_label(&to), Ok)?;
            if from_label == to_label {
                bail!("Source and target need different labels (both are '{from_label}')");
            }
            let output = output.unwrap_or_else(|| config.output_dir.clone());
            let name = name.unwrap_or_else(|| format!("{from_label}-to-{to_label}"));
            let compression = compression.unwrap_or(config.compression);
            let max_part_size = max_part_size.or(config.max_part_size);
            let mut options = config.generator_options();
            if binary_diff {
                options.modify_strategy = ModifyStrategy::BinaryDiff;
            }

            println!("Creating patch...");
            println!("  From: {} ({})", from.display(), from_label);
            println!("  To: {} ({})", to.display(), to_label);
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let registry = Arc::new(VersionRegistry::new(config.scan_workers()));

            // Both trees are scanned concurrently on the blocking pool.
            let register = |label: String, location: PathBuf| {
                let registry = Arc::clone(&registry);
                let key_file = key_file.clone();
                tokio::task::spawn_blocking(move || {
                    registry
                        .register(&label, &location, &key_file, None)
                        .with_context(|| format!("Failed to scan {}", location.display()))
                })
            };
            let (source, target) =
                tokio::try_join!(register(from_label, from), register(to_label, to))?;
            let (source, target) = (source?, target?);

            let patch = create::generate(&source, &target, &options)
                .context("Failed to generate patch")?;
            let summary = patch.summary();
            let paths = multipart::write_patch_set(
                patch,
                &output,
                &name,
                max_part_size,
                compression,
                config.compression_level,
            )
            .context("Failed to write patch")?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            for path in &paths {
                println!("  Wrote: {}", path.display());
            }
            println!("  Directories created: {}", summary.dirs_created);
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Directories deleted: {}", summary.dirs_deleted);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            dry_run,
            no_backup,
            no_verify,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let start = Instant::now();
            let loaded = multipart::load_patch_set(&patch)
                .with_context(|| format!("Failed to load patch: {}", patch.display()))?;
            let options = ApplyOptions {
                dry_run,
                create_backup: !no_backup,
                verify_after: !no_verify,
            };

            let bar = BarObserver::new("applying");
            let result = Applier::new(options).with_progress(&bar).apply(&loaded, &target);
            bar.finish();
            let report = result.context("Failed to apply patch")?;
            let elapsed = start.elapsed();

            if report.dry_run {
                println!("\nDry run: target satisfies all preconditions. Would apply:");
            } else {
                println!(
                    "\nPatch applied successfully! ({} -> {})",
                    report.from_version, report.to_version
                );
            }
            println!("  Directories created: {}", report.summary.dirs_created);
            println!("  Files added: {}", report.summary.files_added);
            println!("  Files modified: {}", report.summary.files_modified);
            println!("  Files deleted: {}", report.summary.files_deleted);
            println!("  Directories deleted: {}", report.summary.dirs_deleted);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Verify { target, patch } => match patch {
            Some(patch) => {
                let loaded = multipart::load_patch_set(&patch)
                    .with_context(|| format!("Failed to load patch: {}", patch.display()))?;
                let options = ApplyOptions {
                    dry_run: true,
                    ..ApplyOptions::default()
                };
                Applier::new(options)
                    .apply(&loaded, &target)
                    .with_context(|| format!("{} cannot take this patch", target.display()))?;
                println!(
                    "{} matches version {} and can be patched to {}",
                    target.display(),
                    loaded.from_version,
                    loaded.to_version
                );
            }
            None => {
                let bar = BarObserver::new("hashing");
                let workers = config.scan_workers();
                let options = ScanOptions::parallel(workers).with_progress(&bar);
                let result = scanner::scan(&target, &options);
                bar.finish();
                let scan = result.with_context(|| format!("Failed to scan {}", target.display()))?;
                let checksum = treepatch::manifest::aggregate_checksum(&scan.files);
                println!("Tree: {}", target.display());
                println!("  Files: {}", scan.files.len());
                println!("  Directories: {}", scan.directories.len());
                println!("  Total size: {} bytes", scan.total_size());
                println!("  Aggregate checksum: {checksum}");
            }
        },
        Commands::Info { patch } => {
            let loaded = multipart::load_patch_set(&patch)
                .with_context(|| format!("Failed to load patch: {}", patch.display()))?;
            let summary = loaded.summary();
            let payload: u64 = loaded.operations.iter().map(|op| op.payload_len()).sum();

            println!("Patch: {}", patch.display());
            println!("  Format version: {}", loaded.header.format_version);
            println!("  Created: {}", loaded.header.created_at.to_rfc3339());
            println!("  Compression: {}", loaded.header.compression);
            let (from_key, to_key) = (&loaded.from_key_file, &loaded.to_key_file);
            println!(
                "  From: {} (key {} {})",
                loaded.from_version, from_key.path, from_key.checksum
            );
            println!("  To: {} (key {} {})", loaded.to_version, to_key.path, to_key.checksum);
            println!("  Required files: {}", loaded.required_files.len());
            println!("  Operations: {} ({} payload bytes)", summary.total(), payload);
            println!("    Directories created: {}", summary.dirs_created);
            println!("    Files added: {}", summary.files_added);
            println!("    Files modified: {}", summary.files_modified);
            println!("    Files deleted: {}", summary.files_deleted);
            println!("    Directories deleted: {}", summary.dirs_deleted);
        }
    }

    Ok(())
}
