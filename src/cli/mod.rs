use crate::colors::*;
use crate::config::{BinLinksMode, InstallConfig, LinkStrategy, ScriptsMode, VerifyMode};
use crate::installer::Installer;
use crate::paths;
use crate::store::{file_cas, Store};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(
    name = "betterpm",
    version,
    about = "Disk-efficient npm install engine with a content-addressed store",
    long_about = "betterpm — installs a resolved package-lock into node_modules\nthrough a shared content-addressed store.\n\nExamples:\n  betterpm install\n  betterpm install --incremental\n  betterpm cache stats\n  betterpm cache gc --dry-run"
)]
pub struct BetterpmCli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install dependencies from the lockfile into node_modules
    #[command(alias = "i")]
    Install {
        /// Lockfile path (defaults to package-lock.json)
        #[arg(long)]
        lockfile: Option<PathBuf>,
        /// Reconcile the live node_modules instead of staging + atomic swap
        #[arg(long)]
        incremental: bool,
        /// Always copy files out of the store
        #[arg(long)]
        copy: bool,
        /// Require hardlinks (fall back to copy only on link errors)
        #[arg(long)]
        hardlink: bool,
        #[arg(long = "no-bin-links")]
        no_bin_links: bool,
        /// Warn instead of failing when the lockfile omits integrity
        #[arg(long = "best-effort-integrity")]
        best_effort_integrity: bool,
        /// Override the shared store location
        #[arg(long)]
        store: Option<PathBuf>,
        /// Width of the fetch/ingest/materialize pools
        #[arg(long)]
        concurrency: Option<usize>,
        /// Skip the file-level store; materialize from unpacked trees
        #[arg(long = "no-file-cas")]
        no_file_cas: bool,
        /// Command to run after install (e.g. --rebuild node-gyp rebuild)
        #[arg(long, num_args = 1.., value_name = "ARGV")]
        rebuild: Option<Vec<String>>,
        /// Print the structured report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or maintain the shared store
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Show the store path on this machine
    Path {
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Show blob and file-level store statistics
    Stats {
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Remove unreferenced blobs past the age threshold
    Gc {
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_name = "DAYS")]
        max_age_days: Option<u64>,
    },
}

impl BetterpmCli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Install {
                lockfile,
                incremental,
                copy,
                hardlink,
                no_bin_links,
                best_effort_integrity,
                store,
                concurrency,
                no_file_cas,
                rebuild,
                json,
            } => {
                if copy && hardlink {
                    bail!("--copy and --hardlink are mutually exclusive");
                }
                let mut config = InstallConfig {
                    incremental,
                    store_root: store,
                    file_cas: !no_file_cas,
                    ..InstallConfig::default()
                };
                if copy {
                    config.link_strategy = LinkStrategy::Copy;
                } else if hardlink {
                    config.link_strategy = LinkStrategy::Hardlink;
                }
                if no_bin_links {
                    config.bin_links = BinLinksMode::Off;
                }
                if best_effort_integrity {
                    config.verify = VerifyMode::BestEffort;
                }
                if let Some(n) = concurrency {
                    config.fs_concurrency = n.max(1);
                }
                if let Some(argv) = rebuild {
                    config.scripts = ScriptsMode::Rebuild(argv);
                }
                cmd_install(lockfile, config, json)
            }
            Commands::Cache { cmd } => match cmd {
                CacheCmd::Path { store } => {
                    println!("{}", paths::store_root(store.as_deref()).display());
                    Ok(())
                }
                CacheCmd::Stats { store } => cmd_cache_stats(store),
                CacheCmd::Gc { store, dry_run, max_age_days } => {
                    cmd_cache_gc(store, dry_run, max_age_days)
                }
            },
        }
    }
}

fn cmd_install(lockfile: Option<PathBuf>, config: InstallConfig, json: bool) -> Result<()> {
    let lock_path = lockfile.unwrap_or_else(|| PathBuf::from("package-lock.json"));
    if !lock_path.exists() {
        bail!("no lockfile at {}", lock_path.display());
    }
    let project_root = std::env::current_dir()?;
    let installer = Installer::new(project_root, config)?;
    let start = Instant::now();
    let report = installer.run(&lock_path)?;
    let duration = start.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for warning in &report.warnings {
        println!(
            "{gray}[betterpm]{reset} {yellow}warning{reset} {warning}",
            gray = C_GRAY,
            yellow = C_YELLOW,
            reset = C_RESET
        );
    }
    println!(
        "{gray}[betterpm]{reset} tarballs: {green}{dl} downloaded{reset}, {copied} copied, {dim}{reused} reused{reset}",
        gray = C_GRAY,
        green = C_GREEN,
        dim = C_DIM,
        reset = C_RESET,
        dl = report.downloaded_tarballs,
        copied = report.copied_tarballs,
        reused = report.reused_tarballs
    );
    println!(
        "{gray}[betterpm]{reset} unpacked: {extracted} extracted, {dim}{reused} reused{reset}; files: {ingested} ingested, {deduped} deduped",
        gray = C_GRAY,
        dim = C_DIM,
        reset = C_RESET,
        extracted = report.extracted_unpacked,
        reused = report.reused_unpacked,
        ingested = report.ingested_files,
        deduped = report.deduped_files
    );
    if report.kept + report.relinked + report.removed > 0 {
        println!(
            "{gray}[betterpm]{reset} incremental: {kept} kept, {relinked} relinked, {red}{removed} removed{reset}",
            gray = C_GRAY,
            red = C_RED,
            reset = C_RESET,
            kept = report.kept,
            relinked = report.relinked,
            removed = report.removed
        );
    }
    if report.skipped_platform > 0 {
        println!(
            "{gray}[betterpm]{reset} {dim}skipped {n} optional package(s) for this platform{reset}",
            gray = C_GRAY,
            dim = C_DIM,
            reset = C_RESET,
            n = report.skipped_platform
        );
    }
    if let Some(rebuild) = &report.rebuild {
        let state = if rebuild.ok { "ok" } else { "failed" };
        println!(
            "{gray}[betterpm]{reset} rebuild {state}{detail}",
            gray = C_GRAY,
            reset = C_RESET,
            detail = rebuild
                .detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        );
    }
    println!(
        "{gray}[betterpm]{reset} {green}installed{reset} {total} package(s) ({links} workspace link(s), {bins} bin shim(s)) in {duration:.2?}",
        gray = C_GRAY,
        green = C_GREEN,
        reset = C_RESET,
        total = report.materialized_packages + report.kept,
        links = report.workspace_links,
        bins = report.bin_links
    );
    Ok(())
}

fn cmd_cache_stats(store_override: Option<PathBuf>) -> Result<()> {
    let store = Store::open(paths::store_root(store_override.as_deref()))?;
    let stats = store.stats()?;
    println!(
        "{gray}[betterpm]{reset} store {path}",
        gray = C_GRAY,
        reset = C_RESET,
        path = store.root().display()
    );
    println!("  tarballs:          {} ({} bytes)", stats.tarballs, stats.tarball_bytes);
    println!("  unique files:      {} ({} bytes)", stats.unique_files, stats.unique_file_bytes);
    println!("  package manifests: {}", stats.package_manifests);
    Ok(())
}

fn cmd_cache_gc(
    store_override: Option<PathBuf>,
    dry_run: bool,
    max_age_days: Option<u64>,
) -> Result<()> {
    let store = Store::open(paths::store_root(store_override.as_deref()))?;
    let max_age = max_age_days
        .map(|d| Duration::from_secs(d * 86_400))
        .unwrap_or(InstallConfig::default().gc_max_age);
    let blob_report = store.gc(max_age, dry_run)?;
    let file_report = file_cas::gc(&store, dry_run)?;
    let verb = if dry_run { "would remove" } else { "removed" };
    println!(
        "{gray}[betterpm]{reset} gc: {verb} {blobs} tarball blob(s), {files} file blob(s)",
        gray = C_GRAY,
        reset = C_RESET,
        blobs = blob_report.removed_blobs,
        files = file_report.removed_files
    );
    Ok(())
}
