use crate::bins;
use crate::config::{BinLinksMode, InstallConfig, ScriptsMode};
use crate::error::{EngineError, FetchKind, IoContext, Result};
use crate::fetch::{self, FetchOutcome};
use crate::linker::{self, FileLimiter};
use crate::lockfile::{self, InstallEntry, Lockfile};
use crate::paths;
use crate::platform::{self, Runtime};
use crate::store::{file_cas, Store};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod finalize;

/// Cooperative cancellation checked at task boundaries. A cancelled
/// full-replace run never touches the live node_modules; a cancelled
/// incremental run is repaired by the next run's kept-vs-reinstall check.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub downloaded_tarballs: usize,
    pub copied_tarballs: usize,
    pub reused_tarballs: usize,
    pub extracted_unpacked: usize,
    pub reused_unpacked: usize,
    pub ingested_files: usize,
    pub deduped_files: usize,
    pub skipped_platform: usize,
    pub workspace_links: usize,
    pub link_fallbacks: usize,
    pub materialized_packages: usize,
    pub kept: usize,
    pub relinked: usize,
    pub removed: usize,
    pub bin_links: usize,
    pub rebuild: Option<RebuildOutcome>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildOutcome {
    pub ok: bool,
    pub status: Option<i32>,
    pub detail: Option<String>,
}

#[derive(Debug)]
enum Planned {
    /// Workspace entry: symlink to an in-repo directory.
    Link { entry: InstallEntry, target_rel: String },
    /// Optional entry excluded by the platform gate.
    Skip { entry: InstallEntry },
    /// Regular entry going through fetch → verify → extract → materialize.
    Install { entry: InstallEntry },
}

impl Planned {
    fn entry(&self) -> &InstallEntry {
        match self {
            Planned::Link { entry, .. } | Planned::Skip { entry } | Planned::Install { entry } => {
                entry
            }
        }
    }
}

/// Top-level state machine: lockfile → plan → bounded pipelines → layout
/// finalize → bin shims → optional rebuild → report.
pub struct Installer {
    store: Store,
    config: InstallConfig,
    project_root: PathBuf,
    project_id: String,
    runtime: Runtime,
    cancel: CancelToken,
}

impl Installer {
    pub fn new(project_root: PathBuf, config: InstallConfig) -> Result<Self> {
        let store = Store::open(paths::store_root(config.store_root.as_deref()))?;
        Self::with_store(project_root, config, store)
    }

    pub fn with_store(project_root: PathBuf, config: InstallConfig, store: Store) -> Result<Self> {
        let project_id = paths::project_id(&project_root);
        Ok(Self {
            store,
            config,
            project_root,
            project_id,
            runtime: Runtime::current(),
            cancel: CancelToken::default(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self, lockfile_path: &Path) -> Result<InstallReport> {
        let lock = lockfile::load(lockfile_path)?;
        self.run_lockfile(&lock)
    }

    pub fn run_lockfile(&self, lock: &Lockfile) -> Result<InstallReport> {
        let mut report = InstallReport::default();
        finalize::reclaim_stale(&self.project_root)?;
        let plan = self.classify(lock, &mut report)?;
        self.check_cancel()?;

        let width = self.config.effective_concurrency();
        let fetched = self.fetch_stage(&plan, width, &mut report)?;
        self.check_cancel()?;
        if self.config.file_cas {
            self.ingest_stage(&fetched, width, &mut report)?;
            self.check_cancel()?;
        }

        let node_modules = self.project_root.join("node_modules");
        let (layout_root, staging) = if self.config.incremental {
            fs::create_dir_all(&node_modules)
                .io_ctx(format!("create {}", node_modules.display()))?;
            (node_modules.clone(), None)
        } else {
            let staging = finalize::staging_dir(&self.project_root);
            fs::create_dir_all(&staging)
                .io_ctx(format!("create staging {}", staging.display()))?;
            (staging.clone(), Some(staging))
        };

        let materialize_result =
            self.materialize_stage(&plan, &fetched, &layout_root, width, &mut report);
        if let Err(e) = materialize_result {
            // Full-replace keeps the previous tree intact on any failure.
            if let Some(staging) = &staging {
                let _ = fs::remove_dir_all(staging);
            }
            return Err(e);
        }
        self.check_cancel()?;

        if let Some(staging) = &staging {
            finalize::swap_into_place(&self.project_root, staging)?;
        } else {
            let desired =
                finalize::desired_tree(plan.iter().filter(|p| !matches!(p, Planned::Skip { .. })).map(|p| p.entry().dest_segments()));
            report.removed = finalize::remove_extraneous(&node_modules, &desired)?;
        }

        for (_, outcome) in &fetched {
            self.store.inc_ref(&outcome.key, &self.project_id)?;
        }

        self.bin_stage(&plan, &node_modules, &mut report)?;
        self.deprecation_stage(&plan, &node_modules, &mut report);

        if let ScriptsMode::Rebuild(argv) = &self.config.scripts {
            report.rebuild = Some(run_rebuild(&self.project_root, argv));
        }
        Ok(report)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// FILTER_PLATFORM plus workspace resolution, in lockfile order.
    fn classify(&self, lock: &Lockfile, report: &mut InstallReport) -> Result<Vec<Planned>> {
        let mut plan = Vec::with_capacity(lock.entries.len());
        for entry in &lock.entries {
            if entry.link {
                let target_rel = entry
                    .resolved
                    .clone()
                    .or_else(|| lock.workspaces.get(&entry.name).map(|w| w.rel_path.clone()))
                    .ok_or_else(|| EngineError::WorkspaceResolutionFailed {
                        name: entry.name.clone(),
                        reason: "no resolved workspace path".into(),
                    })?;
                let target_abs = self.project_root.join(&target_rel);
                if !target_abs.join("package.json").is_file() {
                    return Err(EngineError::WorkspaceResolutionFailed {
                        name: entry.name.clone(),
                        reason: format!("{target_rel} has no package.json"),
                    });
                }
                plan.push(Planned::Link { entry: entry.clone(), target_rel });
                continue;
            }

            let compat = platform::check(&entry.os, &entry.cpu, &entry.libc, &self.runtime);
            if compat.uncertain {
                report.warnings.push(format!(
                    "{}: libc constraint evaluated with a heuristic probe",
                    entry.rel_path
                ));
            }
            if !compat.ok {
                let reason = compat.reason.unwrap_or_else(|| "platform mismatch".into());
                if entry.optional {
                    report.skipped_platform += 1;
                    plan.push(Planned::Skip { entry: entry.clone() });
                    continue;
                }
                return Err(EngineError::PlatformUnsupported {
                    entry: entry.rel_path.clone(),
                    reason,
                });
            }
            plan.push(Planned::Install { entry: entry.clone() });
        }
        Ok(plan)
    }

    /// FETCH+EXTRACT pool: per entry one HTTP stream or local copy, one
    /// temp file, strictly ordered fetch → verify → extract inside the task.
    fn fetch_stage<'a>(
        &self,
        plan: &'a [Planned],
        width: usize,
        report: &mut InstallReport,
    ) -> Result<Vec<(&'a InstallEntry, FetchOutcome)>> {
        let installs: Vec<&InstallEntry> = plan
            .iter()
            .filter_map(|p| match p {
                Planned::Install { entry } => Some(entry),
                _ => None,
            })
            .collect();
        let pool = build_pool(width)?;
        let results: Vec<Result<FetchOutcome>> = pool.install(|| {
            installs
                .par_iter()
                .map(|entry| {
                    self.check_cancel()?;
                    let url = entry.resolved.as_deref().ok_or_else(|| EngineError::Fetch {
                        url: entry.rel_path.clone(),
                        kind: FetchKind::Transport("no resolved url in lockfile".into()),
                    })?;
                    fetch::ensure_package(
                        &self.store,
                        &entry.rel_path,
                        url,
                        entry.integrity.as_deref(),
                        self.config.verify,
                        &self.project_root,
                    )
                })
                .collect()
        });

        let mut fetched = Vec::with_capacity(installs.len());
        for (entry, result) in installs.into_iter().zip(results) {
            let outcome = result?;
            report.downloaded_tarballs += outcome.downloaded as usize;
            report.copied_tarballs += outcome.copied_local as usize;
            report.reused_tarballs += outcome.reused_tarball as usize;
            report.extracted_unpacked += outcome.extracted as usize;
            report.reused_unpacked += outcome.reused_unpacked as usize;
            report.warnings.extend(outcome.warnings.iter().cloned());
            fetched.push((entry, outcome));
        }
        Ok(fetched)
    }

    /// INGEST pool: idempotent per-package file-CAS population.
    fn ingest_stage(
        &self,
        fetched: &[(&InstallEntry, FetchOutcome)],
        width: usize,
        report: &mut InstallReport,
    ) -> Result<()> {
        let pool = build_pool(width)?;
        let results: Vec<Result<Option<file_cas::IngestStats>>> = pool.install(|| {
            fetched
                .par_iter()
                .map(|(_, outcome)| {
                    self.check_cancel()?;
                    if file_cas::has_manifest(&self.store, &outcome.key) {
                        return Ok(None);
                    }
                    file_cas::ingest(&self.store, &outcome.key, &outcome.package_root).map(Some)
                })
                .collect()
        });
        for ((entry, _), result) in fetched.iter().zip(results) {
            let stats = result.map_err(|e| e.for_entry(&entry.rel_path))?;
            if let Some(stats) = stats {
                report.ingested_files += stats.files;
                report.deduped_files += stats.deduped;
            }
        }
        Ok(())
    }

    /// MATERIALIZE pool: one task per plan item; file operations inside a
    /// task are bounded by the shared limiter, directory recursion is not.
    fn materialize_stage(
        &self,
        plan: &[Planned],
        fetched: &[(&InstallEntry, FetchOutcome)],
        layout_root: &Path,
        width: usize,
        report: &mut InstallReport,
    ) -> Result<()> {
        let limiter = FileLimiter::new(width);
        let incremental = self.config.incremental;
        let by_rel: std::collections::HashMap<&str, &FetchOutcome> = fetched
            .iter()
            .map(|(entry, outcome)| (entry.rel_path.as_str(), outcome))
            .collect();
        let pool = build_pool(width)?;
        let results: Vec<Result<MatSummary>> = pool.install(|| {
            plan.par_iter()
                .map(|planned| {
                    self.check_cancel()?;
                    match planned {
                        Planned::Skip { .. } => Ok(MatSummary::default()),
                        Planned::Link { entry, target_rel } => {
                            self.place_workspace_link(entry, target_rel, layout_root, incremental)
                        }
                        Planned::Install { entry } => {
                            let outcome = by_rel
                                .get(entry.rel_path.as_str())
                                .copied()
                                .expect("fetched outcome for planned install");
                            self.place_package(entry, outcome, layout_root, incremental, &limiter, width)
                        }
                    }
                    .map_err(|e| e.for_entry(&planned.entry().rel_path))
                })
                .collect()
        });
        for result in results {
            let summary = result?;
            report.kept += summary.kept as usize;
            report.relinked += summary.relinked as usize;
            report.materialized_packages += summary.materialized as usize;
            report.workspace_links += summary.workspace_link as usize;
            report.link_fallbacks += summary.fallbacks;
        }
        Ok(())
    }

    fn place_workspace_link(
        &self,
        entry: &InstallEntry,
        target_rel: &str,
        layout_root: &Path,
        incremental: bool,
    ) -> Result<MatSummary> {
        let dest = dest_path(layout_root, entry);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).io_ctx(format!("create {}", parent.display()))?;
        }
        // The layout root sits directly under the project root, so each
        // destination segment contributes one `..`.
        let ups = entry.dest_segments().len();
        let mut link_target = PathBuf::new();
        for _ in 0..ups {
            link_target.push("..");
        }
        for seg in target_rel.split('/').filter(|s| !s.is_empty()) {
            link_target.push(seg);
        }

        if incremental {
            if let Ok(existing) = fs::read_link(&dest) {
                if existing == link_target {
                    return Ok(MatSummary { kept: true, workspace_link: true, ..Default::default() });
                }
            }
            remove_dest(&dest)?;
        }
        symlink_dir(&link_target, &dest)?;
        Ok(MatSummary { workspace_link: true, relinked: incremental, ..Default::default() })
    }

    #[allow(clippy::too_many_arguments)]
    fn place_package(
        &self,
        entry: &InstallEntry,
        outcome: &FetchOutcome,
        layout_root: &Path,
        incremental: bool,
        limiter: &FileLimiter,
        width: usize,
    ) -> Result<MatSummary> {
        let dest = dest_path(layout_root, entry);
        if incremental {
            if installed_matches(&dest, entry) {
                return Ok(MatSummary { kept: true, ..Default::default() });
            }
            remove_dest(&dest)?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).io_ctx(format!("create {}", parent.display()))?;
        }

        let strategy = self.config.link_strategy;
        let fallbacks = if self.config.file_cas {
            match file_cas::materialize(&self.store, &outcome.key, &dest, strategy, limiter) {
                Ok(stats) => stats.fallbacks.len(),
                Err(_) => {
                    let _ = fs::remove_dir_all(&dest);
                    let narrow = FileLimiter::new((width / 2).max(1));
                    file_cas::materialize(&self.store, &outcome.key, &dest, strategy, &narrow)?
                        .fallbacks
                        .len()
                }
            }
        } else {
            linker::materialize_tree_with_retry(
                &outcome.package_root,
                &dest,
                strategy,
                limiter,
                width,
            )?
            .fallbacks
            .len()
        };
        Ok(MatSummary {
            materialized: true,
            relinked: incremental,
            fallbacks,
            ..Default::default()
        })
    }

    /// WRITE_BIN_SHIMS after the layout is final; `.bin` is rebuilt from
    /// scratch in incremental mode.
    fn bin_stage(
        &self,
        plan: &[Planned],
        node_modules: &Path,
        report: &mut InstallReport,
    ) -> Result<()> {
        if matches!(self.config.bin_links, BinLinksMode::Off) {
            return Ok(());
        }
        if self.config.incremental {
            bins::clean_bin_dir(node_modules)?;
        }
        let packages: Vec<(String, PathBuf)> = plan
            .iter()
            .filter(|p| !matches!(p, Planned::Skip { .. }))
            .map(|p| {
                let entry = p.entry();
                (entry.rel_path.clone(), dest_path(node_modules, entry))
            })
            .collect();
        let bin_report = bins::link_bins(node_modules, &packages)?;
        report.bin_links = bin_report.created;
        Ok(())
    }

    fn deprecation_stage(&self, plan: &[Planned], node_modules: &Path, report: &mut InstallReport) {
        for planned in plan {
            if matches!(planned, Planned::Skip { .. }) {
                continue;
            }
            let entry = planned.entry();
            let dest = dest_path(node_modules, entry);
            if let Some(meta) = read_installed_meta(&dest) {
                if let Some(notice) = meta.deprecated {
                    report
                        .warnings
                        .push(format!("{}: deprecated: {notice}", entry.rel_path));
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct MatSummary {
    kept: bool,
    relinked: bool,
    materialized: bool,
    workspace_link: bool,
    fallbacks: usize,
}

/// Destination under a layout root for an entry's `node_modules/<rest>`.
fn dest_path(layout_root: &Path, entry: &InstallEntry) -> PathBuf {
    let mut dest = layout_root.to_path_buf();
    for seg in entry.dest_segments() {
        dest.push(seg);
    }
    dest
}

#[derive(Debug, Deserialize)]
struct InstalledMeta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    deprecated: Option<String>,
}

fn read_installed_meta(dir: &Path) -> Option<InstalledMeta> {
    let data = fs::read_to_string(dir.join("package.json")).ok()?;
    serde_json::from_str(&data).ok()
}

/// Incremental keep check: the installed package.json must agree on both
/// name and version.
fn installed_matches(dest: &Path, entry: &InstallEntry) -> bool {
    let Some(meta) = read_installed_meta(dest) else {
        return false;
    };
    let Some(expected_version) = entry.version.as_deref() else {
        return false;
    };
    meta.name.as_deref() == Some(entry.name.as_str())
        && meta.version.as_deref() == Some(expected_version)
}

fn remove_dest(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() || meta.is_file() => {
            fs::remove_file(dest).io_ctx(format!("remove {}", dest.display()))
        }
        Ok(_) => fs::remove_dir_all(dest).io_ctx(format!("remove {}", dest.display())),
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest)
        .io_ctx(format!("symlink {}", dest.display()))
}

#[cfg(windows)]
fn symlink_dir(target: &Path, dest: &Path) -> Result<()> {
    std::os::windows::fs::symlink_dir(target, dest)
        .io_ctx(format!("symlink {}", dest.display()))
}

fn build_pool(width: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(width)
        .build()
        .map_err(|e| EngineError::io("build worker pool", std::io::Error::other(e)))
}

fn run_rebuild(project_root: &Path, argv: &[String]) -> RebuildOutcome {
    let Some((program, args)) = argv.split_first() else {
        return RebuildOutcome { ok: false, status: None, detail: Some("empty rebuild argv".into()) };
    };
    match Command::new(program).args(args).current_dir(project_root).status() {
        Ok(status) => RebuildOutcome {
            ok: status.success(),
            status: status.code(),
            detail: if status.success() { None } else { Some(format!("exit {status}")) },
        },
        Err(e) => RebuildOutcome { ok: false, status: None, detail: Some(e.to_string()) },
    }
}
