use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FS_CONCURRENCY: usize = 16;
pub const DEFAULT_GC_MAX_AGE: Duration = Duration::from_secs(30 * 86_400);

/// How strictly lockfile integrity is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Missing or failed integrity aborts the install.
    #[default]
    Required,
    /// Missing integrity warns; a failed check still aborts.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStrategy {
    /// Hardlink files, fall back to copy; replay symlinks.
    #[default]
    Auto,
    Hardlink,
    Copy,
}

#[derive(Debug, Clone, Default)]
pub enum ScriptsMode {
    /// Invoke the given argv in the project root after the layout is final.
    Rebuild(Vec<String>),
    #[default]
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinLinksMode {
    /// Shims for root-scoped packages only.
    #[default]
    RootOnly,
    Off,
}

#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub verify: VerifyMode,
    pub link_strategy: LinkStrategy,
    pub scripts: ScriptsMode,
    pub bin_links: BinLinksMode,
    /// Incremental reconcile of the live node_modules instead of staging +
    /// atomic swap.
    pub incremental: bool,
    pub fs_concurrency: usize,
    pub gc_max_age: Duration,
    /// Explicit store root; overrides platform cache resolution.
    pub store_root: Option<PathBuf>,
    /// Populate the file-level CAS and materialize from its manifests.
    pub file_cas: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            verify: VerifyMode::Required,
            link_strategy: LinkStrategy::Auto,
            scripts: ScriptsMode::Off,
            bin_links: BinLinksMode::RootOnly,
            incremental: false,
            fs_concurrency: DEFAULT_FS_CONCURRENCY,
            gc_max_age: DEFAULT_GC_MAX_AGE,
            store_root: None,
            file_cas: true,
        }
    }
}

impl InstallConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.fs_concurrency.max(1)
    }
}
