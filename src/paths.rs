use sha2::{Digest, Sha256};
use std::env;
use std::path::{Path, PathBuf};

const TOOL_DIR: &str = "betterpm";

/// Resolve the process-shared store root.
///
/// Precedence: explicit override, then `XDG_CACHE_HOME`, then the platform
/// cache directory. Paths below the root are derived purely from hex digests.
pub fn store_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Some(xdg) = env::var_os("XDG_CACHE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join(TOOL_DIR);
        }
    }
    platform_cache_root()
}

#[cfg(target_os = "macos")]
fn platform_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library")
        .join("Caches")
        .join(TOOL_DIR)
}

#[cfg(windows)]
fn platform_cache_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(TOOL_DIR)
        .join("cache")
}

#[cfg(not(any(target_os = "macos", windows)))]
fn platform_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join(TOOL_DIR)
}

/// Two-level hex shard (`aa/bb`) used for every content-addressed path.
pub fn shard(hex: &str) -> (&str, &str) {
    let a = &hex[..2.min(hex.len())];
    let b = if hex.len() >= 4 { &hex[2..4] } else { "00" };
    (a, b)
}

pub fn sharded(base: &Path, hex: &str) -> PathBuf {
    let (a, b) = shard(hex);
    base.join(a).join(b)
}

/// Stable identifier for a project root, used only for refcount
/// observability in the store manifest.
pub fn project_id(project_root: &Path) -> String {
    let canonical = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}
