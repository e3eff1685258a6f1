use crate::config::LinkStrategy;
use crate::error::{IoContext, Result};
use crate::extract::EXTRACT_SENTINEL;
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::path::Path;

/// Counting semaphore bounding concurrent file operations across all
/// materializing packages. Directory recursion never holds a permit, so a
/// package task can always make progress on traversal.
pub struct FileLimiter {
    permits: Mutex<usize>,
    available: Condvar,
}

impl FileLimiter {
    pub fn new(width: usize) -> Self {
        Self { permits: Mutex::new(width.max(1)), available: Condvar::new() }
    }

    pub fn acquire(&self) -> FilePermit<'_> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
        FilePermit { limiter: self }
    }
}

pub struct FilePermit<'a> {
    limiter: &'a FileLimiter,
}

impl Drop for FilePermit<'_> {
    fn drop(&mut self) {
        let mut permits = self.limiter.permits.lock();
        *permits += 1;
        self.limiter.available.notify_one();
    }
}

#[derive(Debug)]
pub enum Placement {
    Linked,
    Copied { fallback: Option<String> },
}

/// Put one file at `dest` according to the strategy. `hardlink` and `auto`
/// try `link(2)` and recover with a copy on the errnos that mean "links
/// won't work here" rather than "the operation is broken".
pub fn place_file(src: &Path, dest: &Path, strategy: LinkStrategy) -> Result<Placement> {
    if matches!(strategy, LinkStrategy::Copy) {
        fs::copy(src, dest).io_ctx(format!("copy to {}", dest.display()))?;
        return Ok(Placement::Copied { fallback: None });
    }
    match fs::hard_link(src, dest) {
        Ok(()) => Ok(Placement::Linked),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(dest);
            match fs::hard_link(src, dest) {
                Ok(()) => Ok(Placement::Linked),
                Err(e2) if link_fallback_errno(&e2).is_some() => {
                    fs::copy(src, dest).io_ctx(format!("copy to {}", dest.display()))?;
                    Ok(Placement::Copied { fallback: link_fallback_errno(&e2) })
                }
                Err(e2) => Err(crate::error::EngineError::io(
                    format!("link to {}", dest.display()),
                    e2,
                )),
            }
        }
        Err(e) => match link_fallback_errno(&e) {
            Some(reason) => {
                fs::copy(src, dest).io_ctx(format!("copy to {}", dest.display()))?;
                Ok(Placement::Copied { fallback: Some(reason) })
            }
            None => Err(crate::error::EngineError::io(
                format!("link to {}", dest.display()),
                e,
            )),
        },
    }
}

fn link_fallback_errno(e: &std::io::Error) -> Option<String> {
    match e.raw_os_error() {
        Some(1) => Some("EPERM".into()),
        Some(18) => Some("EXDEV".into()),
        Some(28) => Some("ENOSPC".into()),
        Some(31) => Some("EMLINK".into()),
        _ => None,
    }
}

#[cfg(unix)]
pub fn replay_symlink(target: &Path, dest: &Path) -> Result<()> {
    let _ = fs::remove_file(dest);
    std::os::unix::fs::symlink(target, dest)
        .io_ctx(format!("symlink {}", dest.display()))
}

#[cfg(windows)]
pub fn replay_symlink(target: &Path, dest: &Path) -> Result<()> {
    let _ = fs::remove_file(dest);
    std::os::windows::fs::symlink_file(target, dest)
        .io_ctx(format!("symlink {}", dest.display()))
}

#[derive(Debug, Default)]
pub struct TreeStats {
    pub linked: usize,
    pub copied: usize,
    pub fallbacks: Vec<String>,
    pub symlinks: usize,
}

impl TreeStats {
    fn absorb(&mut self, other: TreeStats) {
        self.linked += other.linked;
        self.copied += other.copied;
        self.fallbacks.extend(other.fallbacks);
        self.symlinks += other.symlinks;
    }
}

/// Materialize a package root directly from its unpacked tree (the non
/// file-CAS path). Entries are visited in sorted order; nested
/// `node_modules` directories and the extraction sentinel are skipped.
pub fn materialize_tree(
    src_root: &Path,
    dest: &Path,
    strategy: LinkStrategy,
    limiter: &FileLimiter,
) -> Result<TreeStats> {
    fs::create_dir_all(dest).io_ctx(format!("create {}", dest.display()))?;
    let mut entries: Vec<_> = fs::read_dir(src_root)
        .io_ctx(format!("read {}", src_root.display()))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut stats = TreeStats::default();
    for entry in entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str == EXTRACT_SENTINEL {
            continue;
        }
        let src = entry.path();
        let out = dest.join(&name);
        let file_type = entry
            .file_type()
            .io_ctx(format!("stat {}", src.display()))?;
        if file_type.is_symlink() {
            let target = fs::read_link(&src).io_ctx(format!("read link {}", src.display()))?;
            let _permit = limiter.acquire();
            replay_symlink(&target, &out)?;
            stats.symlinks += 1;
        } else if file_type.is_dir() {
            if name_str == "node_modules" {
                continue;
            }
            stats.absorb(materialize_tree(&src, &out, strategy, limiter)?);
        } else {
            let _permit = limiter.acquire();
            match place_file(&src, &out, strategy)? {
                Placement::Linked => stats.linked += 1,
                Placement::Copied { fallback } => {
                    stats.copied += 1;
                    if let Some(reason) = fallback {
                        stats.fallbacks.push(format!("{}: {reason}", out.display()));
                    }
                }
            }
        }
    }
    Ok(stats)
}

/// One retry at half concurrency after clearing the destination; transient
/// pool-wide failures (fd exhaustion, ENOSPC races) get a second chance.
pub fn materialize_tree_with_retry(
    src_root: &Path,
    dest: &Path,
    strategy: LinkStrategy,
    limiter: &FileLimiter,
    width: usize,
) -> Result<TreeStats> {
    match materialize_tree(src_root, dest, strategy, limiter) {
        Ok(stats) => Ok(stats),
        Err(_first) => {
            let _ = fs::remove_dir_all(dest);
            let narrow = FileLimiter::new((width / 2).max(1));
            materialize_tree(src_root, dest, strategy, &narrow)
        }
    }
}
