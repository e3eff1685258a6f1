use crate::error::{EngineError, IoContext, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};

/// Written into an unpacked tree only after extraction completed without
/// error; its presence plus a detectable package root allows reuse.
pub const EXTRACT_SENTINEL: &str = ".better_extracted";

#[derive(Debug, Clone, Copy)]
pub struct ExtractOutcome {
    pub reused: bool,
}

/// Gunzip a `.tgz` on disk (buffered; npm tarballs are small) and extract.
pub fn extract_tgz_path(tgz: &Path, dest: &Path) -> Result<ExtractOutcome> {
    if can_reuse(dest) {
        return Ok(ExtractOutcome { reused: true });
    }
    let compressed = fs::read(tgz).io_ctx(format!("read tarball {}", tgz.display()))?;
    extract_tgz_bytes(&compressed, dest)
}

pub fn extract_tgz_bytes(compressed: &[u8], dest: &Path) -> Result<ExtractOutcome> {
    if can_reuse(dest) {
        return Ok(ExtractOutcome { reused: true });
    }
    let mut tar_bytes = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut tar_bytes)
        .map_err(|e| extraction_err(dest, format!("gunzip: {e}")))?;
    extract_tar(&tar_bytes, dest)
}

/// Extract a decompressed tar buffer into `dest`, replacing whatever was
/// there. USTAR/PAX/GNU long names, octal and base-256 numerics, and the
/// metadata-record overrides are handled by the archive reader; this loop
/// owns sanitization and on-disk placement.
pub fn extract_tar(tar_bytes: &[u8], dest: &Path) -> Result<ExtractOutcome> {
    if can_reuse(dest) {
        return Ok(ExtractOutcome { reused: true });
    }
    if dest.exists() {
        fs::remove_dir_all(dest).io_ctx(format!("clear {}", dest.display()))?;
    }
    fs::create_dir_all(dest).io_ctx(format!("create {}", dest.display()))?;

    let mut archive = Archive::new(tar_bytes);
    archive.set_ignore_zeros(true);
    let entries = archive
        .entries()
        .map_err(|e| extraction_err(dest, format!("tar entries: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extraction_err(dest, format!("tar entry: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| extraction_err(dest, format!("entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let Some(rel) = sanitize_entry_path(&raw_path) else {
            continue;
        };
        let out_path = dest.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out_path).io_ctx(format!("mkdir {}", out_path.display()))?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| extraction_err(dest, format!("link name: {e}")))?
                    .map(|c| c.into_owned());
                let Some(target) = target else { continue };
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent).io_ctx(format!("mkdir {}", parent.display()))?;
                }
                replay_symlink(&target, &out_path)?;
            }
            EntryType::Regular | EntryType::GNUSparse | EntryType::Continuous => {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent).io_ctx(format!("mkdir {}", parent.display()))?;
                }
                let mut file = File::create(&out_path)
                    .io_ctx(format!("create {}", out_path.display()))?;
                std::io::copy(&mut entry, &mut file)
                    .map_err(|e| extraction_err(dest, format!("write {}: {e}", rel.display())))?;
                set_mode_best_effort(&out_path, entry.header().mode().unwrap_or(0o644));
            }
            // Hard links, fifos, char/block devices have no place in a
            // package tree; metadata records never reach this loop.
            _ => {}
        }
    }

    fs::write(dest.join(EXTRACT_SENTINEL), b"")
        .io_ctx(format!("write sentinel in {}", dest.display()))?;
    Ok(ExtractOutcome { reused: false })
}

/// Backslashes become slashes, leading slashes are stripped, and any path
/// with a `..` segment is silently discarded.
pub fn sanitize_entry_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let mut out = PathBuf::new();
    for seg in trimmed.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return None,
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// A tree is reusable when a prior extraction finished (sentinel present)
/// and the package root is still detectable. A sentinel whose package root
/// vanished is stale state from an interrupted run and is not trusted.
pub fn can_reuse(dest: &Path) -> bool {
    dest.join(EXTRACT_SENTINEL).exists() && detect_package_root(dest).is_some()
}

/// Find the directory holding `package.json`: `package/` from a registry
/// tarball, the tree itself, or a single top-level directory (tarballs
/// rooted at `<name>-<version>/`).
pub fn detect_package_root(dir: &Path) -> Option<PathBuf> {
    let package = dir.join("package");
    if package.join("package.json").is_file() {
        return Some(package);
    }
    if dir.join("package.json").is_file() {
        return Some(dir.to_path_buf());
    }
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    if subdirs.len() == 1 && subdirs[0].join("package.json").is_file() {
        return Some(subdirs.remove(0));
    }
    None
}

#[cfg(unix)]
fn replay_symlink(target: &Path, out_path: &Path) -> Result<()> {
    let _ = fs::remove_file(out_path);
    std::os::unix::fs::symlink(target, out_path)
        .io_ctx(format!("symlink {}", out_path.display()))
}

#[cfg(windows)]
fn replay_symlink(target: &Path, out_path: &Path) -> Result<()> {
    let _ = fs::remove_file(out_path);
    std::os::windows::fs::symlink_file(target, out_path)
        .io_ctx(format!("symlink {}", out_path.display()))
}

#[cfg(unix)]
fn set_mode_best_effort(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn set_mode_best_effort(_path: &Path, _mode: u32) {}

fn extraction_err(dest: &Path, reason: String) -> EngineError {
    EngineError::Extraction { context: dest.display().to_string(), reason }
}
