use crate::error::{IoContext, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// `bin` in package.json is a bare path, a name→path map, or absent;
/// anything else is ignored rather than rejected loudly.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum BinField {
    Single(String),
    Multi(BTreeMap<String, String>),
}

#[derive(Debug, Deserialize)]
struct BinManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    bin: Option<BinField>,
}

#[derive(Debug, Default)]
pub struct BinReport {
    pub created: usize,
    pub skipped: usize,
}

/// Resolve a package's declared bins to `(shim name, path inside package)`
/// pairs. A single-string `bin` takes the unscoped package name.
pub fn bin_entries(pkg_dir: &Path) -> Result<Vec<(String, String)>> {
    let manifest_path = pkg_dir.join("package.json");
    if !manifest_path.is_file() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(&manifest_path)
        .io_ctx(format!("read {}", manifest_path.display()))?;
    let Ok(manifest) = serde_json::from_str::<BinManifest>(&data) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    match manifest.bin {
        Some(BinField::Single(target)) => {
            let name = manifest
                .name
                .as_deref()
                .and_then(|n| n.rsplit('/').next())
                .unwrap_or("")
                .to_string();
            if !name.is_empty() {
                out.push((name, target));
            }
        }
        Some(BinField::Multi(map)) => {
            for (name, target) in map {
                out.push((name, target));
            }
        }
        None => {}
    }
    out.retain(|(name, target)| valid_bin_component(name) && !target.is_empty());
    Ok(out)
}

fn valid_bin_component(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != ".."
}

/// Write shims for every package, in sorted install-path order so colliding
/// bin names resolve first-wins deterministically. `packages` maps the
/// lockfile rel path (`node_modules/<rest>`) to the installed directory.
pub fn link_bins(
    node_modules: &Path,
    packages: &[(String, PathBuf)],
) -> Result<BinReport> {
    let mut report = BinReport::default();
    let bin_dir = node_modules.join(".bin");

    let mut sorted: Vec<&(String, PathBuf)> = packages.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    for (rel_path, pkg_dir) in sorted {
        let entries = bin_entries(pkg_dir)?;
        if entries.is_empty() {
            continue;
        }
        fs::create_dir_all(&bin_dir).io_ctx(format!("create {}", bin_dir.display()))?;
        let segments: Vec<&str> = rel_path
            .trim_start_matches("node_modules/")
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        for (name, target) in entries {
            let target_abs = pkg_dir.join(&target);
            if !target_abs.is_file() {
                report.skipped += 1;
                continue;
            }
            make_executable_best_effort(&target_abs);
            if write_shim(&bin_dir, &name, &segments, &target)? {
                report.created += 1;
            } else {
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

pub fn clean_bin_dir(node_modules: &Path) -> Result<()> {
    let bin_dir = node_modules.join(".bin");
    if bin_dir.exists() {
        fs::remove_dir_all(&bin_dir).io_ctx(format!("clean {}", bin_dir.display()))?;
    }
    Ok(())
}

fn relative_target(segments: &[&str], target: &str) -> PathBuf {
    let mut rel = PathBuf::from("..");
    for seg in segments {
        rel.push(seg);
    }
    for seg in target.split('/').filter(|s| !s.is_empty() && *s != ".") {
        rel.push(seg);
    }
    rel
}

#[cfg(unix)]
fn write_shim(bin_dir: &Path, name: &str, segments: &[&str], target: &str) -> Result<bool> {
    let link_path = bin_dir.join(name);
    if fs::symlink_metadata(&link_path).is_ok() {
        return Ok(false);
    }
    let rel = relative_target(segments, target);
    std::os::unix::fs::symlink(&rel, &link_path)
        .io_ctx(format!("symlink {}", link_path.display()))?;
    Ok(true)
}

#[cfg(windows)]
fn write_shim(bin_dir: &Path, name: &str, segments: &[&str], target: &str) -> Result<bool> {
    let cmd_path = bin_dir.join(format!("{name}.cmd"));
    if cmd_path.exists() {
        return Ok(false);
    }
    let rel = relative_target(segments, target);
    let rel_win = rel.to_string_lossy().replace('/', "\\");
    let stub = format!(
        "@echo off\r\nset \"_prog=%~dp0\\{rel_win}\"\r\nnode \"%_prog%\" %*\r\n"
    );
    fs::write(&cmd_path, stub).io_ctx(format!("write {}", cmd_path.display()))?;
    Ok(true)
}

#[cfg(unix)]
fn make_executable_best_effort(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o111 != 0o111 {
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o111));
        }
    }
}

#[cfg(not(unix))]
fn make_executable_best_effort(_path: &Path) {}
