use crate::error::{IoContext, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const STAGING_PREFIX: &str = ".betterpm-staging-";
const BACKUP_PREFIX: &str = "node_modules.bak-";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Remove leftovers of crashed full-replace runs: staging dirs that never
/// swapped in, and backups whose removal was interrupted.
pub(crate) fn reclaim_stale(project_root: &Path) -> Result<()> {
    let Ok(read) = fs::read_dir(project_root) else {
        return Ok(());
    };
    for entry in read.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(STAGING_PREFIX) || name.starts_with(BACKUP_PREFIX) {
            fs::remove_dir_all(entry.path())
                .io_ctx(format!("reclaim stale {}", name))?;
        }
    }
    Ok(())
}

pub(crate) fn staging_dir(project_root: &Path) -> PathBuf {
    let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    project_root.join(format!("{STAGING_PREFIX}{}-{n}", std::process::id()))
}

/// Rename the previous tree aside, move staging into place, drop the
/// backup. The install only becomes visible at the second rename; a crash
/// before it leaves the old node_modules untouched.
pub(crate) fn swap_into_place(project_root: &Path, staging: &Path) -> Result<()> {
    let node_modules = project_root.join("node_modules");
    let backup = if node_modules.exists() {
        let ts = time::OffsetDateTime::now_utc().unix_timestamp();
        let backup = project_root.join(format!("{BACKUP_PREFIX}{ts}"));
        fs::rename(&node_modules, &backup)
            .io_ctx(format!("move previous node_modules to {}", backup.display()))?;
        Some(backup)
    } else {
        None
    };
    fs::rename(staging, &node_modules)
        .io_ctx("move staged install into node_modules")?;
    if let Some(backup) = backup {
        fs::remove_dir_all(&backup)
            .io_ctx(format!("remove backup {}", backup.display()))?;
    }
    Ok(())
}

/// Top-level names the install plan wants. Scoped packages map the `@scope`
/// directory to the set of expected children; plain packages map to an
/// empty set.
pub(crate) type DesiredTree = BTreeMap<String, BTreeSet<String>>;

pub(crate) fn desired_tree<'a>(segment_lists: impl Iterator<Item = Vec<&'a str>>) -> DesiredTree {
    let mut desired: DesiredTree = BTreeMap::new();
    for segments in segment_lists {
        match segments.as_slice() {
            [top] => {
                desired.entry((*top).to_string()).or_default();
            }
            [scope, child, ..] => {
                desired
                    .entry((*scope).to_string())
                    .or_default()
                    .insert((*child).to_string());
            }
            [] => {}
        }
    }
    desired
}

/// Incremental cleanup: delete top-level entries (and scoped children) that
/// the plan does not want. `.bin` is handled separately by the bin linker.
pub(crate) fn remove_extraneous(node_modules: &Path, desired: &DesiredTree) -> Result<usize> {
    let mut removed = 0;
    let Ok(read) = fs::read_dir(node_modules) else {
        return Ok(0);
    };
    for entry in read.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".bin" {
            continue;
        }
        match desired.get(&name) {
            None => {
                remove_any(&entry.path())?;
                removed += 1;
            }
            Some(children) if name.starts_with('@') && !children.is_empty() => {
                let Ok(scoped) = fs::read_dir(entry.path()) else {
                    continue;
                };
                for child in scoped.filter_map(|e| e.ok()) {
                    let child_name = child.file_name().to_string_lossy().into_owned();
                    if !children.contains(&child_name) {
                        remove_any(&child.path())?;
                        removed += 1;
                    }
                }
            }
            Some(_) => {}
        }
    }
    Ok(removed)
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .io_ctx(format!("stat {}", path.display()))?;
    if meta.file_type().is_symlink() || meta.is_file() {
        fs::remove_file(path).io_ctx(format!("remove {}", path.display()))
    } else {
        fs::remove_dir_all(path).io_ctx(format!("remove {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_replaces_and_drops_backup() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        fs::create_dir_all(root.join("node_modules/old-pkg")).unwrap();
        let staging = staging_dir(root);
        fs::create_dir_all(staging.join("new-pkg")).unwrap();

        swap_into_place(root, &staging).unwrap();
        assert!(root.join("node_modules/new-pkg").is_dir());
        assert!(!root.join("node_modules/old-pkg").exists());
        let leftovers: Vec<_> = fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(BACKUP_PREFIX) || n.starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }

    #[test]
    fn reclaim_removes_stale_dirs() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        fs::create_dir_all(root.join(".betterpm-staging-1234-0/pkg")).unwrap();
        fs::create_dir_all(root.join("node_modules.bak-99/pkg")).unwrap();
        fs::create_dir_all(root.join("node_modules/real")).unwrap();

        reclaim_stale(root).unwrap();
        assert!(!root.join(".betterpm-staging-1234-0").exists());
        assert!(!root.join("node_modules.bak-99").exists());
        assert!(root.join("node_modules/real").is_dir());
    }

    #[test]
    fn extraneous_top_level_and_scoped_entries_are_removed() {
        let td = tempfile::tempdir().unwrap();
        let nm = td.path().join("node_modules");
        fs::create_dir_all(nm.join("keep")).unwrap();
        fs::create_dir_all(nm.join("drop")).unwrap();
        fs::create_dir_all(nm.join("@scope/keep-child")).unwrap();
        fs::create_dir_all(nm.join("@scope/drop-child")).unwrap();
        fs::create_dir_all(nm.join(".bin")).unwrap();

        let desired = desired_tree(
            [vec!["keep"], vec!["@scope", "keep-child"]].into_iter(),
        );
        let removed = remove_extraneous(&nm, &desired).unwrap();
        assert_eq!(removed, 2);
        assert!(nm.join("keep").is_dir());
        assert!(nm.join("@scope/keep-child").is_dir());
        assert!(!nm.join("drop").exists());
        assert!(!nm.join("@scope/drop-child").exists());
        assert!(nm.join(".bin").is_dir());
    }
}
