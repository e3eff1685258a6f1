use crate::config::LinkStrategy;
use crate::error::{EngineError, IoContext, Result};
use crate::extract::EXTRACT_SENTINEL;
use crate::integrity::Algorithm;
use crate::linker::{self, FileLimiter, Placement};
use crate::paths;
use crate::store::{CasKey, Store};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-package index mapping relative paths to file blobs or symlink
/// targets. Written once, atomically; never mutated.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct PackageManifest {
    #[serde(default)]
    pub files: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ManifestEntry {
    File { hash: String, size: u64, mode: u32 },
    Symlink { target: String },
}

pub fn file_blob_path(store: &Store, hex: &str) -> PathBuf {
    paths::sharded(&store.root().join("files").join("sha256"), hex).join(hex)
}

pub fn manifest_path(store: &Store, pkg_key: &CasKey) -> PathBuf {
    paths::sharded(
        &store.root().join("packages").join(pkg_key.algorithm.name()),
        &pkg_key.hex,
    )
    .join(&pkg_key.hex)
    .join("manifest.json")
}

pub fn has_manifest(store: &Store, pkg_key: &CasKey) -> bool {
    manifest_path(store, pkg_key).is_file()
}

#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    pub files: usize,
    pub new_blobs: usize,
    pub deduped: usize,
    pub symlinks: usize,
}

/// Walk a package root, content-address every file under
/// `files/sha256/aa/bb/<hex>`, and write the package manifest. Idempotent:
/// blob placement is skipped when the hash-named destination already
/// exists, so concurrent ingests of identical content are safe.
pub fn ingest(store: &Store, pkg_key: &CasKey, package_root: &Path) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    let mut files = BTreeMap::new();

    let mut walker: Vec<_> = walkdir::WalkDir::new(package_root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .collect();
    walker.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in walker {
        let path = entry.path();
        if path == package_root {
            continue;
        }
        let rel = path
            .strip_prefix(package_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if rel == EXTRACT_SENTINEL {
            continue;
        }
        // Bundled node_modules never materialize, so they never ingest.
        if rel == "node_modules"
            || rel.starts_with("node_modules/")
            || rel.contains("/node_modules/")
        {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(path)
                .io_ctx(format!("read symlink {}", path.display()))?
                .to_string_lossy()
                .replace('\\', "/");
            files.insert(rel, ManifestEntry::Symlink { target });
            stats.symlinks += 1;
        } else if file_type.is_file() {
            let digest = crate::integrity::hash_file(path, Algorithm::Sha256)?;
            let hash = hex::encode(digest);
            let blob = file_blob_path(store, &hash);
            if blob.is_file() {
                stats.deduped += 1;
            } else {
                if let Some(parent) = blob.parent() {
                    fs::create_dir_all(parent).io_ctx(format!("create {}", parent.display()))?;
                }
                let tmp = store.tmp_path(&hash[..8]);
                fs::copy(path, &tmp).io_ctx(format!("stage blob for {rel}"))?;
                fs::rename(&tmp, &blob).io_ctx(format!("commit blob for {rel}"))?;
                stats.new_blobs += 1;
            }
            let meta = entry
                .metadata()
                .map_err(std::io::Error::from)
                .io_ctx(format!("stat {}", path.display()))?;
            files.insert(
                rel,
                ManifestEntry::File { hash, size: meta.len(), mode: file_mode(&meta) },
            );
            stats.files += 1;
        }
        // Directories are implied by the paths they contain.
    }

    let manifest = PackageManifest { files };
    let out = manifest_path(store, pkg_key);
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).io_ctx(format!("create {}", parent.display()))?;
    }
    let tmp = store.tmp_path("pkg-manifest");
    let data = serde_json::to_vec_pretty(&manifest)
        .map_err(|source| EngineError::Json { path: out.clone(), source })?;
    fs::write(&tmp, data).io_ctx("write package manifest")?;
    fs::rename(&tmp, &out).io_ctx("commit package manifest")?;
    Ok(stats)
}

pub fn load_manifest(store: &Store, pkg_key: &CasKey) -> Result<PackageManifest> {
    let path = manifest_path(store, pkg_key);
    let data = fs::read_to_string(&path)
        .io_ctx(format!("read package manifest {}", path.display()))?;
    serde_json::from_str(&data).map_err(|source| EngineError::Json { path, source })
}

#[derive(Debug, Default)]
pub struct MaterializeStats {
    pub linked: usize,
    pub copied: usize,
    pub fallbacks: Vec<String>,
    pub symlinks: usize,
}

/// Replay a package manifest into `dest`: directories first, then files via
/// the link strategy, then symlinks exactly as recorded.
pub fn materialize(
    store: &Store,
    pkg_key: &CasKey,
    dest: &Path,
    strategy: LinkStrategy,
    limiter: &FileLimiter,
) -> Result<MaterializeStats> {
    let manifest = load_manifest(store, pkg_key)?;
    let mut stats = MaterializeStats::default();

    fs::create_dir_all(dest).io_ctx(format!("create {}", dest.display()))?;
    for rel in manifest.files.keys() {
        if let Some(parent) = Path::new(rel).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(dest.join(parent))
                    .io_ctx(format!("create dirs for {rel}"))?;
            }
        }
    }

    for (rel, entry) in &manifest.files {
        let out = dest.join(rel);
        match entry {
            ManifestEntry::File { hash, mode, .. } => {
                let src = file_blob_path(store, hash);
                let _permit = limiter.acquire();
                match linker::place_file(&src, &out, strategy)? {
                    Placement::Linked => stats.linked += 1,
                    Placement::Copied { fallback } => {
                        stats.copied += 1;
                        if let Some(reason) = fallback {
                            stats.fallbacks.push(format!("{rel}: {reason}"));
                        }
                        set_mode_best_effort(&out, *mode);
                    }
                }
            }
            ManifestEntry::Symlink { target } => {
                let _permit = limiter.acquire();
                linker::replay_symlink(Path::new(target), &out)?;
                stats.symlinks += 1;
            }
        }
    }
    Ok(stats)
}

#[derive(Debug, Default)]
pub struct FileCasGcReport {
    pub removed_files: usize,
    pub kept_files: usize,
}

/// Referenced set is the union of every package manifest's hashes; anything
/// else under `files/sha256` is unreachable and removed.
pub fn gc(store: &Store, dry_run: bool) -> Result<FileCasGcReport> {
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    let packages_root = store.root().join("packages");
    for entry in walkdir::WalkDir::new(&packages_root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy() == "manifest.json"
        {
            let data = fs::read_to_string(entry.path())
                .io_ctx(format!("read {}", entry.path().display()))?;
            let manifest: PackageManifest = serde_json::from_str(&data)
                .map_err(|source| EngineError::Json { path: entry.path().to_path_buf(), source })?;
            for e in manifest.files.values() {
                if let ManifestEntry::File { hash, .. } = e {
                    referenced.insert(hash.clone());
                }
            }
        }
    }

    let mut report = FileCasGcReport::default();
    let files_root = store.root().join("files").join("sha256");
    for entry in walkdir::WalkDir::new(&files_root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if referenced.contains(&name) {
            report.kept_files += 1;
        } else {
            report.removed_files += 1;
            if !dry_run {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Default)]
pub struct FileCasStats {
    pub unique_files: u64,
    pub unique_file_bytes: u64,
    pub package_manifests: u64,
}

pub fn stats(store: &Store) -> Result<FileCasStats> {
    let mut out = FileCasStats::default();
    for entry in walkdir::WalkDir::new(store.root().join("files"))
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            out.unique_files += 1;
            out.unique_file_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    for entry in walkdir::WalkDir::new(store.root().join("packages"))
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy() == "manifest.json"
        {
            out.package_manifests += 1;
        }
    }
    Ok(out)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode_best_effort(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode_best_effort(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(tag: &str) -> CasKey {
        let mut h = Algorithm::Sha512.hasher();
        h.update(tag.as_bytes());
        CasKey { algorithm: Algorithm::Sha512, hex: hex::encode(h.finalize()) }
    }

    fn seed_package(dir: &Path, files: &[(&str, &str)]) {
        for (rel, contents) in files {
            let p = dir.join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, contents).unwrap();
        }
    }

    #[test]
    fn ingest_then_materialize_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let pkg = dir.path().join("pkg");
        seed_package(
            &pkg,
            &[
                ("package.json", r#"{"name":"a","version":"1.0.0"}"#),
                ("lib/index.js", "module.exports = 1;\n"),
            ],
        );

        let key = test_key("a@1.0.0");
        let stats = ingest(&store, &key, &pkg).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.new_blobs, 2);

        let dest = dir.path().join("out");
        let limiter = FileLimiter::new(4);
        let m = materialize(&store, &key, &dest, LinkStrategy::Auto, &limiter).unwrap();
        assert_eq!(m.linked + m.copied, 2);
        assert_eq!(
            fs::read_to_string(dest.join("lib/index.js")).unwrap(),
            "module.exports = 1;\n"
        );
    }

    #[test]
    fn identical_content_across_packages_shares_one_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        seed_package(&a, &[("README.md", "shared readme\n"), ("a.js", "a\n")]);
        seed_package(&b, &[("README.md", "shared readme\n"), ("b.js", "b\n")]);

        let s1 = ingest(&store, &test_key("a"), &a).unwrap();
        let s2 = ingest(&store, &test_key("b"), &b).unwrap();
        assert_eq!(s1.new_blobs, 2);
        assert_eq!(s2.new_blobs, 1);
        assert_eq!(s2.deduped, 1);

        let m1 = load_manifest(&store, &test_key("a")).unwrap();
        let m2 = load_manifest(&store, &test_key("b")).unwrap();
        assert_eq!(m1.files["README.md"], m2.files["README.md"]);
    }

    #[cfg(unix)]
    #[test]
    fn materialized_duplicates_share_an_inode_under_hardlink() {
        use std::os::unix::fs::MetadataExt;
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        seed_package(&a, &[("README.md", "same bytes\n")]);
        seed_package(&b, &[("README.md", "same bytes\n")]);
        ingest(&store, &test_key("a"), &a).unwrap();
        ingest(&store, &test_key("b"), &b).unwrap();

        let limiter = FileLimiter::new(4);
        let out_a = dir.path().join("out/a");
        let out_b = dir.path().join("out/b");
        materialize(&store, &test_key("a"), &out_a, LinkStrategy::Hardlink, &limiter).unwrap();
        materialize(&store, &test_key("b"), &out_b, LinkStrategy::Hardlink, &limiter).unwrap();

        let ino_a = fs::metadata(out_a.join("README.md")).unwrap().ino();
        let ino_b = fs::metadata(out_b.join("README.md")).unwrap().ino();
        assert_eq!(ino_a, ino_b);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recorded_and_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let pkg = dir.path().join("pkg");
        seed_package(&pkg, &[("real.js", "x\n")]);
        std::os::unix::fs::symlink("real.js", pkg.join("alias.js")).unwrap();

        let key = test_key("links");
        ingest(&store, &key, &pkg).unwrap();
        let manifest = load_manifest(&store, &key).unwrap();
        assert_eq!(
            manifest.files["alias.js"],
            ManifestEntry::Symlink { target: "real.js".into() }
        );

        let dest = dir.path().join("out");
        let limiter = FileLimiter::new(4);
        materialize(&store, &key, &dest, LinkStrategy::Auto, &limiter).unwrap();
        assert_eq!(fs::read_link(dest.join("alias.js")).unwrap(), PathBuf::from("real.js"));
    }

    #[test]
    fn gc_drops_unreferenced_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let pkg = dir.path().join("pkg");
        seed_package(&pkg, &[("kept.js", "kept\n")]);
        ingest(&store, &test_key("pkg"), &pkg).unwrap();

        // Plant an orphan blob.
        let orphan_hash = "ff".repeat(32);
        let orphan = file_blob_path(&store, &orphan_hash);
        fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        fs::write(&orphan, b"orphan").unwrap();

        let report = gc(&store, true).unwrap();
        assert_eq!(report.removed_files, 1);
        assert!(orphan.is_file());

        let report = gc(&store, false).unwrap();
        assert_eq!(report.removed_files, 1);
        assert_eq!(report.kept_files, 1);
        assert!(!orphan.exists());
    }
}
