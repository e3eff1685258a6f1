use crate::error::{EngineError, IoContext, Result};
use crate::integrity::{Algorithm, IntegrityDigest};
use crate::paths;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub mod file_cas;

const MANIFEST_NAME: &str = "manifest.json";
const LOCK_NAME: &str = ".lock";
const MANIFEST_VERSION: u32 = 1;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies one tarball blob: the algorithm and lowercase hex of the
/// digest that names every path under the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CasKey {
    pub algorithm: Algorithm,
    pub hex: String,
}

impl CasKey {
    pub fn from_digest(digest: &IntegrityDigest) -> Self {
        Self { algorithm: digest.algorithm, hex: digest.hex() }
    }
}

/// Process-shared content-addressed store of tarballs and their unpacked
/// trees. All publication is temp-file + rename; readers see either the
/// previous state or the complete artifact.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("tmp"))
            .io_ctx(format!("create store at {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tarball_path(&self, key: &CasKey) -> PathBuf {
        paths::sharded(&self.root.join("tarballs").join(key.algorithm.name()), &key.hex)
            .join(format!("{}.tgz", key.hex))
    }

    fn verified_path(&self, key: &CasKey) -> PathBuf {
        paths::sharded(&self.root.join("tarballs").join(key.algorithm.name()), &key.hex)
            .join(format!("{}.tgz.verified", key.hex))
    }

    pub fn unpacked_path(&self, key: &CasKey) -> PathBuf {
        paths::sharded(&self.root.join("unpacked").join(key.algorithm.name()), &key.hex)
            .join(&key.hex)
    }

    pub fn ensure_dirs(&self, key: &CasKey) -> Result<()> {
        for p in [self.tarball_path(key), self.unpacked_path(key)] {
            if let Some(parent) = p.parent() {
                fs::create_dir_all(parent).io_ctx(format!("create {}", parent.display()))?;
            }
        }
        Ok(())
    }

    /// Unique scratch path inside the store; same filesystem as the final
    /// location so the finishing rename is atomic.
    pub fn tmp_path(&self, hint: &str) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("{hint}-{}-{n}.part", std::process::id()))
    }

    pub fn has_tarball(&self, key: &CasKey) -> bool {
        self.tarball_path(key).is_file()
    }

    /// Copy a local file into the store under `key` (used for `file:`
    /// sources; HTTP fetches stream into a tmp path and commit instead).
    pub fn write_tarball(&self, key: &CasKey, src: &Path) -> Result<()> {
        self.ensure_dirs(key)?;
        let tmp = self.tmp_path(&key.hex[..8.min(key.hex.len())]);
        fs::copy(src, &tmp)
            .io_ctx(format!("copy {} into store", src.display()))?;
        self.commit_tarball(key, &tmp)
    }

    /// Rename a fully written tmp file into its final CAS location. The
    /// rename is the linearization point.
    pub fn commit_tarball(&self, key: &CasKey, tmp: &Path) -> Result<()> {
        self.ensure_dirs(key)?;
        let final_path = self.tarball_path(key);
        fs::rename(tmp, &final_path)
            .io_ctx(format!("commit tarball {}", final_path.display()))?;
        self.register_blob(key)?;
        Ok(())
    }

    /// A verified marker is only trusted while its tarball exists; orphaned
    /// markers from interrupted runs are deleted on sight.
    pub fn is_verified(&self, key: &CasKey) -> bool {
        let marker = self.verified_path(key);
        if !marker.is_file() {
            return false;
        }
        if !self.has_tarball(key) {
            let _ = fs::remove_file(&marker);
            return false;
        }
        true
    }

    pub fn mark_verified(&self, key: &CasKey) -> Result<()> {
        if !self.has_tarball(key) {
            return Err(EngineError::Extraction {
                context: key.hex.clone(),
                reason: "cannot mark a missing tarball verified".into(),
            });
        }
        fs::write(self.verified_path(key), b"").io_ctx("write verified marker")
    }

    // ---- refcount manifest ----------------------------------------------

    pub fn inc_ref(&self, key: &CasKey, project_id: &str) -> Result<()> {
        self.with_manifest(|m| {
            let rc = m.ref_counts.entry(key.hex.clone()).or_default();
            if !rc.projects.contains_key(project_id) {
                rc.count += 1;
            }
            rc.projects.insert(project_id.to_string(), now_rfc3339());
        })
    }

    pub fn dec_ref(&self, key: &CasKey, project_id: &str) -> Result<()> {
        self.with_manifest(|m| {
            if let Some(rc) = m.ref_counts.get_mut(&key.hex) {
                if rc.projects.remove(project_id).is_some() {
                    rc.count = rc.count.saturating_sub(1);
                }
            }
        })
    }

    pub fn inventory(&self) -> Result<StoreManifest> {
        self.locked(|| self.read_manifest())
    }

    fn register_blob(&self, key: &CasKey) -> Result<()> {
        self.with_manifest(|m| {
            m.blobs.entry(key.hex.clone()).or_insert_with(|| BlobRecord {
                algorithm: key.algorithm.name().to_string(),
                hex: key.hex.clone(),
                added_at: now_rfc3339(),
                last_accessed_at: now_rfc3339(),
            });
        })
    }

    pub fn touch_blob(&self, key: &CasKey) -> Result<()> {
        self.with_manifest(|m| {
            if let Some(b) = m.blobs.get_mut(&key.hex) {
                b.last_accessed_at = now_rfc3339();
            }
        })
    }

    /// Read-modify-rename under the store-root advisory lock. Refcounts are
    /// observational; GC tolerates drift from lost races elsewhere.
    fn with_manifest<F: FnOnce(&mut StoreManifest)>(&self, mutate: F) -> Result<()> {
        self.locked(|| {
            let mut manifest = self.read_manifest()?;
            mutate(&mut manifest);
            self.write_manifest(&manifest)
        })
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_path = self.root.join(LOCK_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .io_ctx(format!("open store lock {}", lock_path.display()))?;
        lock_file.lock_exclusive().io_ctx("acquire store lock")?;
        let out = f();
        let _ = fs2::FileExt::unlock(&lock_file);
        out
    }

    fn read_manifest(&self) -> Result<StoreManifest> {
        let path = self.root.join(MANIFEST_NAME);
        if !path.is_file() {
            return Ok(StoreManifest::default());
        }
        let data = fs::read_to_string(&path).io_ctx("read store manifest")?;
        serde_json::from_str(&data).map_err(|source| EngineError::Json { path, source })
    }

    fn write_manifest(&self, manifest: &StoreManifest) -> Result<()> {
        let tmp = self.tmp_path("manifest");
        let data = serde_json::to_vec_pretty(manifest)
            .map_err(|source| EngineError::Json { path: self.root.join(MANIFEST_NAME), source })?;
        fs::write(&tmp, data).io_ctx("write store manifest")?;
        fs::rename(&tmp, self.root.join(MANIFEST_NAME)).io_ctx("commit store manifest")
    }

    // ---- garbage collection ----------------------------------------------

    /// Remove blobs past `max_age` with a zero refcount, together with their
    /// unpacked trees and verified markers.
    pub fn gc(&self, max_age: Duration, dry_run: bool) -> Result<GcReport> {
        let mut report = GcReport::default();
        self.locked(|| {
            let mut manifest = self.read_manifest()?;
            let now = OffsetDateTime::now_utc();
            let mut doomed = Vec::new();
            for (hex, blob) in &manifest.blobs {
                let age_ok = OffsetDateTime::parse(&blob.added_at, &Rfc3339)
                    .map(|added| (now - added).whole_seconds() >= max_age.as_secs() as i64)
                    .unwrap_or(true);
                let unreferenced = manifest
                    .ref_counts
                    .get(hex)
                    .map(|rc| rc.count == 0)
                    .unwrap_or(true);
                if age_ok && unreferenced {
                    doomed.push((hex.clone(), blob.algorithm.clone()));
                }
            }
            for (hex, algorithm) in doomed {
                report.removed_blobs += 1;
                if dry_run {
                    report.would_remove.push(hex);
                    continue;
                }
                let key = CasKey {
                    algorithm: match algorithm.as_str() {
                        "sha256" => Algorithm::Sha256,
                        "sha384" => Algorithm::Sha384,
                        _ => Algorithm::Sha512,
                    },
                    hex: hex.clone(),
                };
                let _ = fs::remove_file(self.tarball_path(&key));
                let _ = fs::remove_file(self.verified_path(&key));
                let _ = fs::remove_dir_all(self.unpacked_path(&key));
                manifest.blobs.remove(&hex);
                manifest.ref_counts.remove(&hex);
            }
            if !dry_run {
                self.write_manifest(&manifest)?;
            }
            Ok(())
        })?;
        Ok(report)
    }

    // ---- read-only stats (consumed by cache subcommands) ------------------

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for entry in walkdir::WalkDir::new(self.root.join("tarballs"))
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file()
                && entry.path().extension().map(|e| e == "tgz").unwrap_or(false)
            {
                stats.tarballs += 1;
                stats.tarball_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        let file_stats = file_cas::stats(self)?;
        stats.unique_files = file_stats.unique_files;
        stats.unique_file_bytes = file_stats.unique_file_bytes;
        stats.package_manifests = file_stats.package_manifests;
        Ok(stats)
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::from(SystemTime::now())
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Bookkeeping document at the store root (spec'd camelCase shape).
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct StoreManifest {
    #[serde(default = "manifest_version")]
    pub version: u32,
    #[serde(default)]
    pub blobs: BTreeMap<String, BlobRecord>,
    #[serde(default, rename = "refCounts")]
    pub ref_counts: BTreeMap<String, RefCount>,
}

fn manifest_version() -> u32 {
    MANIFEST_VERSION
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BlobRecord {
    pub algorithm: String,
    pub hex: String,
    #[serde(rename = "addedAt")]
    pub added_at: String,
    #[serde(rename = "lastAccessedAt")]
    pub last_accessed_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RefCount {
    pub count: u64,
    #[serde(default)]
    pub projects: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub removed_blobs: usize,
    pub would_remove: Vec<String>,
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub tarballs: u64,
    pub tarball_bytes: u64,
    pub unique_files: u64,
    pub unique_file_bytes: u64,
    pub package_manifests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity;

    fn key_for(content: &[u8]) -> CasKey {
        let mut h = Algorithm::Sha512.hasher();
        h.update(content);
        CasKey { algorithm: Algorithm::Sha512, hex: hex::encode(h.finalize()) }
    }

    fn store_with_blob(content: &[u8]) -> (tempfile::TempDir, Store, CasKey) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let src = dir.path().join("src.tgz");
        fs::write(&src, content).unwrap();
        let key = key_for(content);
        store.write_tarball(&key, &src).unwrap();
        (dir, store, key)
    }

    #[test]
    fn write_tarball_lands_at_sharded_path() {
        let (_dir, store, key) = store_with_blob(b"tarball bytes");
        let path = store.tarball_path(&key);
        assert!(path.is_file());
        let rel = path.strip_prefix(store.root()).unwrap();
        let comps: Vec<_> = rel.iter().map(|c| c.to_string_lossy().into_owned()).collect();
        assert_eq!(comps[0], "tarballs");
        assert_eq!(comps[1], "sha512");
        assert_eq!(comps[2], &key.hex[..2]);
        assert_eq!(comps[3], &key.hex[2..4]);
    }

    #[test]
    fn verified_marker_requires_tarball() {
        let (_dir, store, key) = store_with_blob(b"content");
        assert!(!store.is_verified(&key));
        store.mark_verified(&key).unwrap();
        assert!(store.is_verified(&key));

        // Orphaned marker self-heals.
        fs::remove_file(store.tarball_path(&key)).unwrap();
        assert!(!store.is_verified(&key));
        assert!(!store.is_verified(&key));
    }

    #[test]
    fn refcounts_track_projects_once() {
        let (_dir, store, key) = store_with_blob(b"content");
        store.inc_ref(&key, "proj-a").unwrap();
        store.inc_ref(&key, "proj-a").unwrap();
        store.inc_ref(&key, "proj-b").unwrap();
        let m = store.inventory().unwrap();
        assert_eq!(m.ref_counts[&key.hex].count, 2);

        store.dec_ref(&key, "proj-a").unwrap();
        store.dec_ref(&key, "missing").unwrap();
        let m = store.inventory().unwrap();
        assert_eq!(m.ref_counts[&key.hex].count, 1);
    }

    #[test]
    fn gc_removes_only_unreferenced_old_blobs() {
        let (_dir, store, key) = store_with_blob(b"old blob");

        // Referenced blob survives even at zero age threshold.
        store.inc_ref(&key, "proj").unwrap();
        let report = store.gc(Duration::ZERO, false).unwrap();
        assert_eq!(report.removed_blobs, 0);
        assert!(store.has_tarball(&key));

        // Unreferenced + old enough: removed along with markers.
        store.dec_ref(&key, "proj").unwrap();
        store.mark_verified(&key).unwrap();
        let report = store.gc(Duration::ZERO, false).unwrap();
        assert_eq!(report.removed_blobs, 1);
        assert!(!store.has_tarball(&key));
        assert!(store.inventory().unwrap().blobs.is_empty());
    }

    #[test]
    fn gc_dry_run_touches_nothing() {
        let (_dir, store, key) = store_with_blob(b"blob");
        let report = store.gc(Duration::ZERO, true).unwrap();
        assert_eq!(report.removed_blobs, 1);
        assert_eq!(report.would_remove, vec![key.hex.clone()]);
        assert!(store.has_tarball(&key));
    }

    #[test]
    fn cas_key_hex_matches_integrity_digest() {
        let digests = integrity::parse(
            "sha512-z4PhNX7vuL3xVChQ1m2AB9Yg5AULVxXcg/SpIdNs6c5H0NE8XYXysP+DGNKHfuwvY7kxvUdBeoGlODJ6+SfaPg==",
        );
        let key = CasKey::from_digest(&digests[0]);
        assert_eq!(key.hex.len(), 128);
        assert_eq!(key.algorithm, Algorithm::Sha512);
    }
}
