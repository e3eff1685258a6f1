use crate::config::VerifyMode;
use crate::error::{EngineError, FetchKind, IoContext, Result};
use crate::extract;
use crate::integrity::{self, Algorithm, IntegrityDigest};
use crate::store::{CasKey, Store};
use base64::{engine::general_purpose::STANDARD, Engine};
use once_cell::sync::Lazy;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(8)
        .user_agent("betterpm/0.1.0 (+https://github.com/betterpm/betterpm)")
        .build()
        .expect("http client")
});

/// How a package's tarball and unpacked tree were obtained this run.
#[derive(Debug)]
pub struct FetchOutcome {
    pub key: CasKey,
    pub downloaded: bool,
    pub copied_local: bool,
    pub reused_tarball: bool,
    pub extracted: bool,
    pub reused_unpacked: bool,
    pub package_root: PathBuf,
    pub warnings: Vec<String>,
}

/// Make sure the tarball for an install entry is present, verified, and
/// unpacked in the store. Per entry the order is strict: fetch → verify →
/// commit → extract; the verified marker is only written after the rename
/// and a matching hash, the extraction sentinel only after a clean unpack.
pub fn ensure_package(
    store: &Store,
    rel_path: &str,
    url: &str,
    integrity: Option<&str>,
    verify: VerifyMode,
    base_dir: &Path,
) -> Result<FetchOutcome> {
    let mut warnings = Vec::new();
    let digests = integrity::parse(integrity.unwrap_or(""));
    let expected = integrity::preferred(&digests).cloned();
    if expected.is_none() {
        match verify {
            VerifyMode::Required => {
                return Err(EngineError::IntegrityMissing { context: rel_path.to_string() })
            }
            VerifyMode::BestEffort => warnings.push(format!(
                "{rel_path}: no usable integrity in lockfile; trusting fetched content"
            )),
        }
    }

    if let Some(expected) = &expected {
        let key = CasKey::from_digest(expected);
        if store.has_tarball(&key) && store.is_verified(&key) {
            let _ = store.touch_blob(&key);
            return finish_from_store(store, rel_path, key, false, false, true, warnings);
        }
    }

    if let Some(local) = local_path(url) {
        ensure_from_file(store, rel_path, url, &local, expected, base_dir, warnings)
    } else if url.starts_with("http://") || url.starts_with("https://") {
        ensure_from_http(store, rel_path, url, expected, warnings)
    } else {
        let scheme = url.split(':').next().unwrap_or("").to_string();
        Err(EngineError::Fetch {
            url: url.to_string(),
            kind: FetchKind::UnsupportedScheme(scheme),
        })
    }
}

/// One streaming pass: every chunk feeds the running hash, the temp file in
/// the store, and the in-memory buffer later handed to the extractor.
fn ensure_from_http(
    store: &Store,
    rel_path: &str,
    url: &str,
    expected: Option<IntegrityDigest>,
    warnings: Vec<String>,
) -> Result<FetchOutcome> {
    let mut resp = CLIENT.get(url).send().map_err(|e| EngineError::Fetch {
        url: url.to_string(),
        kind: FetchKind::Transport(e.to_string()),
    })?;
    if !resp.status().is_success() {
        return Err(EngineError::Fetch {
            url: url.to_string(),
            kind: FetchKind::Status(resp.status().as_u16()),
        });
    }

    let algorithm = expected.as_ref().map(|d| d.algorithm).unwrap_or(Algorithm::Sha512);
    let mut hasher = algorithm.hasher();
    let tmp = store.tmp_path("fetch");
    let mut tmp_file = File::create(&tmp).io_ctx(format!("create {}", tmp.display()))?;
    let mut compressed = Vec::with_capacity(resp.content_length().unwrap_or(0) as usize);
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = resp.read(&mut chunk).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            EngineError::Fetch { url: url.to_string(), kind: FetchKind::Transport(e.to_string()) }
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        tmp_file
            .write_all(&chunk[..n])
            .io_ctx(format!("write {}", tmp.display()))?;
        compressed.extend_from_slice(&chunk[..n]);
    }
    drop(tmp_file);

    let actual = hasher.finalize();
    let key = match &expected {
        Some(expected) => {
            if !integrity::constant_time_eq(&actual, expected.raw()) {
                let _ = fs::remove_file(&tmp);
                return Err(EngineError::IntegrityMismatch {
                    context: rel_path.to_string(),
                    algorithm: algorithm.name(),
                    expected: expected.base64.clone(),
                    actual: STANDARD.encode(&actual),
                });
            }
            CasKey::from_digest(expected)
        }
        None => CasKey { algorithm, hex: hex::encode(&actual) },
    };

    store.commit_tarball(&key, &tmp)?;
    store.mark_verified(&key)?;

    let unpacked = store.unpacked_path(&key);
    let outcome = extract::extract_tgz_bytes(&compressed, &unpacked)?;
    finish(store, rel_path, key, true, false, false, !outcome.reused, outcome.reused, warnings)
}

fn ensure_from_file(
    store: &Store,
    rel_path: &str,
    url: &str,
    local: &Path,
    expected: Option<IntegrityDigest>,
    base_dir: &Path,
    mut warnings: Vec<String>,
) -> Result<FetchOutcome> {
    let src = if local.is_absolute() { local.to_path_buf() } else { base_dir.join(local) };
    if !src.is_file() {
        return Err(EngineError::Fetch {
            url: url.to_string(),
            kind: FetchKind::MissingLocalFile(src),
        });
    }

    let key = match &expected {
        Some(expected) => {
            let actual = integrity::hash_file(&src, expected.algorithm)?;
            if !integrity::constant_time_eq(&actual, expected.raw()) {
                return Err(EngineError::IntegrityMismatch {
                    context: rel_path.to_string(),
                    algorithm: expected.algorithm.name(),
                    expected: expected.base64.clone(),
                    actual: STANDARD.encode(&actual),
                });
            }
            CasKey::from_digest(expected)
        }
        None => {
            let actual = integrity::hash_file(&src, Algorithm::Sha512)?;
            warnings.push(format!("{rel_path}: stored under computed sha512"));
            CasKey { algorithm: Algorithm::Sha512, hex: hex::encode(&actual) }
        }
    };

    store.write_tarball(&key, &src)?;
    store.mark_verified(&key)?;
    let unpacked = store.unpacked_path(&key);
    let outcome = extract::extract_tgz_path(&store.tarball_path(&key), &unpacked)?;
    finish(store, rel_path, key, false, true, false, !outcome.reused, outcome.reused, warnings)
}

fn finish_from_store(
    store: &Store,
    rel_path: &str,
    key: CasKey,
    downloaded: bool,
    copied_local: bool,
    reused_tarball: bool,
    warnings: Vec<String>,
) -> Result<FetchOutcome> {
    let unpacked = store.unpacked_path(&key);
    if extract::can_reuse(&unpacked) {
        return finish(store, rel_path, key, downloaded, copied_local, reused_tarball, false, true, warnings);
    }
    // Verified tarball, stale or missing unpack: self-heal by re-extracting.
    let outcome = extract::extract_tgz_path(&store.tarball_path(&key), &unpacked)?;
    finish(
        store,
        rel_path,
        key,
        downloaded,
        copied_local,
        reused_tarball,
        !outcome.reused,
        outcome.reused,
        warnings,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish(
    store: &Store,
    rel_path: &str,
    key: CasKey,
    downloaded: bool,
    copied_local: bool,
    reused_tarball: bool,
    extracted: bool,
    reused_unpacked: bool,
    warnings: Vec<String>,
) -> Result<FetchOutcome> {
    let unpacked = store.unpacked_path(&key);
    let package_root = extract::detect_package_root(&unpacked).ok_or_else(|| {
        EngineError::Extraction {
            context: rel_path.to_string(),
            reason: format!("no package.json under {}", unpacked.display()),
        }
    })?;
    Ok(FetchOutcome {
        key,
        downloaded,
        copied_local,
        reused_tarball,
        extracted,
        reused_unpacked,
        package_root,
        warnings,
    })
}

/// `file:` URLs (with or without the `//` authority) resolve to local
/// paths; anything else is handled by the HTTP client.
fn local_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://").or_else(|| url.strip_prefix("file:"))?;
    Some(PathBuf::from(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::Algorithm;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;

    fn build_tgz(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, contents.as_bytes()).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap()
    }

    fn sri_of(bytes: &[u8]) -> String {
        let mut h = Algorithm::Sha512.hasher();
        h.update(bytes);
        format!("sha512-{}", STANDARD.encode(h.finalize()))
    }

    fn fixture(dir: &Path) -> (PathBuf, String) {
        let tgz = build_tgz(&[
            ("package/package.json", r#"{"name":"foo","version":"1.0.0"}"#),
            ("package/index.js", "module.exports = 42;\n"),
        ]);
        let path = dir.join("foo-1.0.0.tgz");
        fs::write(&path, &tgz).unwrap();
        let sri = sri_of(&tgz);
        (path, sri)
    }

    #[test]
    fn file_url_copies_verifies_and_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let (_tgz, sri) = fixture(dir.path());

        let outcome = ensure_package(
            &store,
            "node_modules/foo",
            "file:foo-1.0.0.tgz",
            Some(&sri),
            VerifyMode::Required,
            dir.path(),
        )
        .unwrap();
        assert!(outcome.copied_local);
        assert!(!outcome.downloaded);
        assert!(outcome.extracted);
        assert!(store.has_tarball(&outcome.key));
        assert!(store.is_verified(&outcome.key));
        assert!(outcome.package_root.join("index.js").is_file());
    }

    #[test]
    fn second_run_reuses_tarball_and_unpacked() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let (_tgz, sri) = fixture(dir.path());

        let first = ensure_package(
            &store,
            "node_modules/foo",
            "file:foo-1.0.0.tgz",
            Some(&sri),
            VerifyMode::Required,
            dir.path(),
        )
        .unwrap();
        assert!(first.extracted);

        let second = ensure_package(
            &store,
            "node_modules/foo",
            "file:foo-1.0.0.tgz",
            Some(&sri),
            VerifyMode::Required,
            dir.path(),
        )
        .unwrap();
        assert!(second.reused_tarball);
        assert!(second.reused_unpacked);
        assert!(!second.extracted);
        assert!(!second.copied_local);
    }

    #[test]
    fn integrity_mismatch_aborts_without_verified_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let (_tgz, sri) = fixture(dir.path());
        // Flip one base64 character.
        let mut bad = sri.clone();
        let idx = 10;
        let replacement = if bad.as_bytes()[idx] == b'A' { 'B' } else { 'A' };
        bad.replace_range(idx..idx + 1, &replacement.to_string());

        let err = ensure_package(
            &store,
            "node_modules/foo",
            "file:foo-1.0.0.tgz",
            Some(&bad),
            VerifyMode::Required,
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::IntegrityMismatch { .. }));

        let digests = integrity::parse(&bad);
        let key = CasKey::from_digest(&digests[0]);
        assert!(!store.is_verified(&key));
    }

    #[test]
    fn missing_integrity_respects_verify_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let (_tgz, _sri) = fixture(dir.path());

        let err = ensure_package(
            &store,
            "node_modules/foo",
            "file:foo-1.0.0.tgz",
            None,
            VerifyMode::Required,
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::IntegrityMissing { .. }));

        let outcome = ensure_package(
            &store,
            "node_modules/foo",
            "file:foo-1.0.0.tgz",
            None,
            VerifyMode::BestEffort,
            dir.path(),
        )
        .unwrap();
        assert!(!outcome.warnings.is_empty());
        assert!(store.has_tarball(&outcome.key));
    }

    #[test]
    fn unsupported_scheme_is_a_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let err = ensure_package(
            &store,
            "node_modules/foo",
            "git+ssh://example.com/repo.git",
            Some("sha512-AAAA"),
            VerifyMode::Required,
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Fetch { kind: FetchKind::UnsupportedScheme(_), .. }
        ));
    }

    #[test]
    fn missing_local_file_is_a_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        let err = ensure_package(
            &store,
            "node_modules/foo",
            "file:not-there.tgz",
            Some("sha512-AAAA"),
            VerifyMode::Required,
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Fetch { kind: FetchKind::MissingLocalFile(_), .. }
        ));
    }
}
