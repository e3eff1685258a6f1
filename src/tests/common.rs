use crate::config::InstallConfig;
use crate::installer::Installer;
use crate::integrity::Algorithm;
use crate::store::Store;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Project root + private store inside one tempdir; no environment
/// variables and no network involved.
pub struct Sandbox {
    pub temp: TempDir,
    pub project_root: PathBuf,
    pub store: Store,
}

impl Sandbox {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("create sandbox tempdir");
        let project_root = temp.path().join("project");
        fs::create_dir_all(&project_root).expect("create project dir");
        let store = Store::open(temp.path().join("store")).expect("open store");
        Self { temp, project_root, store }
    }

    pub fn installer(&self, config: InstallConfig) -> Installer {
        Installer::with_store(self.project_root.clone(), config, self.store.clone())
            .expect("build installer")
    }

    pub fn node_modules(&self) -> PathBuf {
        self.project_root.join("node_modules")
    }

    /// Drop a tarball into the project root and return its lockfile fields.
    pub fn add_tarball(&self, file_name: &str, files: &[(&str, &str)]) -> (String, String) {
        let tgz = build_tgz(files);
        let sri = sri_sha512(&tgz);
        fs::write(self.project_root.join(file_name), &tgz).expect("write fixture tarball");
        (format!("file:{file_name}"), sri)
    }

    pub fn write_lockfile(&self, packages: Value) -> PathBuf {
        let lock = json!({
            "name": "sandbox",
            "version": "1.0.0",
            "lockfileVersion": 3,
            "packages": packages,
        });
        let path = self.project_root.join("package-lock.json");
        fs::write(&path, serde_json::to_string_pretty(&lock).unwrap()).expect("write lockfile");
        path
    }
}

pub fn build_tgz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(if path.contains("/bin/") { 0o755 } else { 0o644 });
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .expect("append tar entry");
    }
    let tar_bytes = builder.into_inner().expect("finish tar");
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar_bytes).expect("gzip");
    gz.finish().expect("finish gzip")
}

pub fn sri_sha512(bytes: &[u8]) -> String {
    let mut h = Algorithm::Sha512.hasher();
    h.update(bytes);
    format!("sha512-{}", STANDARD.encode(h.finalize()))
}

pub fn package_json(name: &str, version: &str) -> String {
    json!({"name": name, "version": version, "main": "index.js"}).to_string()
}

/// Standard one-package fixture: `package/{package.json,index.js}`.
pub fn simple_package(sandbox: &Sandbox, name: &str, version: &str) -> (String, String) {
    sandbox.add_tarball(
        &format!("{name}-{version}.tgz"),
        &[
            ("package/package.json", &package_json(name, version)),
            ("package/index.js", "module.exports = 42;\n"),
        ],
    )
}

pub fn lock_entry(version: &str, resolved: &str, integrity: &str) -> Value {
    json!({"version": version, "resolved": resolved, "integrity": integrity})
}

pub fn packages_map(entries: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    map.insert("".into(), json!({"name": "sandbox", "version": "1.0.0"}));
    for (key, value) in entries {
        map.insert((*key).to_string(), value.clone());
    }
    Value::Object(map)
}

pub fn read_to_string(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}
