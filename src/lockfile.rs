use crate::error::{EngineError, IoContext, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One value of the lockfile `packages` map, as found on disk.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawPackage {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub resolved: Option<String>,
    #[serde(default)]
    pub integrity: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub link: bool,
    #[serde(default)]
    pub os: ConstraintList,
    #[serde(default)]
    pub cpu: ConstraintList,
    #[serde(default)]
    pub libc: ConstraintList,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// npm writes constraint lists as arrays but single strings occur in the
/// wild; both deserialize to the same thing.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(untagged)]
pub enum ConstraintList {
    #[default]
    Absent,
    One(String),
    Many(Vec<String>),
}

impl ConstraintList {
    pub fn tokens(&self) -> &[String] {
        match self {
            ConstraintList::Absent => &[],
            ConstraintList::One(s) => std::slice::from_ref(s),
            ConstraintList::Many(v) => v,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawLockfile {
    #[serde(rename = "lockfileVersion")]
    lockfile_version: Option<i64>,
    #[serde(default)]
    packages: Option<BTreeMap<String, RawPackage>>,
}

/// One lockfile record that targets a concrete `node_modules/…` destination.
#[derive(Debug, Clone)]
pub struct InstallEntry {
    /// Forward-slash path as written in the lockfile (`node_modules/<rest>`).
    pub rel_path: String,
    pub name: String,
    pub version: Option<String>,
    pub resolved: Option<String>,
    pub integrity: Option<String>,
    pub optional: bool,
    pub link: bool,
    pub os: ConstraintList,
    pub cpu: ConstraintList,
    pub libc: ConstraintList,
    pub dependencies: BTreeMap<String, String>,
}

impl InstallEntry {
    /// Path segments under `node_modules/` (e.g. `["@scope", "pkg"]`).
    pub fn dest_segments(&self) -> Vec<&str> {
        self.rel_path
            .trim_start_matches("node_modules/")
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePackage {
    pub name: String,
    pub rel_path: String,
    pub version: Option<String>,
}

#[derive(Debug)]
pub struct Lockfile {
    pub version: u32,
    /// Install entries in lexicographic `rel_path` order.
    pub entries: Vec<InstallEntry>,
    /// Workspace packages indexed by name.
    pub workspaces: BTreeMap<String, WorkspacePackage>,
}

pub fn load(path: &Path) -> Result<Lockfile> {
    let data = fs::read_to_string(path).io_ctx(format!("read lockfile {}", path.display()))?;
    parse_str(&data, path)
}

pub fn parse_str(data: &str, origin: &Path) -> Result<Lockfile> {
    let raw: RawLockfile = serde_json::from_str(data)
        .map_err(|source| EngineError::Json { path: origin.to_path_buf(), source })?;
    from_raw(raw)
}

fn from_raw(raw: RawLockfile) -> Result<Lockfile> {
    let version = raw.lockfile_version.unwrap_or(0);
    if version != 2 && version != 3 {
        return Err(EngineError::UnsupportedLockfile { found: version });
    }
    let Some(packages) = raw.packages else {
        return Err(EngineError::LockfileMissingPackages);
    };

    let mut entries = Vec::new();
    let mut workspaces = BTreeMap::new();
    for (key, pkg) in packages {
        if key.is_empty() {
            continue;
        }
        if let Some(rest) = key.strip_prefix("node_modules/") {
            // A second node_modules segment means a hoisting layout this
            // engine does not produce or consume.
            if rest.split('/').any(|seg| seg == "node_modules") {
                return Err(EngineError::UnsupportedLayout { key });
            }
            let name = pkg.name.clone().unwrap_or_else(|| rest.to_string());
            entries.push(InstallEntry {
                rel_path: key,
                name,
                version: pkg.version,
                resolved: pkg.resolved,
                integrity: pkg.integrity,
                optional: pkg.optional,
                link: pkg.link,
                os: pkg.os,
                cpu: pkg.cpu,
                libc: pkg.libc,
                dependencies: pkg.dependencies,
            });
        } else {
            if key.split('/').any(|seg| seg == "node_modules") {
                return Err(EngineError::UnsupportedLayout { key });
            }
            let name = pkg
                .name
                .clone()
                .unwrap_or_else(|| key.rsplit('/').next().unwrap_or(&key).to_string());
            workspaces.insert(
                name.clone(),
                WorkspacePackage { name, rel_path: key, version: pkg.version },
            );
        }
    }

    Ok(Lockfile { version: version as u32, entries, workspaces })
}
