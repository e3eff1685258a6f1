use betterpm::error::EngineError;
use betterpm::lockfile;

#[test]
fn lockfile_load_classifies_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("package-lock.json");
    std::fs::write(
        &path,
        r#"{
  "name": "demo",
  "version": "0.1.0",
  "lockfileVersion": 3,
  "packages": {
    "": {"name": "demo", "version": "0.1.0"},
    "node_modules/foo": {
      "version": "1.0.0",
      "resolved": "https://registry.npmjs.org/foo/-/foo-1.0.0.tgz",
      "integrity": "sha512-AAAA"
    },
    "packages/lib": {"name": "lib", "version": "0.0.1"},
    "node_modules/lib": {"resolved": "packages/lib", "link": true}
  }
}"#,
    )
    .unwrap();

    let lock = lockfile::load(&path).unwrap();
    assert_eq!(lock.version, 3);
    assert_eq!(lock.entries.len(), 2);
    assert!(lock.workspaces.contains_key("lib"));
}

#[test]
fn lockfile_v1_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("package-lock.json");
    std::fs::write(&path, r#"{"lockfileVersion": 1, "packages": {}}"#).unwrap();
    let err = lockfile::load(&path).unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedLockfile { found: 1 }));
}
