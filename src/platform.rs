use crate::lockfile::ConstraintList;

/// Runtime platform tokens in Node's vocabulary (`process.platform`,
/// `process.arch`, report libc).
#[derive(Debug, Clone)]
pub struct Runtime {
    pub os: &'static str,
    pub cpu: &'static str,
    /// `None` when the host is not Linux or the probe was inconclusive.
    pub libc: Option<&'static str>,
}

impl Runtime {
    pub fn current() -> Self {
        Self { os: node_platform(), cpu: node_arch(), libc: detect_libc() }
    }
}

#[derive(Debug, Clone)]
pub struct Compat {
    pub ok: bool,
    pub reason: Option<String>,
    /// Set when a libc constraint was evaluated against a heuristic probe;
    /// the orchestrator surfaces this as a warning.
    pub uncertain: bool,
}

impl Compat {
    fn ok() -> Self {
        Self { ok: true, reason: None, uncertain: false }
    }

    fn fail(reason: String) -> Self {
        Self { ok: false, reason: Some(reason), uncertain: false }
    }
}

/// Evaluate an entry's `os`/`cpu`/`libc` constraints against the runtime.
/// Empty lists are universally compatible; a matching `!token` denial
/// fails; a non-empty allow-list requires membership.
pub fn check(
    os: &ConstraintList,
    cpu: &ConstraintList,
    libc: &ConstraintList,
    runtime: &Runtime,
) -> Compat {
    if let Some(reason) = list_rejects("os", os.tokens(), Some(runtime.os)) {
        return Compat::fail(reason);
    }
    if let Some(reason) = list_rejects("cpu", cpu.tokens(), Some(runtime.cpu)) {
        return Compat::fail(reason);
    }
    if !libc.is_empty() {
        if let Some(reason) = list_rejects("libc", libc.tokens(), runtime.libc) {
            return Compat { ok: false, reason: Some(reason), uncertain: true };
        }
        return Compat { ok: true, reason: None, uncertain: true };
    }
    Compat::ok()
}

fn list_rejects(what: &str, tokens: &[String], value: Option<&str>) -> Option<String> {
    if tokens.is_empty() {
        return None;
    }
    let mut has_allow = false;
    let mut allowed = false;
    for token in tokens {
        if let Some(denied) = token.strip_prefix('!') {
            if Some(denied) == value {
                return Some(format!("{what} '{denied}' is denied"));
            }
        } else {
            has_allow = true;
            if Some(token.as_str()) == value {
                allowed = true;
            }
        }
    }
    if has_allow && !allowed {
        let runtime = value.unwrap_or("unknown");
        return Some(format!("{what} '{runtime}' not in [{}]", tokens.join(", ")));
    }
    None
}

pub fn node_platform() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "win32"
    }
    #[cfg(target_os = "macos")]
    {
        "darwin"
    }
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "freebsd")]
    {
        "freebsd"
    }
    #[cfg(target_os = "openbsd")]
    {
        "openbsd"
    }
    #[cfg(target_os = "netbsd")]
    {
        "netbsd"
    }
    #[cfg(target_os = "aix")]
    {
        "aix"
    }
    #[cfg(target_os = "solaris")]
    {
        "sunos"
    }
    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "aix",
        target_os = "solaris"
    )))]
    {
        "linux"
    }
}

pub fn node_arch() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        "x64"
    }
    #[cfg(target_arch = "x86")]
    {
        "ia32"
    }
    #[cfg(target_arch = "arm")]
    {
        "arm"
    }
    #[cfg(target_arch = "aarch64")]
    {
        "arm64"
    }
    #[cfg(target_arch = "powerpc64")]
    {
        "ppc64"
    }
    #[cfg(target_arch = "s390x")]
    {
        "s390x"
    }
    #[cfg(target_arch = "riscv64")]
    {
        "riscv64"
    }
    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "s390x",
        target_arch = "riscv64"
    )))]
    {
        "x64"
    }
}

/// Heuristic: the loaded loader name betrays the libc flavor. Only ever a
/// hint; callers treat the answer as advisory.
#[cfg(target_os = "linux")]
fn detect_libc() -> Option<&'static str> {
    if let Ok(maps) = std::fs::read_to_string("/proc/self/maps") {
        if maps.contains("musl") {
            return Some("musl");
        }
        if maps.contains("libc.so.6") || maps.contains("ld-linux") {
            return Some("glibc");
        }
    }
    if std::path::Path::new("/lib/ld-musl-x86_64.so.1").exists()
        || std::path::Path::new("/lib/ld-musl-aarch64.so.1").exists()
    {
        return Some("musl");
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn detect_libc() -> Option<&'static str> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(tokens: &[&str]) -> ConstraintList {
        ConstraintList::Many(tokens.iter().map(|s| s.to_string()).collect())
    }

    fn runtime() -> Runtime {
        Runtime { os: "linux", cpu: "x64", libc: Some("glibc") }
    }

    #[test]
    fn empty_constraints_are_compatible() {
        let c = check(
            &ConstraintList::Absent,
            &ConstraintList::Absent,
            &ConstraintList::Absent,
            &runtime(),
        );
        assert!(c.ok);
        assert!(!c.uncertain);
    }

    #[test]
    fn allow_list_requires_membership() {
        let c = check(&list(&["darwin"]), &ConstraintList::Absent, &ConstraintList::Absent, &runtime());
        assert!(!c.ok);
        let c = check(
            &list(&["darwin", "linux"]),
            &ConstraintList::Absent,
            &ConstraintList::Absent,
            &runtime(),
        );
        assert!(c.ok);
    }

    #[test]
    fn denial_beats_allow() {
        let c = check(
            &list(&["!linux", "linux"]),
            &ConstraintList::Absent,
            &ConstraintList::Absent,
            &runtime(),
        );
        assert!(!c.ok);
        let c = check(&list(&["!darwin"]), &ConstraintList::Absent, &ConstraintList::Absent, &runtime());
        assert!(c.ok);
    }

    #[test]
    fn cpu_constraints_apply() {
        let c = check(&ConstraintList::Absent, &list(&["arm64"]), &ConstraintList::Absent, &runtime());
        assert!(!c.ok);
        let c = check(&ConstraintList::Absent, &list(&["x64"]), &ConstraintList::Absent, &runtime());
        assert!(c.ok);
    }

    #[test]
    fn libc_is_evaluated_but_marked_uncertain() {
        let c = check(&ConstraintList::Absent, &ConstraintList::Absent, &list(&["musl"]), &runtime());
        assert!(!c.ok);
        assert!(c.uncertain);

        let c = check(&ConstraintList::Absent, &ConstraintList::Absent, &list(&["glibc"]), &runtime());
        assert!(c.ok);
        assert!(c.uncertain);
    }

    #[test]
    fn unknown_libc_fails_allow_list() {
        let rt = Runtime { os: "linux", cpu: "x64", libc: None };
        let c = check(&ConstraintList::Absent, &ConstraintList::Absent, &list(&["musl"]), &rt);
        assert!(!c.ok);
        assert!(c.uncertain);
    }

    #[test]
    fn single_string_constraint() {
        let c = check(
            &ConstraintList::One("linux".into()),
            &ConstraintList::Absent,
            &ConstraintList::Absent,
            &runtime(),
        );
        assert!(c.ok);
    }
}
