use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure classification for the install engine. Fatality is decided by the
/// orchestrator; callees only report what happened.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported lockfile version {found} (expected 2 or 3)")]
    UnsupportedLockfile { found: i64 },

    #[error("lockfile has no packages map")]
    LockfileMissingPackages,

    #[error("nested node_modules layout is not supported: {key}")]
    UnsupportedLayout { key: String },

    #[error("workspace link '{name}' cannot be resolved: {reason}")]
    WorkspaceResolutionFailed { name: String, reason: String },

    #[error("no usable integrity for {context}")]
    IntegrityMissing { context: String },

    #[error("integrity mismatch for {context}: expected {algorithm}-{expected}, got {algorithm}-{actual}")]
    IntegrityMismatch {
        context: String,
        algorithm: &'static str,
        expected: String,
        actual: String,
    },

    #[error("fetch {url} failed: {kind}")]
    Fetch { url: String, kind: FetchKind },

    #[error("extraction of {context} failed: {reason}")]
    Extraction { context: String, reason: String },

    #[error("package '{entry}' is not supported on this platform: {reason}")]
    PlatformUnsupported { entry: String, reason: String },

    #[error("install cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub enum FetchKind {
    Status(u16),
    Transport(String),
    UnsupportedScheme(String),
    MissingLocalFile(PathBuf),
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchKind::Status(code) => write!(f, "status {code}"),
            FetchKind::Transport(msg) => write!(f, "{msg}"),
            FetchKind::UnsupportedScheme(scheme) => write!(f, "unsupported scheme '{scheme}'"),
            FetchKind::MissingLocalFile(p) => write!(f, "local file {} not found", p.display()),
        }
    }
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io { context: context.into(), source }
    }

    /// Attach the failing install entry to an error bubbling out of a pool.
    pub fn for_entry(self, rel_path: &str) -> Self {
        match self {
            EngineError::Io { context, source } => EngineError::Io {
                context: format!("{rel_path}: {context}"),
                source,
            },
            other => other,
        }
    }
}

/// Convenience for the common "io error at path" case.
pub trait IoContext<T> {
    fn io_ctx(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_ctx(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| EngineError::io(context, e))
    }
}
