use std::path::PathBuf;

use crate::Digest;

/// error type for devport operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("root directory not found: {0}")]
    RootNotFound(PathBuf),

    #[error("manifest file not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("cache miss: no manifest published for lookup key {key}")]
    CacheMiss { key: String },

    #[error("object not found: {0}")]
    ObjectNotFound(Digest),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("invalid lookup key: {0:?}")]
    InvalidLookupKey(String),

    #[error("refusing unsafe manifest path: {0}")]
    UnsafePath(String),

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("legacy manifest entries are not under root directory {0}")]
    LegacyManifestRoot(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(#[source] serde_json::Error),

    #[error("failed to serialize manifest: {0}")]
    ManifestSerialize(#[source] serde_json::Error),

    #[error("error walking {path}: {message}")]
    Walk { path: PathBuf, message: String },

    #[error("current directory is not a git repository")]
    NotGitRepo,

    #[error("git error: {0}")]
    Git(String),

    #[error("remote store returned {status} for {key}: {message}")]
    Remote {
        status: u16,
        key: String,
        message: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid store endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid config value for {key}: {message}")]
    ConfigValue { key: String, message: String },

    #[error("invalid native pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// true for conditions that mean "the thing you asked for was never published"
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Error::CacheMiss { .. } | Error::ManifestNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
