//! Error types for fragment sessions

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, PhoenixError>;

/// Errors raised while loading, reconciling or reassembling a container
#[derive(Error, Debug)]
pub enum PhoenixError {
    /// Container (or fragment file) missing or unreadable
    #[error("Source unavailable: {path:?}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A format module failed to parse its input
    #[error("Module '{module}' failed to parse {path:?}: {reason}")]
    ModuleParse {
        module: String,
        path: PathBuf,
        reason: String,
    },

    /// Reference count and numbered path count disagree
    #[error(
        "Fragment count changed while numbering ({references} -> {paths}); \
         the module emitted colliding or nested names"
    )]
    NumberingInconsistency { references: usize, paths: usize },

    /// A per-fragment validity check failed
    #[error("Validation of {path:?} failed: {reason}")]
    ValidationFault { path: PathBuf, reason: String },

    /// A fragment stayed locked through every reassembly retry
    #[error("Fragment {path:?} still locked after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: u32 },

    /// Required session setting missing (module, working directory, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Working directory holds files and clearing it was declined
    #[error("Working directory {0:?} is not empty and clearing was declined")]
    WorkingDirectoryNotEmpty(PathBuf),

    /// No module registered under the given name
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Config encode error: {0}")]
    ConfigEncode(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhoenixError {
    /// Wrap an I/O failure on a source path
    pub fn unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PhoenixError::SourceUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Build a parse failure for `module`
    pub fn parse(module: &str, path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PhoenixError::ModuleParse {
            module: module.to_string(),
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error only means the session isn't fully configured yet
    pub fn is_configuration(&self) -> bool {
        matches!(self, PhoenixError::Configuration(_))
    }
}
