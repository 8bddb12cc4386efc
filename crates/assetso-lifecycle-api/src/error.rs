use assetso_lifecycle_core::{CleanSummary, CoreError, EngineError, EngineKind, RestoreSummary};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("checksum mismatch: metadata says {expected}, archive dump hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("partial restore: table {table} failed ({reason}); earlier tables were kept")]
    PartialRestore { table: String, reason: EngineError, summary: Box<RestoreSummary> },
    #[error("restore failed at table {table} ({reason}); all changes were rolled back")]
    RestoreFailed { table: String, reason: EngineError, summary: Box<RestoreSummary> },
    #[error("clean failed at table {table} ({reason})")]
    CleanFailed { table: String, reason: EngineError, summary: Box<CleanSummary> },
    #[error("file i/o error at {path}: {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{engine} engine error: {source}")]
    Engine {
        engine: EngineKind,
        #[source]
        source: EngineError,
    },
    #[error("archive error: {0}")]
    Archive(String),
    #[error("schema migration failed: {0}")]
    Migration(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("all engines failed after {attempts} attempt(s); last error: {last}")]
    AllEnginesFailed { attempts: usize, last: Box<LifecycleError> },
}

impl LifecycleError {
    pub fn file_io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileIo { path: path.into(), source }
    }

    #[must_use]
    pub fn engine(engine: EngineKind, source: EngineError) -> Self {
        Self::Engine { engine, source }
    }

    /// Whether the selector may move on to the next engine after this error.
    ///
    /// A clean that was rolled back left the store untouched, so it counts; one that was aborted
    /// on a non-transactional engine already changed data and does not.
    #[must_use]
    pub fn is_engine_failure(&self) -> bool {
        match self {
            Self::Engine { .. } => true,
            Self::CleanFailed { summary, .. } => {
                summary.status == assetso_lifecycle_core::CleanStatus::RolledBack
            }
            _ => false,
        }
    }

    /// Counts obtained before a failed restore, if this error carries them.
    #[must_use]
    pub fn restore_summary(&self) -> Option<&RestoreSummary> {
        match self {
            Self::PartialRestore { summary, .. } | Self::RestoreFailed { summary, .. } => {
                Some(summary)
            }
            Self::AllEnginesFailed { last, .. } => last.restore_summary(),
            _ => None,
        }
    }

    #[must_use]
    pub fn clean_summary(&self) -> Option<&CleanSummary> {
        match self {
            Self::CleanFailed { summary, .. } => Some(summary),
            Self::AllEnginesFailed { last, .. } => last.clean_summary(),
            _ => None,
        }
    }
}

impl From<CoreError> for LifecycleError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
            CoreError::Validation(message) => Self::Validation(message),
            CoreError::Catalog(message) => Self::Configuration(message),
        }
    }
}

impl From<zip::result::ZipError> for LifecycleError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}
