use thiserror::Error;

/// Fatal errors. Anything recoverable is collected as a
/// [`Diagnostic`](crate::diagnostics::Diagnostic) instead.
#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (unknown ground truth, bad threshold, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),
    /// A referenced source id is not configured.
    #[error("unknown source: {0}")]
    UnknownSource(String),
    /// A configured source file is missing or not parseable at all.
    #[error("source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },
    /// Fewer than two usable datasets; comparison is undefined.
    #[error("at least 2 usable sources are required, found {usable}")]
    InsufficientSources { usable: usize },
    /// Writing a report artifact failed.
    #[error("cannot write {path}: {reason}")]
    Write { path: String, reason: String },
    /// IO error (file read, etc.).
    #[error("IO error: {0}")]
    Io(String),
}

impl ReconError {
    pub(crate) fn unavailable(source_id: &str, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}
