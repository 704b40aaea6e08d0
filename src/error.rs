use std::path::PathBuf;

use thiserror::Error;

/// Main application error type that encompasses all possible failure modes
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Remote(#[from] RemoteError),

    #[error("Connection to {host} failed after {attempts} attempt(s): {source}")]
    Connection {
        host: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status error: {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ledger error: {path} - {details}")]
    Ledger { path: PathBuf, details: String },

    #[error("Archive error: {path} - {details}")]
    Archive { path: PathBuf, details: String },

    #[error("Validation worker error: {details}")]
    Worker { details: String },

    #[error("LibXML2 internal error: {details}")]
    LibXml2Internal { details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },
}

/// A single failure talking to the remote archive.
///
/// Every variant carries the remote target so log lines and propagated errors
/// name what was being listed or fetched.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("{target}: server replied {code} {message}")]
    Reply {
        target: String,
        code: u16,
        message: String,
    },

    #[error("{target}: no entries")]
    NoEntries { target: String },

    #[error("{target}: connection error: {source}")]
    Connection {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{target}: timed out after {seconds}s")]
    Timeout { target: String, seconds: u64 },

    #[error("{target}: protocol error: {details}")]
    Protocol { target: String, details: String },

    #[error("{path}: local write failed: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// Transient failures are retried with backoff; everything else aborts the
    /// operation on the first occurrence.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Reply { code, .. } => (400..500).contains(code),
            RemoteError::Connection { .. }
            | RemoteError::Timeout { .. }
            | RemoteError::Protocol { .. } => true,
            RemoteError::NoEntries { .. } | RemoteError::LocalIo { .. } => false,
        }
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    pub fn is_no_entries(&self) -> bool {
        matches!(self, RemoteError::NoEntries { .. })
    }

    pub fn target(&self) -> String {
        match self {
            RemoteError::Reply { target, .. }
            | RemoteError::NoEntries { target }
            | RemoteError::Connection { target, .. }
            | RemoteError::Timeout { target, .. }
            | RemoteError::Protocol { target, .. } => target.clone(),
            RemoteError::LocalIo { path, .. } => path.display().to_string(),
        }
    }
}

/// LibXML2-specific error types
#[derive(Error, Debug)]
pub enum LibXml2Error {
    #[error("Schema parsing failed: {schema}")]
    SchemaParseFailed { schema: PathBuf },

    #[error("Validation context creation failed")]
    ValidationContextCreationFailed,

    #[error("Cannot open XML reader for {file}")]
    ReaderCreationFailed { file: PathBuf },

    #[error("{message}")]
    DocumentParseFailed { file: PathBuf, message: String },

    #[error("Path is not representable as a C string: {file}")]
    InvalidPath { file: PathBuf },

    #[error("Schema validation internal error {code}: {file}")]
    InternalError { code: i32, file: PathBuf },
}

impl From<LibXml2Error> for MirrorError {
    fn from(err: LibXml2Error) -> Self {
        MirrorError::LibXml2Internal {
            details: err.to_string(),
        }
    }
}

impl From<crate::config::ConfigError> for MirrorError {
    fn from(err: crate::config::ConfigError) -> Self {
        MirrorError::Config(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Remote result type alias
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// LibXML2 result type alias
pub type LibXml2Result<T> = std::result::Result<T, LibXml2Error>;
