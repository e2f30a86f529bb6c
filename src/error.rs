use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum UploadError {
    #[error("config file not found: {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("{endpoint} returned status {status}: {message}")]
    RemoteStatus {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("unexpected response from {endpoint}: {message}")]
    RemotePayload { endpoint: String, message: String },

    #[error("upload quota exceeded for remote run {0}")]
    QuotaExceeded(String),

    #[error("unsupported API version {remote} (supported {supported})")]
    UnsupportedApi { remote: String, supported: String },

    #[error("run database error: {0}")]
    Store(String),

    #[error("run table schema mismatch in read-only database {0}")]
    SchemaMismatch(String),

    #[error("run database is read-only")]
    ReadOnly,

    #[error("run mapping already exists for local run {0}")]
    DuplicateRun(String),

    #[error("no run mapping for local run {0}")]
    RunNotFound(String),

    #[error("file was still finalizing after {attempts} polls")]
    FinalizeTimeout { attempts: u32 },

    #[error("instrument API unavailable: {0}")]
    Instrument(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("file watcher error: {0}")]
    Watch(String),

    #[error("upload queue is closed")]
    QueueClosed,
}
