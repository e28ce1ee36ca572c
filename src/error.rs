use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EpiError {
    #[error("unrecognized file header: {0}")]
    UnknownFormat(String),

    #[error("cannot read input {path}: {message}")]
    InputRead { path: String, message: String },

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("invalid entity level: {0}")]
    InvalidLevel(String),

    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),

    #[error("missing config file epitrend.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("download failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("illegal file operation transition: {0}")]
    InvalidTransition(String),

    #[error("worker channel closed: {0}")]
    Worker(String),
}

impl EpiError {
    pub fn is_fatal_format(&self) -> bool {
        matches!(
            self,
            EpiError::UnknownFormat(_) | EpiError::InputRead { .. }
        )
    }
}
