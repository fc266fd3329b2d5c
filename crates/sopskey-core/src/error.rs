//! Error type shared by every sopskey crate.

use std::path::PathBuf;
use thiserror::Error;

pub type SopskeyResult<T> = Result<T, SopskeyError>;

/// Coarse classification used by operator surfaces to pick exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Generation,
    KeygenUnavailable,
    Io,
    Config,
}

impl ErrorKind {
    /// Process exit status reported for this kind of failure.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Validation => 2,
            ErrorKind::Generation => 3,
            ErrorKind::Conflict => 4,
            ErrorKind::Io => 5,
            ErrorKind::Config => 6,
            ErrorKind::KeygenUnavailable => 127,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Generation => "key generation error",
            ErrorKind::KeygenUnavailable => "key generation error",
            ErrorKind::Io => "i/o error",
            ErrorKind::Config => "configuration error",
        }
    }
}

#[derive(Debug, Error)]
pub enum SopskeyError {
    #[error("invalid key input: {0}")]
    Validation(String),

    #[error("a key file already exists at {} (pass --force to replace it or --append to add another identity)", path.display())]
    Conflict { path: PathBuf },

    #[error("age-keygen failed: {0}")]
    Generation(String),

    #[error("age-keygen is required but was not found ({0}); install age from https://github.com/FiloSottile/age")]
    KeygenUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SopskeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SopskeyError::Validation(_) => ErrorKind::Validation,
            SopskeyError::Conflict { .. } => ErrorKind::Conflict,
            SopskeyError::Generation(_) => ErrorKind::Generation,
            SopskeyError::KeygenUnavailable(_) => ErrorKind::KeygenUnavailable,
            SopskeyError::Io(_) => ErrorKind::Io,
            SopskeyError::InvalidConfig(_)
            | SopskeyError::Toml(_)
            | SopskeyError::Yaml(_) => ErrorKind::Config,
        }
    }
}
