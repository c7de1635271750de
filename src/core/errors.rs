// src/core/errors.rs

//! Defines the primary error type for the runtime.

use thiserror::Error;

/// The main error enum, representing all failures that can abort startup or
/// reject a request. Transient I/O is handled locally by the actors and never
/// surfaces through this type.
#[derive(Error, Debug)]
pub enum KontrolError {
    #[error("missing environment variable ${0}")]
    MissingEnv(String),

    #[error("invalid value for ${0}: {1}")]
    InvalidEnv(String, String),

    #[error("invalid $KONTROL_MODE token '{0}'")]
    InvalidMode(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("actor '{0}' is not running in this mode")]
    ActorUnavailable(&'static str),
}
