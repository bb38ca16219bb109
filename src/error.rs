//! Error types for the Turnstile library.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// A denied acquisition is not an error: it is an ordinary [`Lease`] with
/// `granted = false`. Errors here cover misconfiguration and lookup
/// failures only.
///
/// [`Lease`]: crate::limit::Lease
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid policy parameters, surfaced at construction
    #[error("configuration error: {0}")]
    Config(String),

    /// A decision was requested for a policy name that was never registered
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    /// I/O errors while loading configuration files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
