//! Error types shared across the foreman crates.

/// Errors that can occur across the foreman runtime.
///
/// Each variant corresponds to a different subsystem: durable store,
/// configuration, request validation, agent identity, or transport.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// SQLite store read/write failure.
    #[error("store error: {0}")]
    Store(String),

    /// A command id that already exists was submitted again.
    #[error("duplicate command id: {0}")]
    DuplicateId(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed client submission or agent report.
    #[error("validation error: {0}")]
    Validation(String),

    /// Agent identity file read/write failure.
    #[error("identity error: {0}")]
    Identity(String),

    /// Agent-to-server transport failure (after retries, where applicable).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected a result report for a command this agent does
    /// not own or that is no longer running.
    #[error("conflict: {0}")]
    Conflict(String),
}
