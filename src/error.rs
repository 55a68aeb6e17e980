//! Engine Error Types

use thiserror::Error;

use crate::ir::Path;

/// Errors surfaced by compilation, execution and storage.
#[derive(Error, Debug)]
pub enum Error {
    /// Structural compile error, keyed by query and offending target
    #[error("compile error in query '{query}' at '{target}': {message}")]
    Compile {
        query: String,
        target: String,
        message: String,
    },

    /// Unresolved type variable after unification
    #[error("compile error in query '{query}': type variable '{var}' could not be resolved")]
    UnresolvedTypeVar { query: String, var: String },

    /// Edge type mismatch detected by the graph invariant checker
    #[error("type mismatch on edge {src} -> {dst} [port {port}]: {src_type} != {dst_type}")]
    TypeMismatch {
        src: Path,
        dst: Path,
        port: u8,
        src_type: String,
        dst_type: String,
    },

    /// Duplicate (operator kind, path) vertex identifier
    #[error("duplicate vertex identifier: {kind} at {path}")]
    DuplicateVertex { kind: String, path: Path },

    /// Runtime assertion failure (undeclared index, make_scalar arity, ...)
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Value decoding failure (truncated bytes, no matching union alternative)
    #[error("decode error: {0}")]
    Decode(String),

    /// SQLite storage error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL storage error
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    /// Configuration loading error
    #[error("config error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Cross-process frontier polling gave up
    #[error("no changes committed from frontier {frontier} on table '{table}'")]
    FrontierTimeout { table: String, frontier: i64 },

    /// `integrate_til_zero` failed to converge within the iteration cap
    #[error("fixpoint did not converge within {cap} iterations at {path}")]
    FixpointOverflow { path: Path, cap: usize },
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a runtime assertion failure.
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }
}
