//! Error taxonomy for the runtime core.

use shared::EntityId;
use std::io;
use thiserror::Error;

/// Errors surfaced by the server runtime.
///
/// Would-block I/O never appears here; it is retried on the next tick.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Startup cannot bind a listening endpoint
    #[error("unable to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("record encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{what} not found")]
    NotFound { what: String },

    /// Durable storage refused a record (bad key, unwritable location)
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A session identifier is already claimed by another live object
    #[error("identifier {id} is already registered to another live object")]
    IdentityConflict { id: EntityId },

    #[error("{pool} pool exhausted: {resident} resident, ceiling {ceiling}, nothing evictable")]
    PoolExhausted {
        pool: &'static str,
        resident: usize,
        ceiling: usize,
    },

    #[error("worker failure: {0}")]
    Worker(String),

    #[error("reboot aborted: {0}")]
    Reboot(String),

    /// Replacing the process image returned, which only happens on failure
    #[error("process replacement failed: {0}")]
    RebootExec(io::Error),
}

impl ServerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ServerError::NotFound { what: what.into() }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
