//! Error types for rustcache

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::codec::DecodeError;

/// Result type alias for rustcache operations
pub type Result<T> = std::result::Result<T, RustCacheError>;

/// Custom error types for rustcache
#[derive(Error, Debug)]
pub enum RustCacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("address host:port are invalid")]
    InvalidAddress,

    #[error("invalid configured port {0}")]
    InvalidPort(u16),

    #[error("unsupported network {0:?}, only tcp is available")]
    UnsupportedNetwork(String),

    #[error("connection pool size must be positive")]
    InvalidPoolSize,

    #[error("parameters cannot be empty on request")]
    EmptyParameter,

    #[error("client was not initialized")]
    ClientUninitialized,

    #[error("timed out dialing {addr} for {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("timed out reading response after {0:?}")]
    ReadTimeout(Duration),

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("request aborted during client shutdown")]
    RequestAborted,

    #[error("key {0} not set")]
    KeyNotSet(String),

    /// Error reported by the server (or a worker on behalf of the whole
    /// batch) through the `-` sentinel on the response slice.
    #[error("{0}")]
    Response(String),

    #[error("{0}")]
    UnexpectedResponse(String),
}
