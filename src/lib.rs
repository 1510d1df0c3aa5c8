//! rustcache - a networked in-memory key-value cache
//!
//! This library provides both halves of a batching cache protocol:
//! - TCP server executing framed operation batches against a shared map
//! - pooled client that coalesces and deduplicates concurrent requests
//! - deterministic binary wire codec with length-prefixed framing

pub mod client;
pub mod codec;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::{Client, ClientConfig};
pub use codec::DecodeError;
pub use error::{Result, RustCacheError};
pub use protocol::{
    BatchedRequest, BatchedResponse, OpResult, Operation, OperationKind, ResultStatus,
};
pub use server::{RustCacheServer, ServerConfig};
pub use store::CacheMap;
