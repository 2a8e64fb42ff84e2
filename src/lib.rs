//! redshard: blocking RESP client with pipelining, consistent-hash sharding
//! and resource pooling
//!
//! This crate talks to Redis-compatible servers over plain TCP. Keys are
//! spread over several servers with a weighted consistent-hash ring, and
//! clients are shared between threads through a bounded pool.
//!
//! # Architecture
//!
//! - Buffered transport with line, byte and block reads
//! - RESP request framing and recursive reply decoding
//! - Connections that pipeline any number of requests and turn permanently
//!   broken on the first transport failure
//! - Ring with 160 virtual nodes per unit of weight and `{tag}` key tags
//! - Generic pool driven by a resource factory

/// Configuration management for the client
pub mod config;

/// Error types and result aliases
pub mod error;

/// Buffered byte stream I/O
pub mod io;

/// Network layer for connection management
pub mod network;

/// Redis protocol (RESP) implementation
pub mod protocol;

/// Single-endpoint client with command methods
pub mod client;

/// Consistent-hash sharding
pub mod sharding;

/// Resource pooling
pub mod pool;

pub use client::{Client, Pipeline};
pub use config::{Config, ShardConfig};
pub use error::{DataError, Error, PoolOp, Result};
pub use network::{Connection, Endpoint, Health};
pub use pool::{
    ClientFactory, ClientPool, Pool, PoolConfig, Pooled, ResourceFactory, ShardedClientFactory,
    ShardedClientPool,
};
pub use protocol::RespValue;
pub use sharding::{Hashing, KeyHasher, ShardEndpoint, ShardInfo, Sharded, ShardedClient};
