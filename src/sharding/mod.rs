//! Key-based sharding over a consistent-hash ring.

pub mod client;
pub mod hashing;
pub mod ring;

pub use client::{ShardEndpoint, ShardedClient};
pub use hashing::{Hashing, KeyHasher};
pub use ring::{ShardInfo, Sharded, DEFAULT_KEY_TAG_PATTERN};
