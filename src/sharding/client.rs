use crate::client::Client;
use crate::error::Result;
use crate::network::Endpoint;
use crate::sharding::hashing::Hashing;
use crate::sharding::ring::{Sharded, ShardInfo, DEFAULT_WEIGHT};
use bytes::Bytes;
use regex::bytes::Regex;
use std::fmt;
use tracing::warn;

/// One backend in a sharded deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardEndpoint {
    pub endpoint: Endpoint,
    pub name: Option<String>,
    pub weight: u32,
}

impl ShardEndpoint {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            name: None,
            weight: DEFAULT_WEIGHT,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

impl ShardInfo for ShardEndpoint {
    type Resource = Client;

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    /// The client connects on first use.
    fn create_resource(&self) -> Client {
        Client::new(self.endpoint.clone())
    }
}

impl fmt::Display for ShardEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.endpoint, self.weight)
    }
}

/// Routes each key-based command to the shard owning the key.
pub struct ShardedClient {
    ring: Sharded<ShardEndpoint>,
}

impl ShardedClient {
    pub fn new(shards: Vec<ShardEndpoint>) -> Result<Self> {
        Ok(Self {
            ring: Sharded::new(shards)?,
        })
    }

    pub fn with_hashing(
        shards: Vec<ShardEndpoint>,
        hashing: Hashing,
        tag_pattern: Option<Regex>,
    ) -> Result<Self> {
        Ok(Self {
            ring: Sharded::with_hasher(shards, hashing, tag_pattern)?,
        })
    }

    pub fn ring(&self) -> &Sharded<ShardEndpoint> {
        &self.ring
    }

    /// Client for the shard owning `key`.
    pub fn shard(&mut self, key: impl AsRef<[u8]>) -> &mut Client {
        self.ring.shard_mut(key.as_ref())
    }

    pub fn shard_info(&self, key: impl AsRef<[u8]>) -> &ShardEndpoint {
        self.ring.shard_info(key.as_ref())
    }

    pub fn all_shards_mut(&mut self) -> &mut [Client] {
        self.ring.all_shards_mut()
    }

    /// True if any shard connection is broken. One broken shard makes the
    /// whole sharded client unfit for reuse.
    pub fn is_broken(&self) -> bool {
        self.ring.all_shards().iter().any(Client::is_broken)
    }

    /// Disconnect every shard, reporting the first failure after trying all.
    pub fn disconnect(&mut self) -> Result<()> {
        let mut first_err = None;
        for client in self.ring.all_shards_mut() {
            if let Err(e) = client.disconnect() {
                warn!(endpoint = %client.endpoint(), error = %e, "Failed to disconnect shard");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Reset session state on every connected shard.
    pub fn reset_state(&mut self) -> Result<()> {
        for client in self.ring.all_shards_mut() {
            client.reset_state()?;
        }
        Ok(())
    }

    pub fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        let key = key.as_ref();
        self.shard(key).get(key)
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<String> {
        let key = key.as_ref();
        self.shard(key).set(key, value)
    }

    pub fn set_ex(
        &mut self,
        key: impl AsRef<[u8]>,
        seconds: u64,
        value: impl AsRef<[u8]>,
    ) -> Result<String> {
        let key = key.as_ref();
        self.shard(key).set_ex(key, seconds, value)
    }

    pub fn del(&mut self, key: impl AsRef<[u8]>) -> Result<i64> {
        let key = key.as_ref();
        self.shard(key).del(&[key])
    }

    pub fn exists(&mut self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        self.shard(key).exists(key)
    }

    pub fn incr(&mut self, key: impl AsRef<[u8]>) -> Result<i64> {
        let key = key.as_ref();
        self.shard(key).incr(key)
    }

    pub fn incr_by(&mut self, key: impl AsRef<[u8]>, delta: i64) -> Result<i64> {
        let key = key.as_ref();
        self.shard(key).incr_by(key, delta)
    }

    pub fn expire(&mut self, key: impl AsRef<[u8]>, seconds: u64) -> Result<bool> {
        let key = key.as_ref();
        self.shard(key).expire(key, seconds)
    }

    pub fn ttl(&mut self, key: impl AsRef<[u8]>) -> Result<i64> {
        let key = key.as_ref();
        self.shard(key).ttl(key)
    }

    pub fn rpush(&mut self, key: impl AsRef<[u8]>, values: &[&[u8]]) -> Result<i64> {
        let key = key.as_ref();
        self.shard(key).rpush(key, values)
    }

    pub fn lrange(&mut self, key: impl AsRef<[u8]>, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let key = key.as_ref();
        self.shard(key).lrange(key, start, stop)
    }
}

impl fmt::Debug for ShardedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ring.all_shard_info().iter().map(|s| s.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(port: u16) -> ShardEndpoint {
        ShardEndpoint::new(Endpoint::new("127.0.0.1", port))
    }

    #[test]
    fn descriptor_display_and_defaults() {
        let s = shard(7000).with_name("alpha").with_weight(2);
        assert_eq!(s.to_string(), "127.0.0.1:7000*2");
        assert_eq!(ShardInfo::name(&s), Some("alpha"));
        assert_eq!(shard(7001).weight, DEFAULT_WEIGHT);
    }

    #[test]
    fn builds_one_lazy_client_per_shard() {
        let client = ShardedClient::new(vec![shard(7000), shard(7001)]).unwrap();
        assert_eq!(client.ring().all_shards().len(), 2);
        assert!(client.ring().all_shards().iter().all(|c| !c.is_connected()));
        assert!(!client.is_broken());
    }

    #[test]
    fn routes_by_ring() {
        let mut client = ShardedClient::with_hashing(
            vec![shard(7000), shard(7001), shard(7002)],
            Hashing::Md5,
            None,
        )
        .unwrap();
        for i in 0..20 {
            let key = format!("key{}", i);
            let expected = client.shard_info(&key).endpoint.port;
            assert_eq!(client.shard(&key).endpoint().port, expected);
        }
    }

    #[test]
    fn disconnect_without_connections_is_ok() {
        let mut client = ShardedClient::new(vec![shard(7000), shard(7001)]).unwrap();
        client.disconnect().unwrap();
        client.reset_state().unwrap();
    }
}
