//! Factories for pooled clients.

use crate::client::Client;
use crate::error::Result;
use crate::network::Endpoint;
use crate::pool::{Pool, PoolConfig, ResourceFactory};
use crate::sharding::{Hashing, ShardEndpoint, ShardedClient};
use regex::bytes::Regex;
use tracing::{debug, warn};

pub type ClientPool = Pool<ClientFactory>;
pub type ShardedClientPool = Pool<ShardedClientFactory>;

/// Creates connected, handshaken [`Client`]s for one endpoint.
#[derive(Debug, Clone)]
pub struct ClientFactory {
    endpoint: Endpoint,
}

impl ClientFactory {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl ResourceFactory for ClientFactory {
    type Resource = Client;

    fn create(&self) -> Result<Client> {
        let mut client = Client::new(self.endpoint.clone());
        client.connect()?;
        debug!(endpoint = %self.endpoint, "Created pooled client");
        Ok(client)
    }

    fn destroy(&self, mut client: Client) -> Result<()> {
        if client.is_connected() && !client.is_broken() {
            // Best effort; the socket is closed below either way.
            if let Err(e) = client.quit() {
                debug!(endpoint = %self.endpoint, error = %e, "QUIT failed during destroy");
            }
        }
        client.disconnect()
    }

    fn validate(&self, client: &mut Client) -> bool {
        matches!(client.ping().as_deref(), Ok("PONG"))
    }

    /// Borrowers always start on the configured database.
    fn on_borrow(&self, client: &mut Client) -> Result<()> {
        if client.db() != self.endpoint.database {
            client.select(self.endpoint.database)?;
        }
        Ok(())
    }

    fn on_return(&self, client: &mut Client) -> Result<()> {
        client.reset_state()
    }

    fn is_broken(&self, client: &Client) -> bool {
        client.is_broken()
    }
}

impl Pool<ClientFactory> {
    pub fn for_endpoint(endpoint: Endpoint, config: PoolConfig) -> Self {
        Pool::new(ClientFactory::new(endpoint), config)
    }
}

/// Creates [`ShardedClient`]s over a fixed shard list. Shard connections are
/// opened on first use.
#[derive(Debug, Clone)]
pub struct ShardedClientFactory {
    shards: Vec<ShardEndpoint>,
    hashing: Hashing,
    tag_pattern: Option<Regex>,
}

impl ShardedClientFactory {
    pub fn new(shards: Vec<ShardEndpoint>, hashing: Hashing, tag_pattern: Option<Regex>) -> Self {
        Self {
            shards,
            hashing,
            tag_pattern,
        }
    }

    pub fn shards(&self) -> &[ShardEndpoint] {
        &self.shards
    }
}

impl ResourceFactory for ShardedClientFactory {
    type Resource = ShardedClient;

    fn create(&self) -> Result<ShardedClient> {
        ShardedClient::with_hashing(self.shards.clone(), self.hashing, self.tag_pattern.clone())
    }

    fn destroy(&self, mut client: ShardedClient) -> Result<()> {
        for shard in client.all_shards_mut() {
            if shard.is_connected() && !shard.is_broken() {
                if let Err(e) = shard.quit() {
                    debug!(endpoint = %shard.endpoint(), error = %e, "QUIT failed during destroy");
                }
            }
        }
        client.disconnect()
    }

    /// Every shard must answer PING.
    fn validate(&self, client: &mut ShardedClient) -> bool {
        client.all_shards_mut().iter_mut().all(|shard| {
            let alive = matches!(shard.ping().as_deref(), Ok("PONG"));
            if !alive {
                warn!(endpoint = %shard.endpoint(), "Shard failed validation");
            }
            alive
        })
    }

    fn on_return(&self, client: &mut ShardedClient) -> Result<()> {
        client.reset_state()
    }

    fn is_broken(&self, client: &ShardedClient) -> bool {
        client.is_broken()
    }
}

impl Pool<ShardedClientFactory> {
    pub fn for_shards(
        shards: Vec<ShardEndpoint>,
        hashing: Hashing,
        tag_pattern: Option<Regex>,
        config: PoolConfig,
    ) -> Self {
        Pool::new(ShardedClientFactory::new(shards, hashing, tag_pattern), config)
    }
}
