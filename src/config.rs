use crate::error::{Error, Result};
use crate::network::endpoint::{Endpoint, DEFAULT_DATABASE, DEFAULT_HOST, DEFAULT_PORT};
use crate::pool::{PoolConfig, ShardedClientPool};
use crate::sharding::ring::DEFAULT_WEIGHT;
use crate::sharding::{Hashing, ShardEndpoint};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted for shards without a configured password.
pub const PASSWORD_ENV: &str = "REDSHARD_AUTH_PASSWORD";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ring hash algorithm
    pub hashing: Hashing,

    /// Key tag pattern; its first capture group is hashed instead of the key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_tag_pattern: Option<String>,

    /// Log level
    pub log_level: String,

    /// Pool policy for sharded clients
    pub pool: PoolConfig,

    /// Backends, in ring order
    pub shards: Vec<ShardConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hashing: Hashing::default(),
            key_tag_pattern: None,
            log_level: "info".to_string(),
            pool: PoolConfig::default(),
            shards: vec![ShardConfig::default()],
        }
    }
}

/// One backend entry.
///
/// Either `url` (`redis://:password@host:port/db`) or the individual address
/// fields. Fields set explicitly next to a `url` override what it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub host: String,

    pub port: u16,

    /// Stable ring name; unnamed shards are placed by list position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub weight: u32,

    /// Connect and read timeout, 0 for none
    pub timeout_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    pub database: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            name: None,
            weight: DEFAULT_WEIGHT,
            timeout_ms: 2000,
            password: None,
            database: DEFAULT_DATABASE,
            client_name: None,
        }
    }
}

impl ShardConfig {
    pub fn endpoint(&self) -> Result<Endpoint> {
        let mut endpoint = match &self.url {
            Some(url) => {
                let parsed = Endpoint::from_url(url)?;
                let database = if self.database != DEFAULT_DATABASE {
                    self.database
                } else {
                    parsed.database
                };
                parsed.with_database(database)
            }
            None => Endpoint::new(self.host.clone(), self.port).with_database(self.database),
        };
        endpoint.timeout = Duration::from_millis(self.timeout_ms);
        if self.password.is_some() {
            endpoint.password = self.password.clone();
        }
        endpoint.client_name = self.client_name.clone();
        Ok(endpoint)
    }

    pub fn shard_endpoint(&self) -> Result<ShardEndpoint> {
        Ok(ShardEndpoint {
            endpoint: self.endpoint()?,
            name: self.name.clone(),
            weight: self.weight,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use redshard::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("redshard.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Load password from environment for shards that have none
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            for shard in &mut config.shards {
                let url_has_password = shard
                    .url
                    .as_deref()
                    .and_then(|url| Endpoint::from_url(url).ok())
                    .is_some_and(|endpoint| endpoint.password.is_some());
                if shard.password.is_none() && !url_has_password {
                    shard.password = Some(password.clone());
                }
            }
        }

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.shards.is_empty() {
            anyhow::bail!("at least one shard must be configured");
        }

        for (index, shard) in self.shards.iter().enumerate() {
            if shard.weight == 0 {
                anyhow::bail!("shard {} weight must be > 0", index);
            }
            if shard.url.is_none() && shard.port == 0 {
                anyhow::bail!("shard {} port must be > 0", index);
            }
            shard.endpoint()?;
        }

        if self.pool.max_total == 0 {
            anyhow::bail!("pool.max_total must be > 0");
        }

        self.key_tag()?;
        Ok(())
    }

    /// Compiled key tag pattern, if one is configured.
    pub fn key_tag(&self) -> Result<Option<Regex>> {
        let Some(pattern) = &self.key_tag_pattern else {
            return Ok(None);
        };
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid key_tag_pattern: {}", e)))?;
        // Slot 0 is the whole match.
        if regex.captures_len() < 2 {
            return Err(Error::Config(
                "key_tag_pattern needs a capture group".to_string(),
            ));
        }
        Ok(Some(regex))
    }

    pub fn shard_endpoints(&self) -> Result<Vec<ShardEndpoint>> {
        self.shards.iter().map(ShardConfig::shard_endpoint).collect()
    }

    /// Pool of sharded clients over the configured shards.
    pub fn build_pool(&self) -> Result<ShardedClientPool> {
        Ok(ShardedClientPool::for_shards(
            self.shard_endpoints()?,
            self.hashing,
            self.key_tag()?,
            self.pool.clone(),
        ))
    }
}
