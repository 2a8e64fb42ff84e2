//! Consistent-hash ring mapping keys to weighted shards.

use crate::error::{Error, Result};
use crate::sharding::hashing::{Hashing, KeyHasher};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const DEFAULT_WEIGHT: u32 = 1;

/// Ring points inserted per unit of weight.
pub const VIRTUAL_NODES_PER_WEIGHT: u32 = 160;

/// `{tag}`: hash only what is between the first pair of braces.
pub static DEFAULT_KEY_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(.+?)\}").expect("default key tag pattern is valid"));

/// A shard as seen by the ring: its placement label and the resource it
/// stands for.
pub trait ShardInfo {
    type Resource;

    /// Stable name. Named shards keep their ring points when the shard list
    /// is reordered; unnamed shards are placed by list position.
    fn name(&self) -> Option<&str>;

    fn weight(&self) -> u32;

    fn create_resource(&self) -> Self::Resource;
}

/// Immutable ring over a fixed list of shards.
///
/// Each shard gets `160 * weight` points. A key is hashed (after key tag
/// extraction) and served by the shard owning the first point at or after
/// the hash, wrapping around to the lowest point. One resource is created
/// per shard when the ring is built.
pub struct Sharded<S: ShardInfo, H = Hashing> {
    ring: BTreeMap<i64, usize>,
    shards: Vec<S>,
    resources: Vec<S::Resource>,
    hasher: H,
    tag_pattern: Option<Regex>,
}

impl<S: ShardInfo> Sharded<S, Hashing> {
    /// MurmurHash ring without key tags.
    pub fn new(shards: Vec<S>) -> Result<Self> {
        Self::with_hasher(shards, Hashing::default(), None)
    }
}

impl<S: ShardInfo, H: KeyHasher> Sharded<S, H> {
    pub fn with_hasher(shards: Vec<S>, hasher: H, tag_pattern: Option<Regex>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one shard is required".to_string(),
            ));
        }

        let mut ring = BTreeMap::new();
        let mut label = String::new();
        for (index, shard) in shards.iter().enumerate() {
            let weight = shard.weight();
            if weight == 0 {
                return Err(Error::InvalidArgument(format!(
                    "shard {} has weight 0",
                    shard.name().unwrap_or("<unnamed>")
                )));
            }

            for n in 0..VIRTUAL_NODES_PER_WEIGHT * weight {
                label.clear();
                // Writing into a String cannot fail.
                let _ = match shard.name() {
                    Some(name) => write!(label, "{}*{}{}", name, weight, n),
                    None => write!(label, "SHARD-{}-NODE-{}", index, n),
                };
                // Colliding points go to the later shard.
                ring.insert(hasher.hash(label.as_bytes()), index);
            }
        }

        let resources = shards.iter().map(ShardInfo::create_resource).collect();
        Ok(Self {
            ring,
            shards,
            resources,
            hasher,
            tag_pattern,
        })
    }

    /// The part of `key` that is hashed: the first capture of the tag
    /// pattern when it matches, otherwise the whole key.
    pub fn key_tag<'k>(&self, key: &'k [u8]) -> &'k [u8] {
        self.tag_pattern
            .as_ref()
            .and_then(|pattern| pattern.captures(key))
            .and_then(|captures| captures.get(1))
            .map_or(key, |tag| tag.as_bytes())
    }

    /// Position of the shard serving `key` in the shard list.
    pub fn shard_index(&self, key: &[u8]) -> usize {
        let hash = self.hasher.hash(self.key_tag(key));
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.first_key_value())
            .map_or(0, |(_, &index)| index)
    }

    pub fn shard_info(&self, key: &[u8]) -> &S {
        &self.shards[self.shard_index(key)]
    }

    pub fn shard(&self, key: &[u8]) -> &S::Resource {
        &self.resources[self.shard_index(key)]
    }

    pub fn shard_mut(&mut self, key: &[u8]) -> &mut S::Resource {
        let index = self.shard_index(key);
        &mut self.resources[index]
    }

    pub fn all_shard_info(&self) -> &[S] {
        &self.shards
    }

    pub fn all_shards(&self) -> &[S::Resource] {
        &self.resources
    }

    pub fn all_shards_mut(&mut self) -> &mut [S::Resource] {
        &mut self.resources
    }

    /// Shard descriptors paired with their resources, in list order.
    pub fn iter(&self) -> impl Iterator<Item = (&S, &S::Resource)> {
        self.shards.iter().zip(self.resources.iter())
    }

    /// Ring points in ascending order with the index of the owning shard.
    pub fn ring_points(&self) -> impl Iterator<Item = (i64, usize)> + '_ {
        self.ring.iter().map(|(&hash, &index)| (hash, index))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn tag_pattern(&self) -> Option<&Regex> {
        self.tag_pattern.as_ref()
    }
}
