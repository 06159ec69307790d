// Copyright 2024 TxnKV Project Authors. Licensed under Apache-2.0.

//! Routing Cache (C1, spec §4.2).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

pub type Key = Vec<u8>;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RegionId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// Read-only view of a shard's ownership, as seen by the client.
#[derive(Clone, Debug)]
pub struct Region {
    pub id: RegionId,
    pub epoch: RegionEpoch,
    pub start_key: Key,
    /// Empty means unbounded.
    pub end_key: Key,
    pub leader_endpoint: String,
}

impl Region {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Whether `[start, end)` overlaps this region's range at all.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        let after_start = self.end_key.is_empty() || start < self.end_key.as_slice();
        let before_end = end.is_empty() || self.start_key.as_slice() < end;
        after_start && before_end
    }
}

/// Maps a key (or range) to the shard that currently owns it. Safe for
/// concurrent use; shared process-wide across all live transactions.
#[async_trait]
pub trait RegionCache: Send + Sync {
    async fn lookup_region_by_key(&self, key: &[u8]) -> Result<Region>;
    async fn lookup_region_between(&self, start: &[u8], end: &[u8]) -> Result<Region>;
    async fn invalidate(&self, region_id: RegionId);
}

/// A simple in-memory region cache keyed by start_key, refreshed wholesale
/// on invalidation by a caller-supplied loader. This is the default
/// production implementation; its internal refresh logic (talking to PD)
/// is out of scope per spec §1 and is abstracted behind `RegionSource`.
pub struct InMemoryRegionCache<S: RegionSource> {
    source: S,
    // keyed by start_key so a `range` query can find the first region whose
    // start_key is <= the probe key via `range(..=key).next_back()`.
    regions: RwLock<BTreeMap<Key, Arc<Region>>>,
}

#[async_trait]
pub trait RegionSource: Send + Sync {
    async fn fetch_region_by_key(&self, key: &[u8]) -> Result<Region>;
    async fn fetch_region_between(&self, start: &[u8], end: &[u8]) -> Result<Region>;
}

impl<S: RegionSource> InMemoryRegionCache<S> {
    pub fn new(source: S) -> Self {
        InMemoryRegionCache {
            source,
            regions: RwLock::new(BTreeMap::new()),
        }
    }

    fn cached_for_key(&self, key: &[u8]) -> Option<Arc<Region>> {
        let regions = self.regions.read();
        regions
            .range::<[u8], _>(..=key)
            .next_back()
            .map(|(_, r)| r.clone())
            .filter(|r| r.contains(key))
    }
}

#[async_trait]
impl<S: RegionSource> RegionCache for InMemoryRegionCache<S> {
    async fn lookup_region_by_key(&self, key: &[u8]) -> Result<Region> {
        if let Some(region) = self.cached_for_key(key) {
            return Ok((*region).clone());
        }
        let region = self.source.fetch_region_by_key(key).await?;
        self.regions
            .write()
            .insert(region.start_key.clone(), Arc::new(region.clone()));
        Ok(region)
    }

    async fn lookup_region_between(&self, start: &[u8], end: &[u8]) -> Result<Region> {
        {
            let regions = self.regions.read();
            if let Some((_, r)) = regions.range::<[u8], _>(..=start).next_back() {
                if r.overlaps(start, end) {
                    return Ok((**r).clone());
                }
            }
        }
        let region = self.source.fetch_region_between(start, end).await?;
        self.regions
            .write()
            .insert(region.start_key.clone(), Arc::new(region.clone()));
        Ok(region)
    }

    async fn invalidate(&self, region_id: RegionId) {
        self.regions.write().retain(|_, r| r.id != region_id);
    }
}
