// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Carves each cache's way space into reserved regions: the guarantee,
//! best-effort and shared pools, plus an OS region placed below them on
//! caches serving the OS CPUs and above them everywhere else. The layout is
//! computed once at startup and carried in the allocation context for the
//! life of the process.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use waypool_utils::{Bitmask, CacheTopology};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolKind {
    Guarantee,
    Besteffort,
    Shared,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolKind::Guarantee => write!(f, "guarantee"),
            PoolKind::Besteffort => write!(f, "besteffort"),
            PoolKind::Shared => write!(f, "shared"),
        }
    }
}

/// Pool sizes demand more ways than a cache has.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    pub cache_id: u32,
    pub needed: usize,
    pub available: usize,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "configured pools need {} ways but cache {} has only {}",
            self.needed, self.cache_id, self.available
        )
    }
}

impl std::error::Error for ConfigError {}

/// One reserved pool: its configured width, the CPUs whose workloads it can
/// serve, and its per-cache-id way mask and CPU span.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedPool {
    pub ways: u32,
    pub all_cpus: Bitmask,
    pub masks: BTreeMap<u32, Bitmask>,
    pub cpus: BTreeMap<u32, Bitmask>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolLayout {
    cbm_len: usize,
    os_region: BTreeMap<u32, Bitmask>,
    pools: BTreeMap<PoolKind, ReservedPool>,
}

/// Place the OS region and the three pools on every cache instance.
///
/// Regions stack from the low end upward. On caches whose CPUs intersect the
/// OS CPU set the OS region occupies the lowest ways and the pools are
/// shifted above it; elsewhere the pools start at way zero and the OS region
/// takes the first ways above them, keeping it disjoint from every pool on
/// every cache. Zero-way pools get an empty mask. Pool CPU spans are what
/// remains of each cache's CPUs after the OS and infra reservations.
pub fn compute_layout(
    cfg: &Config,
    topo: &CacheTopology,
    cbm_len: usize,
    os_cpus: &Bitmask,
    infra_cpus: &Bitmask,
) -> Result<PoolLayout, ConfigError> {
    let os_ways = cfg.os.cache_ways;
    let pool_ways = [
        (PoolKind::Guarantee, cfg.pools.guarantee),
        (PoolKind::Besteffort, cfg.pools.besteffort),
        (PoolKind::Shared, cfg.pools.shared),
    ];
    let reserved_cpus = os_cpus.or(infra_cpus);

    let full = Bitmask::full(cbm_len);
    let mut os_region = BTreeMap::new();
    let mut pool_masks: BTreeMap<PoolKind, BTreeMap<u32, Bitmask>> = BTreeMap::new();
    let mut spans = BTreeMap::new();
    let mut all_cpus = Bitmask::new(topo.nr_cpus());

    let pool_total: u32 = pool_ways.iter().map(|&(_, ways)| ways).sum();

    for (&cache_id, node) in topo.caches() {
        let os_shift = if !os_cpus.and(&node.shared_cpus).is_empty() {
            os_ways
        } else {
            0
        };
        let needed = (os_ways + pool_total) as usize;
        if needed > cbm_len {
            return Err(ConfigError {
                cache_id,
                needed,
                available: cbm_len,
            });
        }

        let span = node.shared_cpus.axor(&reserved_cpus);
        all_cpus = all_cpus.or(&span);
        spans.insert(cache_id, span);

        // The OS region sits under the pools where the shift applies and in
        // the first free ways above them elsewhere, so it never cuts into a
        // pool on any cache.
        let region_at = if os_shift > 0 { 0 } else { pool_total as usize };
        os_region.insert(
            cache_id,
            full.connective_bits(os_ways as usize, region_at, true),
        );
        let mut shift = os_shift as usize;
        for &(kind, ways) in &pool_ways {
            let mask = full.connective_bits(ways as usize, shift, true);
            debug!(
                "cache {}: {} pool ways {}",
                cache_id,
                kind,
                mask.to_human_string()
            );
            pool_masks.entry(kind).or_default().insert(cache_id, mask);
            shift += ways as usize;
        }
    }

    let pools = pool_ways
        .iter()
        .map(|&(kind, ways)| {
            (
                kind,
                ReservedPool {
                    ways,
                    all_cpus: all_cpus.clone(),
                    masks: pool_masks.remove(&kind).unwrap_or_default(),
                    cpus: spans.clone(),
                },
            )
        })
        .collect();

    Ok(PoolLayout {
        cbm_len,
        os_region,
        pools,
    })
}

impl PoolLayout {
    pub fn cbm_len(&self) -> usize {
        self.cbm_len
    }

    /// The OS reserved mask for a cache id, disjoint from every pool mask.
    /// Present on every cache so it can double as the filler mask for cache
    /// ids a workload does not target without eating into pool availability.
    pub fn os_mask(&self, cache_id: u32) -> Bitmask {
        self.os_region
            .get(&cache_id)
            .cloned()
            .unwrap_or_else(|| Bitmask::new(self.cbm_len))
    }

    pub fn os_region(&self) -> &BTreeMap<u32, Bitmask> {
        &self.os_region
    }

    pub fn pool_ways(&self, kind: PoolKind) -> u32 {
        self.pools.get(&kind).map(|pool| pool.ways).unwrap_or(0)
    }

    pub fn pool_mask(&self, kind: PoolKind, cache_id: u32) -> Bitmask {
        self.pools
            .get(&kind)
            .and_then(|pool| pool.masks.get(&cache_id))
            .cloned()
            .unwrap_or_else(|| Bitmask::new(self.cbm_len))
    }

    /// CPUs on one cache instance that pool workloads may occupy.
    pub fn pool_cpus(&self, kind: PoolKind, cache_id: u32) -> Option<&Bitmask> {
        self.pools.get(&kind).and_then(|pool| pool.cpus.get(&cache_id))
    }

    pub fn pools(&self) -> &BTreeMap<PoolKind, ReservedPool> {
        &self.pools
    }
}
