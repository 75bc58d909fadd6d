// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cache-instance topology.
//!
//! Way allocation happens per cache instance, so the engine needs to know
//! which CPUs share which instance of the allocated level. The kernel
//! publishes a cache id per CPU under
//! `/sys/devices/system/cpu/cpuN/cache/indexL/id`; grouping CPUs by that id
//! yields each instance's CPU span. The hierarchy is read once at startup;
//! hosts without usable sysfs ids can supply the map from configuration via
//! [`CacheTopology::from_nodes`].

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::bail;
use anyhow::Result;
use glob::glob;
use sscanf::sscanf;

use crate::bitmask::Bitmask;

const SYS_CPU_DIR: &str = "/sys/devices/system/cpu";

/// One cache instance and the CPUs that hit it.
#[derive(Debug, Clone)]
pub struct CacheNode {
    pub id: u32,
    pub shared_cpus: Bitmask,
}

#[derive(Debug, Clone)]
pub struct CacheTopology {
    level: String,
    nr_cpus: usize,
    caches: BTreeMap<u32, CacheNode>,
}

impl CacheTopology {
    /// Scan the host for all instances of the given cache level ("L3").
    pub fn from_sysfs(level: &str) -> Result<CacheTopology> {
        let base = Path::new(SYS_CPU_DIR);
        let nr_cpus = possible_cpus_from(&base.join("possible"))?;
        Self::scan(base, level, nr_cpus)
    }

    fn scan(base: &Path, level: &str, nr_cpus: usize) -> Result<CacheTopology> {
        let index = cache_index(level)?;
        let mut caches: BTreeMap<u32, CacheNode> = BTreeMap::new();

        let cpu_pattern = base.join("cpu[0-9]*");
        let cpu_paths = glob(cpu_pattern.to_string_lossy().as_ref())?;
        for cpu_path in cpu_paths.filter_map(Result::ok) {
            let name = match cpu_path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            let cpu_id = match sscanf!(name, "cpu{usize}") {
                Ok(val) => val,
                Err(_) => bail!("Failed to parse cpu ID {}", name),
            };

            let id_path = cpu_path
                .join("cache")
                .join(format!("index{index}"))
                .join("id");
            if !id_path.exists() {
                // Offline CPUs expose no cache directory.
                continue;
            }
            let cache_id = read_file_usize(&id_path)? as u32;

            let node = caches.entry(cache_id).or_insert_with(|| CacheNode {
                id: cache_id,
                shared_cpus: Bitmask::new(nr_cpus),
            });
            node.shared_cpus.set_bit(cpu_id)?;
        }

        if caches.is_empty() {
            bail!(
                "no {} cache instances found under {}",
                level,
                base.display()
            );
        }
        Ok(CacheTopology {
            level: level.to_string(),
            nr_cpus,
            caches,
        })
    }

    /// Build a topology from explicit (cache id, CPU span) pairs.
    pub fn from_nodes(
        level: &str,
        nr_cpus: usize,
        nodes: Vec<(u32, Bitmask)>,
    ) -> CacheTopology {
        let caches = nodes
            .into_iter()
            .map(|(id, shared_cpus)| (id, CacheNode { id, shared_cpus }))
            .collect();
        CacheTopology {
            level: level.to_string(),
            nr_cpus,
            caches,
        }
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn caches(&self) -> &BTreeMap<u32, CacheNode> {
        &self.caches
    }

    /// Cache ids whose CPU span intersects `cpus`, or every id when `cpus`
    /// is empty.
    pub fn targeted_ids(&self, cpus: &Bitmask) -> Vec<u32> {
        if cpus.is_empty() {
            return self.caches.keys().copied().collect();
        }
        self.caches
            .values()
            .filter(|c| !c.shared_cpus.and(cpus).is_empty())
            .map(|c| c.id)
            .collect()
    }
}

// "L3" names both the resctrl resource and the sysfs cache index.
fn cache_index(level: &str) -> Result<usize> {
    match sscanf!(level, "L{usize}") {
        Ok(val) => Ok(val),
        Err(_) => bail!("Failed to parse cache level {:?}", level),
    }
}

fn possible_cpus_from(path: &Path) -> Result<usize> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => bail!("Failed to open or read file {:?}", path),
    };
    let mask = Bitmask::from_ranges(None, text.trim())?;
    Ok(mask.len())
}

fn read_file_usize(path: &Path) -> Result<usize> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => bail!("Failed to open or read file {:?}", path),
    };
    match val.trim().parse::<usize>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("Failed to parse {}", val),
    }
}
