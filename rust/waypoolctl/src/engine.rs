// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The allocation engine. An [`AllocationContext`] is built once at startup
//! from the configuration, the resctrl mount and the cache topology; every
//! operation then runs as a locked read-snapshot, compute, commit sequence
//! against the resource-control tree.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::anyhow;
use log::{debug, error, info, warn};
use waypool_utils::{
    commit, proc, Bitmask, CacheAlloc, CacheTopology, CommitError, LockFile, MbAlloc, RdtInfo,
    ResGroup, ResctrlFs, ROOT_GROUP,
};

use crate::config::Config;
use crate::pools::{compute_layout, ConfigError, PoolKind, PoolLayout};
use crate::store::WorkloadStore;
use crate::workload::{Status, ValidationError, Workload};

/// Group holding infrastructure tasks. Its ways are never counted as used
/// by workload allocations, like the root group's.
pub const INFRA_GROUP: &str = "infra";

#[derive(Debug)]
pub enum AllocError {
    Config(ConfigError),
    Validation(ValidationError),
    InsufficientCache { cache_id: u32 },
    SharedQuotaExceeded { quota: u32 },
    ClosExhausted { num_closids: usize },
    UnknownWorkload(String),
    Internal(String),
    Commit(CommitError),
    System(anyhow::Error),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocError::Config(err) => write!(f, "{err}"),
            AllocError::Validation(err) => write!(f, "invalid request: {err}"),
            AllocError::InsufficientCache { cache_id } => {
                write!(f, "not enough free cache ways on cache {cache_id}")
            }
            AllocError::SharedQuotaExceeded { quota } => {
                write!(f, "shared pool quota of {quota} workloads is exhausted")
            }
            AllocError::ClosExhausted { num_closids } => {
                write!(
                    f,
                    "all {num_closids} hardware classes of service are in use"
                )
            }
            AllocError::UnknownWorkload(id) => write!(f, "no workload {id:?} on record"),
            AllocError::Internal(msg) => write!(f, "internal accounting error: {msg}"),
            AllocError::Commit(err) => write!(f, "{err}"),
            AllocError::System(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for AllocError {}

impl From<ConfigError> for AllocError {
    fn from(err: ConfigError) -> AllocError {
        AllocError::Config(err)
    }
}

impl From<ValidationError> for AllocError {
    fn from(err: ValidationError) -> AllocError {
        AllocError::Validation(err)
    }
}

impl From<CommitError> for AllocError {
    fn from(err: CommitError) -> AllocError {
        AllocError::Commit(err)
    }
}

impl From<anyhow::Error> for AllocError {
    fn from(err: anyhow::Error) -> AllocError {
        AllocError::System(err)
    }
}

/// Sort a way request into its pool.
pub fn classify(max_ways: u32, min_ways: u32) -> Result<PoolKind, ValidationError> {
    match (max_ways, min_ways) {
        (0, 0) => Ok(PoolKind::Shared),
        (max_ways, min_ways) if max_ways < min_ways => {
            Err(ValidationError::BackwardWays { max_ways, min_ways })
        }
        (max_ways, min_ways) if max_ways == min_ways => Ok(PoolKind::Guarantee),
        (max_ways, 0) => Err(ValidationError::ZeroMinWays { max_ways }),
        _ => Ok(PoolKind::Besteffort),
    }
}

/// What an enforce produced: the serving group and, when best-effort
/// siblings had to give up ways, the new shape of every changed group.
#[derive(Debug)]
pub struct EnforceOutcome {
    pub group_name: String,
    pub group: ResGroup,
    pub changed: BTreeMap<String, ResGroup>,
}

pub struct AllocationContext {
    cfg: Config,
    fs: ResctrlFs,
    topo: CacheTopology,
    layout: PoolLayout,
    info: RdtInfo,
    mba_mbps: bool,
    proc_root: PathBuf,
    store: Box<dyn WorkloadStore>,
}

impl AllocationContext {
    pub fn new(
        cfg: Config,
        fs: ResctrlFs,
        topo: CacheTopology,
        store: Box<dyn WorkloadStore>,
    ) -> Result<AllocationContext, AllocError> {
        if topo.nr_cpus() != fs.nr_cpus() {
            return Err(anyhow!(
                "topology covers {} CPUs but resctrl was bound for {}",
                topo.nr_cpus(),
                fs.nr_cpus()
            )
            .into());
        }
        let info = fs.level_info(&cfg.resctrl.level)?.clone();
        let os_cpus = cfg.os_cpus(fs.nr_cpus())?;
        let infra_cpus = cfg.infra_cpus(fs.nr_cpus())?;
        let layout = compute_layout(&cfg, &topo, info.cbm_len, &os_cpus, &infra_cpus)?;
        let mba_mbps = fs.mba_mbps() || cfg.resctrl.mba_mbps;
        Ok(AllocationContext {
            cfg,
            fs,
            topo,
            layout,
            info,
            mba_mbps,
            proc_root: PathBuf::from("/proc"),
            store,
        })
    }

    /// Read task liveness and affinity from a staged procfs tree instead of
    /// `/proc`.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> AllocationContext {
        self.proc_root = proc_root.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn resctrl(&self) -> &ResctrlFs {
        &self.fs
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    pub fn topology(&self) -> &CacheTopology {
        &self.topo
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.store.all()
    }

    /// Partition the tree for steady-state operation: restrict the root
    /// group to the OS region and pin infrastructure tasks into their own
    /// group on the same ways.
    pub fn setup(&mut self) -> Result<(), AllocError> {
        let _lock = LockFile::acquire(&self.cfg.lock.path)?;
        let level = self.cfg.resctrl.level.clone();

        let os_line: Vec<CacheAlloc> = self
            .layout
            .os_region()
            .iter()
            .map(|(&cache_id, mask)| CacheAlloc {
                cache_id,
                mask: mask.clone(),
            })
            .collect();

        let mut root = self.fs.read_group(ROOT_GROUP);
        root.cache_schemata.insert(level.clone(), os_line.clone());
        self.fs.write_schemata(ROOT_GROUP, &root)?;
        info!("root group restricted to the OS region");

        let infra_cpus = self.cfg.infra_cpus(self.fs.nr_cpus())?;
        if infra_cpus.is_empty() {
            return Ok(());
        }
        let mut infra = ResGroup {
            cpus: infra_cpus,
            ..Default::default()
        };
        for task in &self.cfg.infra.tasks {
            if proc::task_alive_in(&self.proc_root, task) {
                infra.tasks.push(task.clone());
            } else {
                warn!("infra task {task} is not running, skipped");
            }
        }
        infra.cache_schemata.insert(level, os_line);
        commit(&self.fs, INFRA_GROUP, &infra, None)?;
        info!("infra group holds cpus {}", infra.cpus.to_human_string());
        Ok(())
    }

    /// Serve one workload request: validate it, carve its way masks out of
    /// the right pool, and commit the resulting group. On success the
    /// workload record is persisted as `Successful`.
    pub fn enforce(&mut self, workload: Workload) -> Result<EnforceOutcome, AllocError> {
        let _lock = LockFile::acquire(&self.cfg.lock.path)?;
        info!("enforcing workload {:?}", workload.id);
        match self.try_enforce(&workload) {
            Ok(outcome) => {
                let mut record = workload;
                record.group_name = Some(outcome.group_name.clone());
                record.status = Status::Successful;
                self.store.put(record)?;
                info!("workload served by group {:?}", outcome.group_name);
                Ok(outcome)
            }
            Err(err) => {
                warn!("enforce failed: {err}");
                self.note_failure(workload, &err);
                Err(err)
            }
        }
    }

    /// Tear down one workload. Dedicated groups are removed, which hands
    /// their tasks back to the root group; a shared-pool workload only has
    /// its tasks moved out since the group serves other tenants.
    pub fn release(&mut self, id: &str) -> Result<(), AllocError> {
        let _lock = LockFile::acquire(&self.cfg.lock.path)?;
        let record = self
            .store
            .get(id)
            .ok_or_else(|| AllocError::UnknownWorkload(id.to_string()))?;
        if let Some(group_name) = record.group_name.as_deref() {
            if group_name == self.cfg.pools.shared_group {
                let alive: Vec<String> = record
                    .task_ids
                    .iter()
                    .filter(|task| proc::task_alive_in(&self.proc_root, task))
                    .cloned()
                    .collect();
                if !alive.is_empty() {
                    self.fs.write_tasks(ROOT_GROUP, &alive)?;
                }
                info!("workload {id:?} left the shared group");
            } else if self.fs.group_exists(group_name) {
                self.fs.remove_group(group_name)?;
                info!("removed group {group_name:?} of workload {id:?}");
            } else {
                warn!("group {group_name:?} of workload {id:?} is already gone");
            }
        }
        self.store.remove(id)?;
        Ok(())
    }

    fn try_enforce(&self, workload: &Workload) -> Result<EnforceOutcome, AllocError> {
        let nr_cpus = self.fs.nr_cpus();
        workload.validate(&self.cfg, &self.info, nr_cpus, self.mba_mbps, &self.proc_root)?;

        let ways = workload.effective_ways(&self.cfg)?;
        let kind = match ways {
            Some((max_ways, min_ways)) => Some(classify(max_ways, min_ways)?),
            None => None,
        };
        let group_name = match kind {
            Some(PoolKind::Shared) => self.cfg.pools.shared_group.clone(),
            _ => workload.id.clone(),
        };

        let mut request_cpus = workload.requested_cores(nr_cpus)?;
        for task in &workload.task_ids {
            let allowed = proc::task_cpus_allowed_in(&self.proc_root, task, nr_cpus)?;
            request_cpus = request_cpus.or(&allowed);
        }
        let targeted = self.topo.targeted_ids(&request_cpus);
        if targeted.is_empty() {
            return Err(anyhow!("requested cores match no cache instance").into());
        }
        debug!(
            "workload {:?} targets caches {:?} via cpus {}",
            workload.id,
            targeted,
            request_cpus.to_human_string()
        );

        let groups = self.fs.groups(&[])?;
        if !groups.contains_key(&group_name) && groups.len() >= self.info.num_closids {
            return Err(AllocError::ClosExhausted {
                num_closids: self.info.num_closids,
            });
        }

        if kind == Some(PoolKind::Shared) {
            let mut occupied = self.store.live_count(&group_name, Status::Successful);
            if let Some(existing) = self.store.get(&workload.id) {
                if existing.status == Status::Successful
                    && existing.group_name.as_deref() == Some(group_name.as_str())
                {
                    occupied = occupied.saturating_sub(1);
                }
            }
            if occupied as u32 >= self.cfg.pools.shared_quota {
                return Err(AllocError::SharedQuotaExceeded {
                    quota: self.cfg.pools.shared_quota,
                });
            }
        }

        let mut changed: BTreeMap<String, ResGroup> = BTreeMap::new();
        let mut masks: BTreeMap<u32, Bitmask> = BTreeMap::new();
        if let (Some(kind), Some((max_ways, min_ways))) = (kind, ways) {
            match kind {
                PoolKind::Shared => {
                    for &cache_id in &targeted {
                        let mask = self.layout.pool_mask(PoolKind::Shared, cache_id);
                        if mask.is_empty() {
                            return Err(AllocError::InsufficientCache { cache_id });
                        }
                        masks.insert(cache_id, mask);
                    }
                }
                _ => {
                    masks = self.allocate_ways(
                        kind,
                        max_ways as usize,
                        min_ways as usize,
                        &targeted,
                        &groups,
                        &group_name,
                        &mut changed,
                    )?;
                }
            }
        }

        let mut group = groups.get(&group_name).cloned().unwrap_or_else(|| ResGroup {
            cpus: Bitmask::new(nr_cpus),
            ..Default::default()
        });
        group.cpus = group.cpus.or(&request_cpus);
        for task in &workload.task_ids {
            if !group.tasks.contains(task) {
                group.tasks.push(task.clone());
            }
        }

        if ways.is_some() {
            let level = self.cfg.resctrl.level.clone();
            let mut line = Vec::new();
            for &cache_id in self.topo.caches().keys() {
                let mask = match masks.get(&cache_id) {
                    Some(mask) => mask.clone(),
                    // Ids the workload does not target keep whatever the
                    // group already held, or fall back to the OS region.
                    None => group
                        .mask_for(&level, cache_id)
                        .cloned()
                        .unwrap_or_else(|| self.layout.os_mask(cache_id)),
                };
                line.push(CacheAlloc { cache_id, mask });
            }
            group.cache_schemata.insert(level, line);
        }

        if let Some(value) = workload.mba_percent {
            let unlimited = if self.mba_mbps { u32::MAX } else { 100 };
            let existing = group.mba_schemata.get("MB").cloned().unwrap_or_default();
            let mut line = Vec::new();
            for &cache_id in self.topo.caches().keys() {
                let value = if targeted.contains(&cache_id) {
                    value
                } else {
                    existing
                        .iter()
                        .find(|alloc| alloc.cache_id == cache_id)
                        .map(|alloc| alloc.value)
                        .unwrap_or(unlimited)
                };
                line.push(MbAlloc { cache_id, value });
            }
            group.mba_schemata.insert("MB".to_string(), line);
        }

        // Shrunken siblings commit first so the new mask never overlaps a
        // way another group still advertises.
        for (name, sibling) in &changed {
            commit(&self.fs, name, sibling, groups.get(name))?;
        }
        commit(&self.fs, &group_name, &group, groups.get(&group_name))?;

        Ok(EnforceOutcome {
            group_name,
            group,
            changed,
        })
    }

    fn allocate_ways(
        &self,
        kind: PoolKind,
        max_ways: usize,
        min_ways: usize,
        targeted: &[u32],
        groups: &BTreeMap<String, ResGroup>,
        own_group: &str,
        changed: &mut BTreeMap<String, ResGroup>,
    ) -> Result<BTreeMap<u32, Bitmask>, AllocError> {
        let mut masks = BTreeMap::new();
        for &cache_id in targeted {
            let pool = self.layout.pool_mask(kind, cache_id);
            let used = self.used_mask(cache_id, groups, own_group);
            let available = pool.axor(&used);
            debug!(
                "cache {}: {} pool available {}",
                cache_id,
                kind,
                available.to_human_string()
            );

            let mask = match kind {
                PoolKind::Guarantee => available.connective_bits(max_ways, 0, false),
                PoolKind::Besteffort => {
                    let run = available.max_connective_bits();
                    let usable = run.weight();
                    if usable >= min_ways {
                        run.connective_bits(usable.min(max_ways), 0, true)
                    } else if !self.cfg.pools.shrink {
                        Bitmask::new(available.len())
                    } else {
                        self.shrink_on_cache(
                            cache_id, &available, max_ways, min_ways, groups, own_group, changed,
                        )?
                    }
                }
                PoolKind::Shared => Bitmask::new(available.len()),
            };
            if mask.is_empty() {
                return Err(AllocError::InsufficientCache { cache_id });
            }
            masks.insert(cache_id, mask);
        }
        Ok(masks)
    }

    /// Reclaim ways from best-effort siblings on one cache. Each sibling can
    /// give up everything beyond the minimum its workload record guarantees;
    /// the new allocation then takes the lowest-positioned fitting run so the
    /// high ways stay contiguous for future large requests. Siblings the
    /// selection actually taps are shrunk to their minimum run and collected
    /// into `changed`.
    #[allow(clippy::too_many_arguments)]
    fn shrink_on_cache(
        &self,
        cache_id: u32,
        available: &Bitmask,
        max_ways: usize,
        min_ways: usize,
        groups: &BTreeMap<String, ResGroup>,
        own_group: &str,
        changed: &mut BTreeMap<String, ResGroup>,
    ) -> Result<Bitmask, AllocError> {
        let level = &self.cfg.resctrl.level;
        let pool = self.layout.pool_mask(PoolKind::Besteffort, cache_id);
        let mut candidate = available.clone();
        let mut siblings: Vec<(String, Bitmask, Bitmask)> = Vec::new();

        for (name, group) in groups {
            if name == ROOT_GROUP || name == INFRA_GROUP || name == own_group {
                continue;
            }
            let Some(mask) = group.mask_for(level, cache_id) else {
                continue;
            };
            if mask.and(&pool).is_empty() {
                continue;
            }
            let record = self.store.workload_for_group(name).ok_or_else(|| {
                error!("group {name:?} holds best-effort ways but has no workload record");
                AllocError::Internal(format!(
                    "group {name:?} holds best-effort ways but has no workload record"
                ))
            })?;
            let record_min = match record.effective_ways(&self.cfg) {
                Ok(Some((_, min_ways))) => min_ways as usize,
                Ok(None) => {
                    return Err(AllocError::Internal(format!(
                        "record {:?} backs a best-effort group but asks for no ways",
                        record.id
                    )))
                }
                Err(err) => {
                    return Err(AllocError::Internal(format!(
                        "record {:?} no longer resolves: {err}",
                        record.id
                    )))
                }
            };
            let kept = mask.connective_bits(record_min, 0, true);
            if kept.is_empty() {
                continue;
            }
            candidate = candidate.or(&mask.axor(&kept));
            siblings.push((name.clone(), mask.clone(), kept));
        }

        let mut selected = Bitmask::new(candidate.len());
        for take in (min_ways..=max_ways).rev() {
            let run = candidate.connective_bits(take, 0, true);
            if !run.is_empty() {
                selected = run;
                break;
            }
        }
        if selected.is_empty() {
            return Err(AllocError::InsufficientCache { cache_id });
        }

        for (name, old_mask, kept) in siblings {
            if old_mask.and(&selected).is_empty() {
                continue;
            }
            debug!(
                "shrinking {} on cache {} to {}",
                name,
                cache_id,
                kept.to_human_string()
            );
            let entry = changed
                .entry(name.clone())
                .or_insert_with(|| groups.get(&name).cloned().unwrap_or_default());
            set_cache_mask(entry, level, cache_id, kept);
        }
        Ok(selected)
    }

    fn used_mask(
        &self,
        cache_id: u32,
        groups: &BTreeMap<String, ResGroup>,
        own_group: &str,
    ) -> Bitmask {
        let level = &self.cfg.resctrl.level;
        let mut used = Bitmask::new(self.info.cbm_len);
        for (name, group) in groups {
            if name == ROOT_GROUP || name == INFRA_GROUP || name == own_group {
                continue;
            }
            if let Some(mask) = group.mask_for(level, cache_id) {
                used = used.or(mask);
            }
        }
        used
    }

    /// Keep the failure visible in the store, but never clobber the record
    /// of an allocation that is still in place.
    fn note_failure(&mut self, mut workload: Workload, err: &AllocError) {
        if self.store.get(&workload.id).is_some() {
            return;
        }
        workload.status = match err {
            AllocError::Validation(_) => Status::Invalid,
            _ => Status::Failed,
        };
        workload.group_name = None;
        if let Err(store_err) = self.store.put(workload) {
            warn!("Failed to record failed workload: {store_err:#}");
        }
    }
}

fn set_cache_mask(group: &mut ResGroup, level: &str, cache_id: u32, mask: Bitmask) {
    let line = group.cache_schemata.entry(level.to_string()).or_default();
    match line.iter_mut().find(|alloc| alloc.cache_id == cache_id) {
        Some(alloc) => alloc.mask = mask,
        None => line.push(CacheAlloc { cache_id, mask }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use crate::store::JsonStore;

    const NR_CPUS: usize = 12;

    struct TestBed {
        dir: TempDir,
        ctx: AllocationContext,
    }

    impl TestBed {
        fn resctrl_file(&self, rel: &str) -> String {
            fs::read_to_string(self.dir.path().join("resctrl").join(rel)).unwrap()
        }

        fn seed_task(&self, pid: &str, cpus_hex: &str) {
            let dir = self.dir.path().join("proc").join(pid);
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("status"),
                format!("Name:\tstub\nCpus_allowed:\t{cpus_hex}\nCpus_allowed_list:\t0\n"),
            )
            .unwrap();
        }

        fn record(&self, id: &str) -> Workload {
            self.ctx
                .workloads()
                .into_iter()
                .find(|workload| workload.id == id)
                .unwrap()
        }
    }

    fn put(path: &Path, text: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }

    fn testbed_sized(num_closids: usize, tweak: impl FnOnce(&mut Config)) -> TestBed {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("resctrl");
        put(&root.join("info/L3/cbm_mask"), "7ff\n");
        put(&root.join("info/L3/min_cbm_bits"), "2\n");
        put(
            &root.join("info/L3/num_closids"),
            &format!("{num_closids}\n"),
        );
        put(&root.join("cpus"), "0-11\n");
        put(&root.join("tasks"), "");
        put(&root.join("schemata"), "L3:0=7ff;1=7ff\n");
        fs::create_dir_all(dir.path().join("proc")).unwrap();

        let mut cfg = Config::default();
        cfg.os.cache_ways = 1;
        cfg.os.cpus = "0".to_string();
        cfg.pools.guarantee = 6;
        cfg.pools.besteffort = 4;
        cfg.pools.shared = 0;
        cfg.store.path = dir.path().join("workloads.json");
        cfg.lock.path = dir.path().join("waypool.lock");
        tweak(&mut cfg);

        let fs_handle = ResctrlFs::at(&root, NR_CPUS).unwrap();
        let topo = CacheTopology::from_nodes(
            "L3",
            NR_CPUS,
            vec![
                (0, Bitmask::from_spec(Some(NR_CPUS), "0-5").unwrap()),
                (1, Bitmask::from_spec(Some(NR_CPUS), "6-11").unwrap()),
            ],
        );
        let store = Box::new(JsonStore::open(&cfg.store.path).unwrap());
        let ctx = AllocationContext::new(cfg, fs_handle, topo, store)
            .unwrap()
            .with_proc_root(dir.path().join("proc"));
        TestBed { dir, ctx }
    }

    fn testbed(tweak: impl FnOnce(&mut Config)) -> TestBed {
        testbed_sized(8, tweak)
    }

    fn request(id: &str, cores: &[&str], max_ways: u32, min_ways: u32) -> Workload {
        Workload {
            id: id.to_string(),
            core_ids: cores.iter().map(|core| core.to_string()).collect(),
            max_ways: Some(max_ways),
            min_ways: Some(min_ways),
            ..Default::default()
        }
    }

    // ==================== classify tests ====================

    #[test]
    fn test_classify() {
        assert_eq!(classify(0, 0), Ok(PoolKind::Shared));
        assert_eq!(classify(4, 2), Ok(PoolKind::Besteffort));
        assert_eq!(classify(4, 4), Ok(PoolKind::Guarantee));
        assert_eq!(
            classify(2, 4),
            Err(ValidationError::BackwardWays {
                max_ways: 2,
                min_ways: 4
            })
        );
        assert_eq!(
            classify(4, 0),
            Err(ValidationError::ZeroMinWays { max_ways: 4 })
        );
    }

    // ==================== enforce tests ====================

    #[test]
    fn test_guarantee_takes_high_end_of_pool() {
        let mut bed = testbed(|_| {});
        let outcome = bed.ctx.enforce(request("w1", &["5"], 4, 4)).unwrap();

        assert_eq!(outcome.group_name, "w1");
        assert!(outcome.changed.is_empty());
        // Guarantee pool on cache 0 is ways 1-6; the highest 4 win. Cache 1
        // is untargeted and falls back to the OS region, which sits above
        // the pools there.
        assert_eq!(bed.resctrl_file("w1/schemata"), "L3:0=78;1=400\n");
        assert_eq!(bed.resctrl_file("w1/cpus"), "5\n");

        let record = bed.record("w1");
        assert_eq!(record.status, Status::Successful);
        assert_eq!(record.group_name.as_deref(), Some("w1"));
    }

    #[test]
    fn test_reenforce_merges_cpus() {
        let mut bed = testbed(|_| {});
        bed.ctx.enforce(request("w1", &["5"], 4, 4)).unwrap();
        bed.ctx.enforce(request("w1", &["4"], 4, 4)).unwrap();

        assert_eq!(bed.resctrl_file("w1/cpus"), "4-5\n");
        assert_eq!(bed.resctrl_file("w1/schemata"), "L3:0=78;1=400\n");
        assert_eq!(bed.record("w1").status, Status::Successful);
    }

    #[test]
    fn test_guarantee_pool_exhaustion() {
        let mut bed = testbed(|_| {});
        bed.ctx.enforce(request("w1", &["5"], 4, 4)).unwrap();
        let err = bed.ctx.enforce(request("w2", &["4"], 4, 4)).unwrap_err();
        // Only ways 1-2 remain in the guarantee pool.
        assert!(matches!(
            err,
            AllocError::InsufficientCache { cache_id: 0 }
        ));
        assert_eq!(bed.record("w2").status, Status::Failed);
    }

    #[test]
    fn test_untargeted_lines_do_not_consume_pool_ways() {
        let mut bed = testbed(|_| {});
        // w1 lives on cache 0; its cache 1 field holds only the OS region.
        bed.ctx.enforce(request("w1", &["5"], 4, 4)).unwrap();
        assert_eq!(bed.resctrl_file("w1/schemata"), "L3:0=78;1=400\n");

        // That field counts for nothing on cache 1, so a request sized to
        // the whole guarantee pool there still fits.
        let outcome = bed.ctx.enforce(request("w2", &["7"], 6, 6)).unwrap();
        assert_eq!(outcome.group_name, "w2");
        assert_eq!(bed.resctrl_file("w2/schemata"), "L3:0=1;1=3f\n");
        assert_eq!(bed.record("w2").status, Status::Successful);
    }

    #[test]
    fn test_besteffort_shrinks_sibling_to_its_minimum() {
        let mut bed = testbed(|cfg| cfg.pools.shrink = true);

        bed.ctx.enforce(request("be1", &["6"], 4, 2)).unwrap();
        // be1 owns the whole best-effort pool on cache 1, ways 6-9.
        assert_eq!(bed.resctrl_file("be1/schemata"), "L3:0=1;1=3c0\n");

        let outcome = bed.ctx.enforce(request("be2", &["6"], 9, 2)).unwrap();
        assert_eq!(outcome.changed.len(), 1);
        assert!(outcome.changed.contains_key("be1"));

        // be1 kept the low minimum run, be2 got the reclaimed ways.
        assert_eq!(bed.resctrl_file("be1/schemata"), "L3:0=1;1=c0\n");
        assert_eq!(bed.resctrl_file("be2/schemata"), "L3:0=1;1=300\n");
        assert_eq!(bed.record("be2").status, Status::Successful);
    }

    #[test]
    fn test_besteffort_fails_without_shrink() {
        let mut bed = testbed(|_| {});
        bed.ctx.enforce(request("be1", &["6"], 4, 2)).unwrap();
        let err = bed.ctx.enforce(request("be2", &["6"], 9, 2)).unwrap_err();
        assert!(matches!(
            err,
            AllocError::InsufficientCache { cache_id: 1 }
        ));
    }

    #[test]
    fn test_untracked_besteffort_group_is_internal_error() {
        let mut bed = testbed(|cfg| cfg.pools.shrink = true);
        // A group holding best-effort ways that no workload record backs.
        let rogue = bed.dir.path().join("resctrl/rogue");
        put(&rogue.join("cpus"), "6\n");
        put(&rogue.join("tasks"), "");
        put(&rogue.join("schemata"), "L3:0=1;1=3c0\n");

        let err = bed.ctx.enforce(request("be2", &["6"], 9, 2)).unwrap_err();
        assert!(matches!(err, AllocError::Internal(_)));
    }

    #[test]
    fn test_shared_pool_admission_and_quota() {
        let mut bed = testbed(|cfg| {
            cfg.pools.besteffort = 2;
            cfg.pools.shared = 2;
            cfg.pools.shared_quota = 1;
        });

        let outcome = bed.ctx.enforce(request("s1", &["5"], 0, 0)).unwrap();
        assert_eq!(outcome.group_name, "shared");
        // Shared pool sits above guarantee and best-effort: ways 9-10.
        assert_eq!(bed.resctrl_file("shared/schemata"), "L3:0=600;1=400\n");

        let err = bed.ctx.enforce(request("s2", &["5"], 0, 0)).unwrap_err();
        assert!(matches!(
            err,
            AllocError::SharedQuotaExceeded { quota: 1 }
        ));

        // Re-enforcing the same workload is not blocked by its own record.
        bed.ctx.enforce(request("s1", &["4"], 0, 0)).unwrap();
        assert_eq!(bed.resctrl_file("shared/cpus"), "4-5\n");
    }

    #[test]
    fn test_clos_exhaustion() {
        let mut bed = testbed_sized(3, |_| {});
        bed.ctx.enforce(request("w1", &["5"], 4, 4)).unwrap();
        bed.ctx.enforce(request("w2", &["3"], 2, 2)).unwrap();
        // Root, w1 and w2 occupy all three classes of service.
        let err = bed.ctx.enforce(request("w3", &["2"], 2, 2)).unwrap_err();
        assert!(matches!(err, AllocError::ClosExhausted { num_closids: 3 }));
    }

    #[test]
    fn test_task_affinity_picks_the_cache() {
        let mut bed = testbed(|_| {});
        bed.seed_task("777", "80"); // pinned to cpu 7, cache 1

        let workload = Workload {
            id: "w1".to_string(),
            task_ids: vec!["777".to_string()],
            max_ways: Some(4),
            min_ways: Some(4),
            ..Default::default()
        };
        bed.ctx.enforce(workload).unwrap();

        // Cache 1 guarantee pool is ways 0-5 (no OS shift there).
        assert_eq!(bed.resctrl_file("w1/schemata"), "L3:0=1;1=3c\n");
        assert_eq!(bed.resctrl_file("w1/tasks"), "777\n");
        assert_eq!(bed.resctrl_file("w1/cpus"), "7\n");
    }

    #[test]
    fn test_mba_only_workload() {
        let mut bed = testbed(|_| {});
        let workload = Workload {
            id: "m1".to_string(),
            core_ids: vec!["5".to_string()],
            mba_percent: Some(40),
            ..Default::default()
        };
        bed.ctx.enforce(workload).unwrap();

        // No cache line: the kernel keeps the default way mask.
        assert_eq!(bed.resctrl_file("m1/schemata"), "MB:0=40;1=100\n");
    }

    #[test]
    fn test_validation_failure_is_recorded_invalid() {
        let mut bed = testbed(|_| {});
        let workload = Workload {
            id: "w1".to_string(),
            task_ids: vec!["999".to_string()],
            max_ways: Some(4),
            min_ways: Some(4),
            ..Default::default()
        };
        let err = bed.ctx.enforce(workload).unwrap_err();
        assert!(matches!(err, AllocError::Validation(_)));

        let record = bed.record("w1");
        assert_eq!(record.status, Status::Invalid);
        assert_eq!(record.group_name, None);
    }

    // ==================== release tests ====================

    #[test]
    fn test_release_removes_group_and_record() {
        let mut bed = testbed(|_| {});
        bed.ctx.enforce(request("w1", &["5"], 4, 4)).unwrap();

        bed.ctx.release("w1").unwrap();
        assert!(!bed.dir.path().join("resctrl/w1").exists());
        assert!(bed.ctx.workloads().is_empty());

        let err = bed.ctx.release("w1").unwrap_err();
        assert!(matches!(err, AllocError::UnknownWorkload(_)));
    }

    #[test]
    fn test_release_shared_moves_tasks_out() {
        let mut bed = testbed(|cfg| {
            cfg.pools.besteffort = 2;
            cfg.pools.shared = 2;
        });
        bed.seed_task("321", "c0");

        let workload = Workload {
            id: "s1".to_string(),
            task_ids: vec!["321".to_string()],
            max_ways: Some(0),
            min_ways: Some(0),
            ..Default::default()
        };
        bed.ctx.enforce(workload).unwrap();
        assert_eq!(bed.resctrl_file("shared/tasks"), "321\n");

        bed.ctx.release("s1").unwrap();
        // The shared group survives, the tasks go back to the root group.
        assert!(bed.dir.path().join("resctrl/shared").exists());
        assert_eq!(bed.resctrl_file("tasks"), "321\n");
        assert!(bed.ctx.workloads().is_empty());
    }

    // ==================== setup tests ====================

    #[test]
    fn test_setup_partitions_root_and_infra() {
        let mut bed = testbed(|cfg| {
            cfg.infra.cpus = "1".to_string();
            cfg.infra.tasks = vec!["55".to_string(), "56".to_string()];
        });
        bed.seed_task("55", "2");

        bed.ctx.setup().unwrap();

        // The host region is way 0 on cache 0 and way 10 on cache 1, where
        // the pools are not shifted.
        assert_eq!(bed.resctrl_file("schemata"), "L3:0=1;1=400\n");
        assert_eq!(bed.resctrl_file("infra/cpus"), "1\n");
        // Task 56 is not alive and gets skipped.
        assert_eq!(bed.resctrl_file("infra/tasks"), "55\n");
        assert_eq!(bed.resctrl_file("infra/schemata"), "L3:0=1;1=400\n");
    }
}
