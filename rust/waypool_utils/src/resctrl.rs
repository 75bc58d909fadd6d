// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Resource-control tree model.
//!
//! [`ResctrlFs`] binds a resctrl mount point (or any directory shaped like
//! one, for tests) and translates between the kernel's file formats and
//! [`ResGroup`] records: `cpus` holds core-range text, `tasks` one process id
//! per line, `schemata` the per-resource allocation lines
//! (`L3:0=7ff;1=3ff`, `MB:0=100;1=50`). RDT capability limits come from the
//! `info` directory at construction time.
//!
//! Scans run concurrently with kernel-driven group changes, so a group file
//! that fails to decode is logged and skipped for that field only; a scan
//! never hard-fails on one bad group.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::warn;
use sscanf::sscanf;

use crate::bitmask::Bitmask;
use crate::proc;

/// Name under which the resctrl root's own files appear in a group scan.
pub const ROOT_GROUP: &str = ".";

/// Directories under the root that are never allocation groups.
const SKIP_DIRS: [&str; 3] = ["info", "mon_data", "mon_groups"];

/// Capability limits of one cache level, from `<root>/info/<level>/`.
#[derive(Debug, Clone)]
pub struct RdtInfo {
    /// The full way mask the hardware exposes, e.g. `7ff` for 11 ways.
    pub cbm_mask: Bitmask,
    /// Way-mask width in bits, one past the highest bit of `cbm_mask`.
    pub cbm_len: usize,
    /// Smallest number of contiguous ways a schemata write may carry.
    pub min_cbm_bits: usize,
    /// Hardware classes of service, counting the root group.
    pub num_closids: usize,
}

impl RdtInfo {
    fn from_dir(dir: &Path) -> Result<RdtInfo> {
        let cbm_text = read_trimmed(&dir.join("cbm_mask"))?;
        let cbm_mask = Bitmask::from_hex(None, &cbm_text)
            .with_context(|| format!("Failed to parse cbm_mask in {}", dir.display()))?;
        let cbm_len = match cbm_mask.max_set_bit() {
            Some(bit) => bit + 1,
            None => bail!("cbm_mask in {} has no bits set", dir.display()),
        };
        Ok(RdtInfo {
            cbm_mask,
            cbm_len,
            min_cbm_bits: read_parsed(&dir.join("min_cbm_bits"))?,
            num_closids: read_parsed(&dir.join("num_closids"))?,
        })
    }
}

/// One cache-way assignment within a schemata line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheAlloc {
    pub cache_id: u32,
    pub mask: Bitmask,
}

/// One memory-bandwidth assignment within an `MB:` schemata line. The value
/// is a percentage, or MBps when the mount runs in `mba_MBps` mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MbAlloc {
    pub cache_id: u32,
    pub value: u32,
}

/// In-memory image of one resource group directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResGroup {
    pub cpus: Bitmask,
    pub tasks: Vec<String>,
    /// Cache-level tag ("L3") to its per-cache-id way masks, in file order.
    pub cache_schemata: BTreeMap<String, Vec<CacheAlloc>>,
    /// "MB" to its per-cache-id bandwidth values, in file order.
    pub mba_schemata: BTreeMap<String, Vec<MbAlloc>>,
}

impl ResGroup {
    /// The way mask this group holds on one cache instance, if any.
    pub fn mask_for(&self, level: &str, cache_id: u32) -> Option<&Bitmask> {
        self.cache_schemata
            .get(level)?
            .iter()
            .find(|a| a.cache_id == cache_id)
            .map(|a| &a.mask)
    }

    /// Render the schemata file body, cache lines first, without a trailing
    /// newline.
    pub fn schemata_text(&self) -> String {
        let mut lines = Vec::new();
        for (level, allocs) in &self.cache_schemata {
            let fields: Vec<String> = allocs
                .iter()
                .map(|a| format!("{}={}", a.cache_id, a.mask.to_hex_string()))
                .collect();
            lines.push(format!("{}:{}", level, fields.join(";")));
        }
        for (tag, allocs) in &self.mba_schemata {
            let fields: Vec<String> = allocs
                .iter()
                .map(|a| format!("{}={}", a.cache_id, a.value))
                .collect();
            lines.push(format!("{}:{}", tag, fields.join(";")));
        }
        lines.join("\n")
    }
}

/// Handle on a resctrl mount point.
#[derive(Debug)]
pub struct ResctrlFs {
    root: PathBuf,
    nr_cpus: usize,
    mba_mbps: bool,
    info: BTreeMap<String, RdtInfo>,
}

impl ResctrlFs {
    /// Bind the live resctrl mount discovered from `/proc/mounts`.
    pub fn mount(nr_cpus: usize) -> Result<Self> {
        let mount = proc::resctrl_mount().context("Failed to locate the resctrl mount")?;
        Self::with_root(mount.path, nr_cpus, mount.mba_mbps)
    }

    /// Bind an explicit root directory shaped like a resctrl tree.
    pub fn at(root: impl AsRef<Path>, nr_cpus: usize) -> Result<Self> {
        Self::with_root(root.as_ref().to_path_buf(), nr_cpus, false)
    }

    fn with_root(root: PathBuf, nr_cpus: usize, mba_mbps: bool) -> Result<Self> {
        if !root.is_dir() {
            bail!("resctrl root {} is not a directory", root.display());
        }
        let info = read_info(&root.join("info"))?;
        Ok(Self {
            root,
            nr_cpus,
            mba_mbps,
            info,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// True when the mount throttles bandwidth in MBps rather than percent.
    pub fn mba_mbps(&self) -> bool {
        self.mba_mbps
    }

    pub fn info(&self) -> &BTreeMap<String, RdtInfo> {
        &self.info
    }

    pub fn level_info(&self, level: &str) -> Result<&RdtInfo> {
        self.info
            .get(level)
            .ok_or_else(|| anyhow!("no RDT info for cache level {:?}", level))
    }

    /// Snapshot every allocation group. The root's own files become entry
    /// `"."`; `info`, monitoring directories, and names in `ignore` are
    /// passed over.
    pub fn groups(&self, ignore: &[&str]) -> Result<BTreeMap<String, ResGroup>> {
        let mut groups = BTreeMap::new();
        groups.insert(ROOT_GROUP.to_string(), self.read_group(ROOT_GROUP));
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read resctrl root {}", self.root.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("Failed to read directory entry in {}", self.root.display())
            })?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if SKIP_DIRS.contains(&name.as_str()) || ignore.contains(&name.as_str()) {
                continue;
            }
            groups.insert(name.clone(), self.read_group(&name));
        }
        Ok(groups)
    }

    /// Read one group without scanning the whole tree. Fields that fail to
    /// decode are logged and left at their defaults.
    pub fn read_group(&self, name: &str) -> ResGroup {
        let path = self.group_path(name);
        let mut group = ResGroup::default();

        match read_trimmed(&path.join("cpus")) {
            Ok(text) if text.is_empty() => group.cpus = Bitmask::new(self.nr_cpus),
            Ok(text) => match Bitmask::from_spec(Some(self.nr_cpus), &text) {
                Ok(mask) => group.cpus = mask,
                Err(e) => warn!("Skipping cpus of group {:?}: {:#}", name, e),
            },
            Err(e) => warn!("Skipping cpus of group {:?}: {:#}", name, e),
        }

        match fs::read_to_string(path.join("tasks")) {
            Ok(text) => {
                group.tasks = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            Err(e) => warn!("Skipping tasks of group {:?}: {}", name, e),
        }

        match read_trimmed(&path.join("schemata")).and_then(|text| self.parse_schemata(&text)) {
            Ok((cache, mba)) => {
                group.cache_schemata = cache;
                group.mba_schemata = mba;
            }
            Err(e) => warn!("Skipping schemata of group {:?}: {:#}", name, e),
        }

        group
    }

    #[allow(clippy::type_complexity)]
    fn parse_schemata(
        &self,
        text: &str,
    ) -> Result<(
        BTreeMap<String, Vec<CacheAlloc>>,
        BTreeMap<String, Vec<MbAlloc>>,
    )> {
        let mut cache = BTreeMap::new();
        let mut mba = BTreeMap::new();
        for line in text.lines() {
            // The kernel indents schemata lines.
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (tag, rest) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("schemata line {:?} has no resource tag", line))?;
            if tag == "MB" {
                let mut allocs = Vec::new();
                for field in rest.split(';') {
                    let (cache_id, value) = sscanf!(field.trim(), "{u32}={u32}")
                        .map_err(|_| anyhow!("malformed bandwidth field {:?}", field))?;
                    allocs.push(MbAlloc { cache_id, value });
                }
                mba.insert(tag.to_string(), allocs);
            } else {
                let len = self.info.get(tag).map(|i| i.cbm_len);
                let mut allocs = Vec::new();
                for field in rest.split(';') {
                    let (id_text, mask_text) = field
                        .trim()
                        .split_once('=')
                        .ok_or_else(|| anyhow!("malformed schemata field {:?}", field))?;
                    let cache_id = id_text
                        .parse::<u32>()
                        .with_context(|| format!("bad cache id in field {:?}", field))?;
                    let mask = Bitmask::from_hex(len, mask_text)?;
                    allocs.push(CacheAlloc { cache_id, mask });
                }
                cache.insert(tag.to_string(), allocs);
            }
        }
        Ok((cache, mba))
    }

    pub fn group_path(&self, name: &str) -> PathBuf {
        if name == ROOT_GROUP {
            self.root.clone()
        } else {
            self.root.join(name)
        }
    }

    pub fn group_exists(&self, name: &str) -> bool {
        self.group_path(name).is_dir()
    }

    pub fn create_group(&self, name: &str) -> Result<()> {
        let path = self.group_path(name);
        fs::create_dir(&path)
            .with_context(|| format!("Failed to create group {}", path.display()))
    }

    pub fn remove_group(&self, name: &str) -> Result<()> {
        if name == ROOT_GROUP {
            bail!("refusing to remove the resctrl root");
        }
        let path = self.group_path(name);
        // Kernel group directories rmdir cleanly while still holding their
        // control files; plain directory trees need the recursive form.
        if fs::remove_dir(&path).is_err() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to remove group {}", path.display()))?;
        }
        Ok(())
    }

    /// Write the group's CPU set as core-range text. An empty set is not
    /// writable through the kernel interface and is skipped.
    pub fn write_cpus(&self, name: &str, cpus: &Bitmask) -> Result<()> {
        let text = cpus.to_human_string();
        if text.is_empty() {
            return Ok(());
        }
        write_line(&self.group_path(name).join("cpus"), &text)
    }

    /// Move each listed task into the group. The kernel accepts one process
    /// id per write call.
    pub fn write_tasks(&self, name: &str, tasks: &[String]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let path = self.group_path(name).join("tasks");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        for task in tasks {
            file.write_all(format!("{task}\n").as_bytes())
                .with_context(|| format!("Failed to move task {} into {}", task, path.display()))?;
        }
        Ok(())
    }

    pub fn write_schemata(&self, name: &str, group: &ResGroup) -> Result<()> {
        let text = group.schemata_text();
        if text.is_empty() {
            return Ok(());
        }
        write_line(&self.group_path(name).join("schemata"), &text)
    }

    pub fn write_group(&self, name: &str, group: &ResGroup) -> Result<()> {
        self.write_cpus(name, &group.cpus)?;
        self.write_tasks(name, &group.tasks)?;
        self.write_schemata(name, group)
    }
}

fn read_info(dir: &Path) -> Result<BTreeMap<String, RdtInfo>> {
    let mut info = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(info);
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", dir.display()))?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_cache_level(&name) {
            continue;
        }
        let rdt = RdtInfo::from_dir(&entry.path())
            .with_context(|| format!("Failed to read RDT info for {name}"))?;
        info.insert(name, rdt);
    }
    Ok(info)
}

// Cache allocation levels: L3, L2, and their CDP variants. Monitoring
// (L3_MON) and bandwidth (MB) info directories have different contents.
fn is_cache_level(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0] == b'L' && bytes[1].is_ascii_digit() && !name.ends_with("_MON")
}

fn read_trimmed(path: &Path) -> Result<String> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(text.trim().to_string())
}

fn read_parsed(path: &Path) -> Result<usize> {
    read_trimmed(path)?
        .parse::<usize>()
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_line(path: &Path, text: &str) -> Result<()> {
    let mut payload = text.to_string();
    if !payload.ends_with('\n') {
        payload.push('\n');
    }
    fs::write(path, payload).with_context(|| format!("Failed to write {}", path.display()))
}
