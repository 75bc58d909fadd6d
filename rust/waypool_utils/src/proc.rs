// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! procfs collaborators: resctrl mount discovery, task liveness, and task
//! CPU affinity. All readers take an explicit root in their `_in` form so
//! tests can point them at fixture trees.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::bitmask::Bitmask;

const PROC_DIR: &str = "/proc";

/// Where resctrl is mounted and how bandwidth throttling is expressed.
#[derive(Debug, Clone)]
pub struct ResctrlMount {
    pub path: PathBuf,
    /// Set when the mount carries the `mba_MBps` option: `MB:` schemata
    /// values are MBps instead of percent.
    pub mba_mbps: bool,
}

/// Find the resctrl mount point in `/proc/mounts`.
pub fn resctrl_mount() -> Result<ResctrlMount> {
    resctrl_mount_in(&Path::new(PROC_DIR).join("mounts"))
}

fn resctrl_mount_in(path: &Path) -> Result<ResctrlMount> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    for line in text.lines() {
        // source mountpoint fstype options dump pass
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "resctrl" {
            continue;
        }
        return Ok(ResctrlMount {
            path: PathBuf::from(fields[1]),
            mba_mbps: fields[3].split(',').any(|opt| opt == "mba_MBps"),
        });
    }
    bail!("resctrl filesystem is not mounted");
}

/// True when the process id still has a procfs entry.
pub fn task_alive(pid: &str) -> bool {
    task_alive_in(Path::new(PROC_DIR), pid)
}

/// Variant rooted at an arbitrary directory, for callers working against a
/// staged procfs tree.
pub fn task_alive_in(proc_root: &Path, pid: &str) -> bool {
    proc_root.join(pid).is_dir()
}

/// The CPUs a task may run on, from the `Cpus_allowed` line of its status
/// file, clamped to `nr_cpus`.
pub fn task_cpus_allowed(pid: &str, nr_cpus: usize) -> Result<Bitmask> {
    task_cpus_allowed_in(Path::new(PROC_DIR), pid, nr_cpus)
}

pub fn task_cpus_allowed_in(proc_root: &Path, pid: &str, nr_cpus: usize) -> Result<Bitmask> {
    let path = proc_root.join(pid).join("status");
    let text =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Cpus_allowed:") {
            let mask = Bitmask::from_hex(None, rest.trim())
                .with_context(|| format!("Failed to parse Cpus_allowed of task {pid}"))?;
            return Ok(mask.and(&Bitmask::full(nr_cpus)));
        }
    }
    bail!("no Cpus_allowed line in {}", path.display());
}
