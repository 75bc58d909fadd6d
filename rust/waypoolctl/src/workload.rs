// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Workload requests and their validation. A workload names the cores and
//! tasks it covers plus what it wants from the cache and bandwidth pools,
//! either as explicit way counts or by naming a configured policy.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use waypool_utils::{proc, Bitmask, RdtInfo};

use crate::config::Config;

/// Group names a workload may never claim for itself.
const RESERVED_NAMES: [&str; 6] = [".", "..", "info", "mon_data", "mon_groups", "infra"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    None,
    Successful,
    Failed,
    Invalid,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::None => write!(f, "none"),
            Status::Successful => write!(f, "successful"),
            Status::Failed => write!(f, "failed"),
            Status::Invalid => write!(f, "invalid"),
        }
    }
}

/// One partitioning request, also the persisted record of its outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workload {
    pub id: String,
    /// Core numbers as decimal text, the way they arrive on the wire.
    pub core_ids: Vec<String>,
    /// Process ids as decimal text.
    pub task_ids: Vec<String>,
    pub max_ways: Option<u32>,
    pub min_ways: Option<u32>,
    pub policy: Option<String>,
    /// Bandwidth percent, or MBps when the mount runs in `mba_MBps` mode.
    pub mba_percent: Option<u32>,
    /// Resource group serving this workload once enforced.
    pub group_name: Option<String>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    BadName(String),
    EmptyTarget,
    BadCoreId(String),
    BadTaskId(String),
    DeadTask(String),
    UnknownPolicy(String),
    ConflictingRequest,
    PartialWays,
    NoResourceRequest,
    BackwardWays { max_ways: u32, min_ways: u32 },
    ZeroMinWays { max_ways: u32 },
    BelowMinBits { min_ways: u32, min_cbm_bits: usize },
    BadMbaValue(u32),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::BadName(id) => {
                write!(f, "workload name {id:?} is not usable as a group name")
            }
            ValidationError::EmptyTarget => {
                write!(f, "workload targets no cores and no tasks")
            }
            ValidationError::BadCoreId(core) => {
                write!(f, "core id {core:?} is not a valid CPU number")
            }
            ValidationError::BadTaskId(task) => {
                write!(f, "task id {task:?} is not a process id")
            }
            ValidationError::DeadTask(task) => write!(f, "task {task} is not running"),
            ValidationError::UnknownPolicy(name) => {
                write!(f, "policy {name:?} is not configured")
            }
            ValidationError::ConflictingRequest => {
                write!(f, "request carries both a policy and explicit way counts")
            }
            ValidationError::PartialWays => {
                write!(f, "max_ways and min_ways must be given together")
            }
            ValidationError::NoResourceRequest => {
                write!(f, "request asks for no cache ways and no memory bandwidth")
            }
            ValidationError::BackwardWays { max_ways, min_ways } => {
                write!(f, "max_ways {max_ways} is less than min_ways {min_ways}")
            }
            ValidationError::ZeroMinWays { max_ways } => {
                write!(
                    f,
                    "a request for up to {max_ways} ways needs a non-zero min_ways"
                )
            }
            ValidationError::BelowMinBits {
                min_ways,
                min_cbm_bits,
            } => write!(
                f,
                "min_ways {min_ways} is below the hardware minimum of {min_cbm_bits} bits"
            ),
            ValidationError::BadMbaValue(value) => {
                write!(f, "memory bandwidth value {value} is out of range")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl Workload {
    /// The way counts this request resolves to: a named policy's counts, the
    /// explicit pair, or `None` for a bandwidth-only request.
    pub fn effective_ways(&self, cfg: &Config) -> Result<Option<(u32, u32)>, ValidationError> {
        let explicit = self.max_ways.is_some() || self.min_ways.is_some();
        match &self.policy {
            Some(name) => {
                if explicit {
                    return Err(ValidationError::ConflictingRequest);
                }
                let policy = cfg
                    .policy(name)
                    .ok_or_else(|| ValidationError::UnknownPolicy(name.clone()))?;
                Ok(Some((policy.max_ways, policy.min_ways)))
            }
            None => match (self.max_ways, self.min_ways) {
                (Some(max_ways), Some(min_ways)) => Ok(Some((max_ways, min_ways))),
                (None, None) => Ok(None),
                _ => Err(ValidationError::PartialWays),
            },
        }
    }

    /// The explicitly requested cores as a mask over `nr_cpus`.
    pub fn requested_cores(&self, nr_cpus: usize) -> Result<Bitmask, ValidationError> {
        let mut cpus = Bitmask::new(nr_cpus);
        for core in &self.core_ids {
            let bit: usize = core
                .parse()
                .map_err(|_| ValidationError::BadCoreId(core.clone()))?;
            cpus.set_bit(bit)
                .map_err(|_| ValidationError::BadCoreId(core.clone()))?;
        }
        Ok(cpus)
    }

    pub fn validate(
        &self,
        cfg: &Config,
        info: &RdtInfo,
        nr_cpus: usize,
        mba_mbps: bool,
        proc_root: &Path,
    ) -> Result<(), ValidationError> {
        if !name_usable(&self.id) || self.id == cfg.pools.shared_group {
            return Err(ValidationError::BadName(self.id.clone()));
        }
        if self.core_ids.is_empty() && self.task_ids.is_empty() {
            return Err(ValidationError::EmptyTarget);
        }
        self.requested_cores(nr_cpus)?;
        for task in &self.task_ids {
            if task.is_empty() || !task.chars().all(|c| c.is_ascii_digit()) {
                return Err(ValidationError::BadTaskId(task.clone()));
            }
            if !proc::task_alive_in(proc_root, task) {
                return Err(ValidationError::DeadTask(task.clone()));
            }
        }

        let ways = self.effective_ways(cfg)?;
        if ways.is_none() && self.mba_percent.is_none() {
            return Err(ValidationError::NoResourceRequest);
        }
        if let Some((max_ways, min_ways)) = ways {
            if max_ways < min_ways {
                return Err(ValidationError::BackwardWays { max_ways, min_ways });
            }
            if min_ways > 0 && (min_ways as usize) < info.min_cbm_bits {
                return Err(ValidationError::BelowMinBits {
                    min_ways,
                    min_cbm_bits: info.min_cbm_bits,
                });
            }
        }
        if let Some(value) = self.mba_percent {
            let out_of_range = value == 0 || (!mba_mbps && value > 100);
            if out_of_range {
                return Err(ValidationError::BadMbaValue(value));
            }
        }
        Ok(())
    }
}

fn name_usable(id: &str) -> bool {
    !id.is_empty()
        && !RESERVED_NAMES.contains(&id)
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
