// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Mechanism library for the waypool partitioner
//!
//! waypool splits a host's shared CPU caches (and, where present, memory
//! bandwidth) among competing workloads through the kernel's resctrl
//! interface. This crate holds the mechanisms that policy code builds on:
//!
//! - [`Bitmask`]: fixed-origin bit-vector algebra for CPU sets and cache-way
//!   masks, with the contiguous-run queries way placement is made of.
//! - [`ResctrlFs`]/[`ResGroup`]: the resource-control tree model — parsing
//!   the kernel's group files into records and writing records back.
//! - [`TaskFlow`] and [`commit`]: transactional group writes with
//!   compensating rollback.
//! - [`CacheTopology`]: which CPUs share which cache instance.
//! - [`proc`] and [`LockFile`]: procfs collaborators and the advisory lock
//!   serializing snapshot-compute-commit sequences.

mod bitmask;
pub use bitmask::BinaryRuns;
pub use bitmask::BitRun;
pub use bitmask::Bitmask;

mod commit;
pub use commit::commit;

mod flock;
pub use flock::LockFile;

pub mod proc;

mod resctrl;
pub use resctrl::CacheAlloc;
pub use resctrl::MbAlloc;
pub use resctrl::RdtInfo;
pub use resctrl::ResGroup;
pub use resctrl::ResctrlFs;
pub use resctrl::ROOT_GROUP;

mod taskflow;
pub use taskflow::CommitError;
pub use taskflow::Step;
pub use taskflow::TaskFlow;

mod topology;
pub use topology::CacheNode;
pub use topology::CacheTopology;
