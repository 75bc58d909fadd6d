// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Workload record persistence. The allocation engine tracks every request
//! it has seen in a store so that shrink decisions and shared-pool quota
//! checks can see allocations made by earlier invocations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::workload::{Status, Workload};

pub trait WorkloadStore {
    fn get(&self, id: &str) -> Option<Workload>;
    fn put(&mut self, workload: Workload) -> Result<()>;
    fn remove(&mut self, id: &str) -> Result<Option<Workload>>;
    fn all(&self) -> Vec<Workload>;
    /// The record backing a resource group, if any.
    fn workload_for_group(&self, group: &str) -> Option<Workload>;
    /// How many records point at `group` with the given status.
    fn live_count(&self, group: &str, status: Status) -> usize;
}

/// Store backed by one JSON file, rewritten on every mutation. Records are
/// held in memory between mutations; the file is the source of truth only
/// across process runs.
pub struct JsonStore {
    path: PathBuf,
    records: BTreeMap<String, Workload>,
}

impl JsonStore {
    pub fn open(path: impl AsRef<Path>) -> Result<JsonStore> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse store {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(JsonStore { path, records })
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.records)?;
        fs::write(&self.path, text)
            .with_context(|| format!("Failed to write store {}", self.path.display()))
    }
}

impl WorkloadStore for JsonStore {
    fn get(&self, id: &str) -> Option<Workload> {
        self.records.get(id).cloned()
    }

    fn put(&mut self, workload: Workload) -> Result<()> {
        self.records.insert(workload.id.clone(), workload);
        self.save()
    }

    fn remove(&mut self, id: &str) -> Result<Option<Workload>> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    fn all(&self) -> Vec<Workload> {
        self.records.values().cloned().collect()
    }

    fn workload_for_group(&self, group: &str) -> Option<Workload> {
        self.records
            .values()
            .find(|workload| workload.group_name.as_deref() == Some(group))
            .cloned()
    }

    fn live_count(&self, group: &str, status: Status) -> usize {
        self.records
            .values()
            .filter(|workload| {
                workload.group_name.as_deref() == Some(group) && workload.status == status
            })
            .count()
    }
}
