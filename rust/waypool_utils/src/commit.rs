// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Transactional resctrl group commit.
//!
//! One commit is a [`TaskFlow`] over the group's kernel files:
//! `[create-group?, write-cpus, write-tasks, write-schemata]`. The create
//! step only appears when the group directory is missing, and then the three
//! writes are non-revertible — removing the fresh directory discards them
//! wholesale. Against a pre-existing group the writes revert from the
//! pre-commit snapshot instead.

use anyhow::Result;

use crate::bitmask::Bitmask;
use crate::resctrl::ResGroup;
use crate::resctrl::ResctrlFs;
use crate::resctrl::ROOT_GROUP;
use crate::taskflow::CommitError;
use crate::taskflow::Step;
use crate::taskflow::TaskFlow;

/// Write one group transactionally. When the group directory already exists,
/// `snapshot` (or a fresh read when `None`) supplies the rollback state: a
/// failed commit restores `cpus` and `tasks` to it, while `schemata` stays
/// at whatever was last written — callers recompute way availability from a
/// fresh tree scan rather than relying on schemata rollback. When the
/// directory is missing it is created, and rollback is its removal.
pub fn commit(
    fs: &ResctrlFs,
    name: &str,
    group: &ResGroup,
    snapshot: Option<&ResGroup>,
) -> Result<(), CommitError> {
    let prev = if fs.group_exists(name) {
        Some(match snapshot {
            Some(s) => s.clone(),
            None => fs.read_group(name),
        })
    } else {
        None
    };
    TaskFlow::new(format!("commit:{name}"), build_steps(fs, name, group, prev)).run()
}

/// Assemble the step sequence. `prev` is `None` exactly when the group
/// directory has to be created first.
fn build_steps<'a>(
    fs: &'a ResctrlFs,
    name: &'a str,
    group: &ResGroup,
    prev: Option<ResGroup>,
) -> Vec<Box<dyn Step + 'a>> {
    let mut steps: Vec<Box<dyn Step + 'a>> = Vec::new();
    if prev.is_none() {
        steps.push(Box::new(CreateGroup { fs, name }));
    }
    steps.push(Box::new(WriteCpus {
        fs,
        name,
        cpus: group.cpus.clone(),
        prev: prev.as_ref().map(|p| p.cpus.clone()),
    }));
    steps.push(Box::new(WriteTasks {
        fs,
        name,
        tasks: group.tasks.clone(),
        prev: prev.as_ref().map(|p| p.tasks.clone()),
    }));
    steps.push(Box::new(WriteSchemata {
        fs,
        name,
        group: group.clone(),
    }));
    steps
}

struct CreateGroup<'a> {
    fs: &'a ResctrlFs,
    name: &'a str,
}

impl Step for CreateGroup<'_> {
    fn name(&self) -> &str {
        "create-group"
    }

    fn run(&mut self) -> Result<()> {
        self.fs.create_group(self.name)
    }

    fn revert(&mut self) -> Result<()> {
        self.fs.remove_group(self.name)
    }
}

struct WriteCpus<'a> {
    fs: &'a ResctrlFs,
    name: &'a str,
    cpus: Bitmask,
    prev: Option<Bitmask>,
}

impl Step for WriteCpus<'_> {
    fn name(&self) -> &str {
        "write-cpus"
    }

    fn run(&mut self) -> Result<()> {
        self.fs.write_cpus(self.name, &self.cpus)
    }

    fn revert(&mut self) -> Result<()> {
        match &self.prev {
            Some(prev) => self.fs.write_cpus(self.name, prev),
            None => Ok(()),
        }
    }

    fn revertible(&self) -> bool {
        self.prev.is_some()
    }
}

struct WriteTasks<'a> {
    fs: &'a ResctrlFs,
    name: &'a str,
    tasks: Vec<String>,
    prev: Option<Vec<String>>,
}

impl Step for WriteTasks<'_> {
    fn name(&self) -> &str {
        "write-tasks"
    }

    fn run(&mut self) -> Result<()> {
        self.fs.write_tasks(self.name, &self.tasks)
    }

    fn revert(&mut self) -> Result<()> {
        let prev = match &self.prev {
            Some(prev) => prev,
            None => return Ok(()),
        };
        // Re-writing the snapshot list moves removed tasks back into the
        // group; tasks the commit added are handed to the default group so
        // none end up unaccounted for.
        self.fs.write_tasks(self.name, prev)?;
        let added: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| !prev.contains(t))
            .cloned()
            .collect();
        self.fs.write_tasks(ROOT_GROUP, &added)
    }

    fn revertible(&self) -> bool {
        self.prev.is_some()
    }
}

struct WriteSchemata<'a> {
    fs: &'a ResctrlFs,
    name: &'a str,
    group: ResGroup,
}

impl Step for WriteSchemata<'_> {
    fn name(&self) -> &str {
        "write-schemata"
    }

    fn run(&mut self) -> Result<()> {
        self.fs.write_schemata(self.name, &self.group)
    }

    fn revert(&mut self) -> Result<()> {
        // Schemata writes stay in place on rollback.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn put(path: &Path, text: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }

    fn seed_tree(root: &Path) {
        put(&root.join("info/L3/cbm_mask"), "7ff\n");
        put(&root.join("info/L3/min_cbm_bits"), "2\n");
        put(&root.join("info/L3/num_closids"), "8\n");
        put(&root.join("cpus"), "0-7\n");
        put(&root.join("tasks"), "1\n");
        put(&root.join("schemata"), "L3:0=7ff\n");
        put(&root.join("p1/cpus"), "2-3\n");
        put(&root.join("p1/tasks"), "100\n200\n");
        put(&root.join("p1/schemata"), "L3:0=f0\n");
    }

    fn sample_group(rfs: &ResctrlFs, cpus: &str, tasks: &[&str], mask: &str) -> ResGroup {
        let mut group = ResGroup {
            cpus: Bitmask::from_spec(Some(rfs.nr_cpus()), cpus).unwrap(),
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        group.cache_schemata.insert(
            "L3".to_string(),
            vec![crate::resctrl::CacheAlloc {
                cache_id: 0,
                mask: Bitmask::from_hex(Some(11), mask).unwrap(),
            }],
        );
        group
    }

    #[test]
    fn test_commit_creates_missing_group() {
        let tmp = TempDir::new().unwrap();
        seed_tree(tmp.path());
        let rfs = ResctrlFs::at(tmp.path(), 8).unwrap();

        let group = sample_group(&rfs, "4-5", &["300"], "780");
        commit(&rfs, "p2", &group, None).unwrap();

        assert!(rfs.group_exists("p2"));
        assert_eq!(
            fs::read_to_string(tmp.path().join("p2/cpus")).unwrap(),
            "4-5\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("p2/tasks")).unwrap(),
            "300\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("p2/schemata")).unwrap(),
            "L3:0=780\n"
        );
    }

    #[test]
    fn test_commit_updates_existing_group() {
        let tmp = TempDir::new().unwrap();
        seed_tree(tmp.path());
        let rfs = ResctrlFs::at(tmp.path(), 8).unwrap();
        let snapshot = rfs.read_group("p1");

        let group = sample_group(&rfs, "4-5", &["100", "300"], "700");
        commit(&rfs, "p1", &group, Some(&snapshot)).unwrap();

        assert_eq!(
            fs::read_to_string(tmp.path().join("p1/cpus")).unwrap(),
            "4-5\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("p1/tasks")).unwrap(),
            "100\n300\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("p1/schemata")).unwrap(),
            "L3:0=700\n"
        );
    }

    #[test]
    fn test_schemata_failure_rolls_back_cpus_and_tasks() {
        let tmp = TempDir::new().unwrap();
        seed_tree(tmp.path());
        let rfs = ResctrlFs::at(tmp.path(), 8).unwrap();
        let snapshot = rfs.read_group("p1");

        // Writing to a directory named schemata fails with EISDIR.
        fs::remove_file(tmp.path().join("p1/schemata")).unwrap();
        fs::create_dir(tmp.path().join("p1/schemata")).unwrap();

        let group = sample_group(&rfs, "4-5", &["100", "300"], "700");
        let err = commit(&rfs, "p1", &group, Some(&snapshot)).unwrap_err();
        assert_eq!(err.step, "write-schemata");
        assert!(err.rollback_failures.is_empty());

        // cpus and tasks are back at the snapshot.
        assert_eq!(
            fs::read_to_string(tmp.path().join("p1/cpus")).unwrap(),
            "2-3\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("p1/tasks")).unwrap(),
            "100\n200\n"
        );
        // The task the commit added went to the default group.
        assert!(fs::read_to_string(tmp.path().join("tasks"))
            .unwrap()
            .contains("300"));
        // Schemata stays at whatever the failing step left behind.
        assert!(tmp.path().join("p1/schemata").is_dir());
    }

    #[test]
    fn test_rollback_snapshot_is_captured_when_not_supplied() {
        let tmp = TempDir::new().unwrap();
        seed_tree(tmp.path());
        let rfs = ResctrlFs::at(tmp.path(), 8).unwrap();

        fs::remove_file(tmp.path().join("p1/schemata")).unwrap();
        fs::create_dir(tmp.path().join("p1/schemata")).unwrap();

        let group = sample_group(&rfs, "6", &["400"], "700");
        let err = commit(&rfs, "p1", &group, None).unwrap_err();
        assert_eq!(err.step, "write-schemata");
        assert_eq!(
            fs::read_to_string(tmp.path().join("p1/cpus")).unwrap(),
            "2-3\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("p1/tasks")).unwrap(),
            "100\n200\n"
        );
    }

    struct FailingStep;

    impl Step for FailingStep {
        fn name(&self) -> &str {
            "injected-failure"
        }

        fn run(&mut self) -> Result<()> {
            bail!("injected")
        }

        fn revert(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failure_after_fresh_create_removes_directory() {
        let tmp = TempDir::new().unwrap();
        seed_tree(tmp.path());
        let rfs = ResctrlFs::at(tmp.path(), 8).unwrap();

        let group = sample_group(&rfs, "4-5", &["300"], "780");
        let mut steps = build_steps(&rfs, "p2", &group, None);
        steps.push(Box::new(FailingStep));
        let err = TaskFlow::new("commit:p2", steps).run().unwrap_err();
        assert_eq!(err.step, "injected-failure");

        // The whole directory is gone, writes included.
        assert!(!tmp.path().join("p2").exists());
    }

    #[test]
    fn test_create_failure_reverts_nothing() {
        let tmp = TempDir::new().unwrap();
        seed_tree(tmp.path());
        let rfs = ResctrlFs::at(tmp.path(), 8).unwrap();

        // A plain file squatting on the group name makes create_dir fail.
        put(&tmp.path().join("p2"), "");
        let group = sample_group(&rfs, "4-5", &["300"], "780");
        let err = commit(&rfs, "p2", &group, None).unwrap_err();
        assert_eq!(err.step, "create-group");
        assert!(tmp.path().join("p2").is_file());
    }
}
