// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Ordered steps with compensating rollback.
//!
//! A [`TaskFlow`] runs its steps in order and stops at the first failure,
//! then reverts every already-completed step in reverse order. Steps that
//! report themselves non-revertible are skipped during rollback; revert
//! failures are logged and collected into the returned [`CommitError`],
//! never escalated.

use std::fmt;

use anyhow::Result;
use log::debug;
use log::warn;

/// One named unit of work with a compensating action.
pub trait Step {
    fn name(&self) -> &str;

    fn run(&mut self) -> Result<()>;

    fn revert(&mut self) -> Result<()>;

    /// Whether rollback should invoke [`Step::revert`] for this step.
    fn revertible(&self) -> bool {
        true
    }
}

/// Why a flow failed: the step that broke, its error, and any revert
/// failures hit while unwinding.
#[derive(Debug)]
pub struct CommitError {
    pub flow: String,
    pub step: String,
    pub source: anyhow::Error,
    pub rollback_failures: Vec<(String, anyhow::Error)>,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow {:?} failed at step {:?}: {:#}",
            self.flow, self.step, self.source
        )?;
        for (step, err) in &self.rollback_failures {
            write!(f, "; rollback of {:?} also failed: {:#}", step, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommitError {}

pub struct TaskFlow<'a> {
    name: String,
    steps: Vec<Box<dyn Step + 'a>>,
}

impl<'a> TaskFlow<'a> {
    pub fn new(name: impl Into<String>, steps: Vec<Box<dyn Step + 'a>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Run the flow to completion or to its first failure. On failure the
    /// completed prefix is reverted in reverse order before returning.
    pub fn run(mut self) -> Result<(), CommitError> {
        for done in 0..self.steps.len() {
            let step = &mut self.steps[done];
            debug!("Flow {:?}: running step {:?}", self.name, step.name());
            if let Err(e) = step.run() {
                warn!(
                    "Flow {:?} failed at step {:?}: {:#}",
                    self.name,
                    step.name(),
                    e
                );
                let failed = step.name().to_string();
                let rollback_failures = self.revert_completed(done);
                return Err(CommitError {
                    flow: self.name,
                    step: failed,
                    source: e,
                    rollback_failures,
                });
            }
        }
        Ok(())
    }

    fn revert_completed(&mut self, done: usize) -> Vec<(String, anyhow::Error)> {
        let mut failures = Vec::new();
        for idx in (0..done).rev() {
            let step = &mut self.steps[idx];
            if !step.revertible() {
                debug!(
                    "Flow {:?}: step {:?} is not revertible, skipping",
                    self.name,
                    step.name()
                );
                continue;
            }
            debug!("Flow {:?}: reverting step {:?}", self.name, step.name());
            if let Err(e) = step.revert() {
                warn!(
                    "Flow {:?}: revert of step {:?} failed: {:#}",
                    self.name,
                    step.name(),
                    e
                );
                failures.push((step.name().to_string(), e));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ScriptedStep {
        name: String,
        fail_run: bool,
        fail_revert: bool,
        revertible: bool,
        journal: Rc<RefCell<Vec<String>>>,
    }

    impl ScriptedStep {
        fn ok(name: &str, journal: &Rc<RefCell<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                fail_run: false,
                fail_revert: false,
                revertible: true,
                journal: journal.clone(),
            })
        }

        fn failing(name: &str, journal: &Rc<RefCell<Vec<String>>>) -> Box<Self> {
            let mut step = Self::ok(name, journal);
            step.fail_run = true;
            step
        }
    }

    impl Step for ScriptedStep {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&mut self) -> Result<()> {
            self.journal.borrow_mut().push(format!("run:{}", self.name));
            if self.fail_run {
                bail!("step {} refused", self.name);
            }
            Ok(())
        }

        fn revert(&mut self) -> Result<()> {
            self.journal
                .borrow_mut()
                .push(format!("revert:{}", self.name));
            if self.fail_revert {
                bail!("revert of {} refused", self.name);
            }
            Ok(())
        }

        fn revertible(&self) -> bool {
            self.revertible
        }
    }

    fn journal() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_runs_all_steps_in_order() {
        let j = journal();
        let flow = TaskFlow::new(
            "ok",
            vec![
                ScriptedStep::ok("a", &j),
                ScriptedStep::ok("b", &j),
                ScriptedStep::ok("c", &j),
            ],
        );
        flow.run().unwrap();
        assert_eq!(*j.borrow(), vec!["run:a", "run:b", "run:c"]);
    }

    #[test]
    fn test_failure_reverts_completed_prefix_in_reverse() {
        let j = journal();
        let flow = TaskFlow::new(
            "boom",
            vec![
                ScriptedStep::ok("a", &j),
                ScriptedStep::ok("b", &j),
                ScriptedStep::failing("c", &j),
                ScriptedStep::ok("d", &j),
            ],
        );
        let err = flow.run().unwrap_err();
        assert_eq!(err.flow, "boom");
        assert_eq!(err.step, "c");
        assert!(err.rollback_failures.is_empty());
        // d never ran; c failed, so only a and b unwind.
        assert_eq!(
            *j.borrow(),
            vec!["run:a", "run:b", "run:c", "revert:b", "revert:a"]
        );
    }

    #[test]
    fn test_non_revertible_steps_are_skipped() {
        let j = journal();
        let mut b = ScriptedStep::ok("b", &j);
        b.revertible = false;
        let flow = TaskFlow::new(
            "boom",
            vec![ScriptedStep::ok("a", &j), b, ScriptedStep::failing("c", &j)],
        );
        let err = flow.run().unwrap_err();
        assert_eq!(err.step, "c");
        assert_eq!(*j.borrow(), vec!["run:a", "run:b", "run:c", "revert:a"]);
    }

    #[test]
    fn test_revert_failures_are_collected() {
        let j = journal();
        let mut b = ScriptedStep::ok("b", &j);
        b.fail_revert = true;
        let flow = TaskFlow::new(
            "boom",
            vec![ScriptedStep::ok("a", &j), b, ScriptedStep::failing("c", &j)],
        );
        let err = flow.run().unwrap_err();
        assert_eq!(err.rollback_failures.len(), 1);
        assert_eq!(err.rollback_failures[0].0, "b");
        // A failed revert does not stop the unwind.
        assert_eq!(
            *j.borrow(),
            vec!["run:a", "run:b", "run:c", "revert:b", "revert:a"]
        );
    }

    #[test]
    fn test_first_step_failure_reverts_nothing() {
        let j = journal();
        let flow = TaskFlow::new(
            "boom",
            vec![ScriptedStep::failing("a", &j), ScriptedStep::ok("b", &j)],
        );
        let err = flow.run().unwrap_err();
        assert_eq!(err.step, "a");
        assert_eq!(*j.borrow(), vec!["run:a"]);
    }

    #[test]
    fn test_error_display_names_flow_and_step() {
        let j = journal();
        let mut b = ScriptedStep::ok("b", &j);
        b.fail_revert = true;
        let flow = TaskFlow::new("commit:p1", vec![b, ScriptedStep::failing("c", &j)]);
        let err = flow.run().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("commit:p1"));
        assert!(text.contains("\"c\""));
        assert!(text.contains("rollback of \"b\""));
    }
}
