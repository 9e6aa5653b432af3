//! Minimal two-phase commit driver
//!
//! Enlists several [`ResourceManager`]s and drives them through one
//! decision: every participant prepares, and only if all vote yes do the
//! commit voters commit. Participants that voted read-only are already done.

use super::{ResourceManager, Vote};
use crate::Result;

/// Outcome of [`TwoPhaseCoordinator::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every participant committed or was read-only
    Committed,
    /// A participant failed to prepare and the rest were rolled back
    RolledBack,
}

/// Drives enlisted participants through prepare and commit
#[derive(Default)]
pub struct TwoPhaseCoordinator<'a> {
    resources: Vec<&'a mut dyn ResourceManager>,
}

impl<'a> TwoPhaseCoordinator<'a> {
    /// Coordinator with no participants
    pub fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Add a participant
    pub fn enlist(&mut self, resource: &'a mut dyn ResourceManager) {
        self.resources.push(resource);
    }

    /// Participants enlisted
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// No participant enlisted
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Prepare everyone, then commit or roll back
    ///
    /// A failed prepare has already rolled its own participant back; the
    /// others that voted to commit are rolled back here. An error from a
    /// commit after a unanimous vote is returned as-is, since the decision
    /// is already logged by the participants that committed.
    pub fn run(mut self) -> Result<Outcome> {
        let mut votes = Vec::with_capacity(self.resources.len());
        for (index, resource) in self.resources.iter_mut().enumerate() {
            match resource.prepare() {
                Ok(vote) => votes.push(vote),
                Err(e) => {
                    tracing::warn!("participant {} failed to prepare: {}", index, e);
                    break;
                }
            }
        }

        if votes.len() < self.resources.len() {
            for (resource, vote) in self.resources.iter_mut().zip(&votes) {
                if *vote == Vote::Commit {
                    if let Err(e) = resource.rollback() {
                        tracing::warn!("rollback after failed prepare: {}", e);
                    }
                }
            }
            // Participants after the failed one never prepared
            for resource in self.resources.iter_mut().skip(votes.len() + 1) {
                if let Err(e) = resource.rollback() {
                    tracing::warn!("rollback of unprepared participant: {}", e);
                }
            }
            return Ok(Outcome::RolledBack);
        }

        for (resource, vote) in self.resources.iter_mut().zip(&votes) {
            if *vote == Vote::Commit {
                resource.commit()?;
            }
        }
        Ok(Outcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct ScriptedParticipant {
        fail_prepare: bool,
        read_only: bool,
        log: Vec<&'static str>,
    }

    impl ResourceManager for ScriptedParticipant {
        fn prepare(&mut self) -> Result<Vote> {
            self.log.push("prepare");
            if self.fail_prepare {
                Err(Error::inconsistent("scripted failure"))
            } else if self.read_only {
                Ok(Vote::ReadOnly)
            } else {
                Ok(Vote::Commit)
            }
        }

        fn commit(&mut self) -> Result<()> {
            self.log.push("commit");
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.log.push("rollback");
            Ok(())
        }
    }

    #[test]
    fn test_unanimous_commit() {
        let mut a = ScriptedParticipant::default();
        let mut b = ScriptedParticipant {
            read_only: true,
            ..Default::default()
        };
        let mut coordinator = TwoPhaseCoordinator::new();
        coordinator.enlist(&mut a);
        coordinator.enlist(&mut b);
        assert_eq!(coordinator.run().unwrap(), Outcome::Committed);

        assert_eq!(a.log, vec!["prepare", "commit"]);
        assert_eq!(b.log, vec!["prepare"]);
    }

    #[test]
    fn test_failed_prepare_rolls_back_the_rest() {
        let mut a = ScriptedParticipant::default();
        let mut b = ScriptedParticipant {
            fail_prepare: true,
            ..Default::default()
        };
        let mut c = ScriptedParticipant::default();
        let mut coordinator = TwoPhaseCoordinator::new();
        coordinator.enlist(&mut a);
        coordinator.enlist(&mut b);
        coordinator.enlist(&mut c);
        assert_eq!(coordinator.run().unwrap(), Outcome::RolledBack);

        assert_eq!(a.log, vec!["prepare", "rollback"]);
        assert_eq!(b.log, vec!["prepare"]);
        assert_eq!(c.log, vec!["rollback"]);
    }
}
