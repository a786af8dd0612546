//! Remembers which processes previous scans already reported.

use std::collections::HashSet;

use crate::process::{ProcessIdentity, ProcessInfo};

/// Anything that may carry a process identity.
///
/// `None` means the identity could not be read, e.g. the process exited
/// while the scan was enumerating it.
pub trait Identified {
    fn process_identity(&self) -> Option<ProcessIdentity>;
}

impl Identified for ProcessIdentity {
    fn process_identity(&self) -> Option<ProcessIdentity> {
        Some(*self)
    }
}

impl Identified for ProcessInfo {
    fn process_identity(&self) -> Option<ProcessIdentity> {
        self.identity()
    }
}

/// Snapshot of the identities seen by the previous scan.
#[derive(Debug, Default)]
pub struct SeenProcessRegistry {
    last: HashSet<ProcessIdentity>,
}

impl SeenProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only candidates absent from the previous snapshot, then make the
    /// full candidate set the new snapshot.
    ///
    /// Candidates without a readable identity are dropped and never reported.
    /// Input order is preserved and duplicates are reported once.
    pub fn filter_new<T, I>(&mut self, candidates: I) -> Vec<T>
    where
        T: Identified,
        I: IntoIterator<Item = T>,
    {
        let mut current = HashSet::new();
        let mut fresh = Vec::new();
        for candidate in candidates {
            let Some(identity) = candidate.process_identity() else {
                continue;
            };
            if !current.insert(identity) {
                continue;
            }
            if !self.last.contains(&identity) {
                fresh.push(candidate);
            }
        }
        self.last = current;
        fresh
    }

    #[must_use]
    pub fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.last.contains(identity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
