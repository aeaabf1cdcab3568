use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::mail_reader::message::Uid;

/// Consecutive fetch failures per UID.
///
/// A UID whose count reaches the threshold is skipped until it succeeds or
/// the registry is cleared, so a poison message cannot stall every pass.
#[derive(Debug)]
pub struct ProblematicUids {
    threshold: u32,
    failures: Mutex<HashMap<Uid, u32>>,
}

impl ProblematicUids {
    pub fn new(threshold: u32) -> Self {
        ProblematicUids {
            threshold: threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uid, u32>> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn should_skip(&self, uid: Uid) -> bool {
        self.lock()
            .get(&uid)
            .is_some_and(|count| *count >= self.threshold)
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&self, uid: Uid) -> u32 {
        let mut failures = self.lock();
        let count = failures.entry(uid).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&self, uid: Uid) {
        self.lock().remove(&uid);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Snapshot sorted by UID.
    pub fn snapshot(&self) -> Vec<(Uid, u32)> {
        let mut entries: Vec<_> = self.lock().iter().map(|(u, c)| (*u, *c)).collect();
        entries.sort_unstable();
        entries
    }
}
