use std::sync::Mutex;

use log::warn;

use crate::mail_reader::registry::ProblematicUids;
use crate::mail_reader::store::MailboxStatus;

/// State that outlives a single session and is shared between the watch
/// loop and manual check passes.
#[derive(Debug)]
pub struct SharedState {
    pub problematic: ProblematicUids,
    status: Mutex<Option<MailboxStatus>>,
}

impl SharedState {
    pub fn new(failure_threshold: u32) -> Self {
        SharedState {
            problematic: ProblematicUids::new(failure_threshold),
            status: Mutex::new(None),
        }
    }

    /// Records a fresh status. A changed UIDVALIDITY invalidates every known
    /// UID, so the failure registry is cleared; returns true in that case.
    pub fn observe_status(&self, status: MailboxStatus) -> bool {
        let mut cached = self.status.lock().unwrap_or_else(|p| p.into_inner());
        let previous = cached.replace(status);

        let changed = matches!(
            (previous.and_then(|p| p.uid_validity), status.uid_validity),
            (Some(old), Some(new)) if old != new
        );
        drop(cached);

        if changed {
            warn!("UIDVALIDITY changed, forgetting problematic UIDs");
            self.problematic.clear();
        }
        changed
    }

    pub fn mailbox_status(&self) -> Option<MailboxStatus> {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }
}
