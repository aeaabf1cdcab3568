use itertools::Itertools;
use log::{debug, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::ImapError;
use crate::mail_reader::store::MailStore;

/// Where the copy of a forward ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Saved(String),
    /// The server cannot take APPEND literals at all.
    Unsupported,
    /// None of the candidate folders exists.
    NoFolder,
    Failed(String),
    /// No usable session to archive through, or shutdown began.
    Skipped,
}

impl ArchiveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, ArchiveOutcome::Saved(_))
    }
}

/// Candidates present on the server, in configured priority order and in the
/// server's spelling. Falls back to every candidate when nothing matches.
pub fn order_candidates(candidates: &[String], existing: &[String]) -> Vec<String> {
    let present: Vec<String> = candidates
        .iter()
        .filter_map(|candidate| {
            existing
                .iter()
                .find(|name| name.eq_ignore_ascii_case(candidate))
                .cloned()
        })
        .unique()
        .collect();

    if present.is_empty() {
        candidates.iter().cloned().unique().collect()
    } else {
        present
    }
}

/// Appends `raw` to the first Sent folder that accepts it, flagged `\Seen`.
///
/// Stops before the next command once `cancel` fires.
pub async fn save_to_sent(
    store: &mut dyn MailStore,
    candidates: &[String],
    raw: &[u8],
    cancel: &CancellationToken,
) -> ArchiveOutcome {
    let existing = match store.list_mailboxes().await {
        Ok(names) => {
            debug!("Available IMAP folders: {:?}", names);
            names
        }
        Err(e) => {
            debug!("Could not list folders: {}", e);
            if !store.is_usable() {
                return ArchiveOutcome::Failed(e.to_string());
            }
            Vec::new()
        }
    };

    let mut last_error = None;
    for folder in order_candidates(candidates, &existing) {
        if cancel.is_cancelled() {
            debug!("Shutting down, not saving to Sent folder");
            return ArchiveOutcome::Skipped;
        }
        match store.append(&folder, raw).await {
            Ok(()) => {
                info!("Saved mail to Sent folder {}", folder);
                return ArchiveOutcome::Saved(folder);
            }
            Err(ImapError::MailboxNotFound(_)) => {
                debug!("No folder named {:?}", folder);
            }
            Err(ImapError::ContinuationUnsupported(reason)) => {
                debug!(
                    "Could not save to Sent folder, server doesn't support it: {}",
                    reason
                );
                return ArchiveOutcome::Unsupported;
            }
            Err(e) if e.poisons_session() => {
                warn!("Could not save to Sent folder: {}", e);
                return ArchiveOutcome::Failed(e.to_string());
            }
            Err(e) => {
                debug!("Failed to append to {}: {}", folder, e);
                last_error = Some(e.to_string());
            }
        }
    }

    match last_error {
        Some(e) => {
            warn!("Could not save to any Sent folder: {}", e);
            ArchiveOutcome::Failed(e)
        }
        None => {
            warn!("No Sent folder found among {:?}", candidates);
            ArchiveOutcome::NoFolder
        }
    }
}
