use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, ImapError};
use crate::mail_reader::filter::SenderFilter;
use crate::mail_reader::message::{summarize, MailSummary, Uid};
use crate::mail_reader::registry::ProblematicUids;
use crate::mail_reader::store::MailStore;

#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    /// Bound for the whole envelope validation round-trip.
    pub validation: Duration,
    /// Bound for a single body fetch.
    pub message: Duration,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub unseen: usize,
    pub summaries: Vec<MailSummary>,
    pub non_matching: usize,
    /// UIDs returned by the search that no longer had an envelope.
    pub invalid: usize,
    pub failed: Vec<Uid>,
    /// Matching UIDs left alone because they failed too often.
    pub skipped: Vec<Uid>,
    /// Body fetching stopped early (cancellation or an unusable session).
    pub interrupted: bool,
}

/// Searches unseen messages and returns the ones whose sender is allowed.
///
/// UIDs are validated with an envelope fetch first; only messages that pass
/// the sender filter have their body fetched. A per-message failure is
/// recorded in `registry` and never aborts the batch.
pub async fn fetch_matching(
    store: &mut dyn MailStore,
    filter: &SenderFilter,
    registry: &ProblematicUids,
    limits: FetchLimits,
    cancel: &CancellationToken,
) -> Result<FetchOutcome, FetchError> {
    let mut outcome = FetchOutcome::default();

    let uids = store.search_unseen().await.map_err(FetchError::Search)?;
    outcome.unseen = uids.len();
    if uids.is_empty() {
        debug!("No unseen messages");
        return Ok(outcome);
    }

    let envelopes = match timeout(limits.validation, store.fetch_envelopes(&uids)).await {
        Ok(result) => result.map_err(FetchError::Validation)?,
        Err(_) => {
            store.invalidate();
            return Err(FetchError::Validation(ImapError::Timeout {
                operation: "uid validation",
                after: limits.validation,
            }));
        }
    };
    outcome.invalid = uids.len().saturating_sub(envelopes.len());
    if outcome.invalid > 0 {
        debug!("{} UIDs vanished before validation", outcome.invalid);
    }

    let mut matching = Vec::new();
    for (uid, envelope) in envelopes {
        if filter.matches(&envelope) {
            matching.push((uid, envelope));
        } else {
            outcome.non_matching += 1;
            debug!(
                "Ignoring UID {} from {}",
                uid,
                envelope
                    .sender()
                    .map(|s| s.email.as_str())
                    .unwrap_or("<no sender>")
            );
        }
    }
    debug!(
        "Filtering: {} unseen, {} matching, {} not matching",
        outcome.unseen,
        matching.len(),
        outcome.non_matching
    );

    for (uid, envelope) in matching {
        if registry.should_skip(uid) {
            warn!(
                "Skipping UID {} after {} failed fetches",
                uid,
                registry.threshold()
            );
            outcome.skipped.push(uid);
            continue;
        }
        if cancel.is_cancelled() || !store.is_usable() {
            outcome.interrupted = true;
            break;
        }

        let fetched = match timeout(limits.message, store.fetch_message(uid)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                debug!("UID {} disappeared before its body was fetched", uid);
                outcome.invalid += 1;
                continue;
            }
            Ok(Err(e)) => {
                let count = registry.record_failure(uid);
                error!("Failed to fetch UID {} (failure {}): {}", uid, count, e);
                outcome.failed.push(uid);
                continue;
            }
            Err(_) => {
                // The response may still be in flight; the session cannot be reused
                store.invalidate();
                let count = registry.record_failure(uid);
                error!(
                    "Fetching UID {} timed out after {:?} (failure {})",
                    uid, limits.message, count
                );
                outcome.failed.push(uid);
                continue;
            }
        };

        match summarize(uid, envelope, &fetched) {
            Ok(summary) => {
                registry.record_success(uid);
                outcome.summaries.push(summary);
            }
            Err(e) => {
                let count = registry.record_failure(uid);
                error!("Failed to parse UID {} (failure {}): {}", uid, count, e);
                outcome.failed.push(uid);
            }
        }
    }

    info!(
        "-- fetched {} matching message(s), {} failed, {} skipped",
        outcome.summaries.len(),
        outcome.failed.len(),
        outcome.skipped.len()
    );
    Ok(outcome)
}
