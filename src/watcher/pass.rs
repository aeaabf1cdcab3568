use std::fmt;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::mail_reader::fetcher::{fetch_matching, FetchLimits};
use crate::mail_reader::filter::SenderFilter;
use crate::mail_reader::registry::ProblematicUids;
use crate::mail_reader::store::MailStore;
use crate::mail_relay::Relay;

/// Counters of one fetch, forward and mark-seen pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub unseen: usize,
    pub found: usize,
    pub forwarded: usize,
    pub failed: usize,
    pub fetch_failures: usize,
    pub skipped_problematic: usize,
    pub non_matching: usize,
    pub mark_seen_failures: usize,
    pub archived: usize,
    /// Matching messages left unseen because the pass was cut short.
    pub deferred: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Local>>,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unseen, {} matching: {} forwarded, {} failed",
            self.unseen, self.found, self.forwarded, self.failed
        )?;
        if self.fetch_failures > 0 {
            write!(f, ", {} fetch failures", self.fetch_failures)?;
        }
        if self.skipped_problematic > 0 {
            write!(f, ", {} skipped", self.skipped_problematic)?;
        }
        if self.mark_seen_failures > 0 {
            write!(f, ", {} not marked seen", self.mark_seen_failures)?;
        }
        if self.deferred > 0 {
            write!(f, ", {} deferred", self.deferred)?;
        }
        write!(f, ", {} archived", self.archived)
    }
}

pub struct PassContext<'a> {
    pub filter: &'a SenderFilter,
    pub registry: &'a ProblematicUids,
    pub relay: &'a Relay,
    pub limits: FetchLimits,
}

/// Fetches matching messages, forwards each and marks it seen.
///
/// Per-message failures are counted, never propagated. A message is only
/// marked seen after its forward succeeded; a failed forward stays unseen so
/// a later pass retries it.
pub async fn run_pass(
    store: &mut dyn MailStore,
    context: PassContext<'_>,
    cancel: &CancellationToken,
) -> Result<PassReport, FetchError> {
    let outcome = fetch_matching(
        store,
        context.filter,
        context.registry,
        context.limits,
        cancel,
    )
    .await?;

    let mut report = PassReport {
        unseen: outcome.unseen,
        found: outcome.summaries.len() + outcome.failed.len() + outcome.skipped.len(),
        fetch_failures: outcome.failed.len(),
        failed: outcome.failed.len(),
        skipped_problematic: outcome.skipped.len(),
        non_matching: outcome.non_matching,
        ..Default::default()
    };

    if outcome.invalid > 0 {
        debug!("{} unseen UID(s) were no longer valid", outcome.invalid);
    }
    if outcome.interrupted {
        warn!("Fetching stopped early, remaining messages wait for the next pass");
    }

    for summary in &outcome.summaries {
        if cancel.is_cancelled() || !store.is_usable() {
            report.deferred += 1;
            continue;
        }

        match context.relay.forward(store, summary, cancel).await {
            Ok(forward) => {
                debug!("UID {} forwarded as {:?}", summary.uid, forward.subject);
                report.forwarded += 1;
                if forward.archive.is_saved() {
                    report.archived += 1;
                }
            }
            Err(e) => {
                error!("Failed to forward UID {}: {}", summary.uid, e);
                report.failed += 1;
                continue;
            }
        }

        if let Err(e) = store.mark_seen(summary.uid).await {
            // The forward stands; the message may be sent again later
            warn!("Failed to mark UID {} as seen: {}", summary.uid, e);
            report.mark_seen_failures += 1;
        }
    }

    if report.deferred > 0 {
        warn!("{} message(s) deferred to the next pass", report.deferred);
    }
    report.finished_at = Some(Local::now());
    info!("Pass finished: {}", report);
    Ok(report)
}
