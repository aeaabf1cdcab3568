pub mod archive;
pub mod compose;
pub mod smtp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lettre::message::Mailbox;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::mail_reader::message::{MailAddress, MailSummary};
use crate::mail_reader::store::MailStore;
use crate::settings::Config;
use archive::ArchiveOutcome;
use smtp::{Outbound, SmtpOutbound};

#[derive(Debug, Clone)]
pub struct ForwardReport {
    pub subject: String,
    pub archive: ArchiveOutcome,
}

/// Sends forwards to the recipient list and archives a copy of each.
pub struct Relay {
    outbound: Arc<dyn Outbound>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    subject_prefix: String,
    sent_folders: Vec<String>,
    // Set once the server refused an APPEND literal; each refusal costs the session
    archive_unsupported: AtomicBool,
}

impl Relay {
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        let timeouts = config.watch.timeouts();
        let outbound = SmtpOutbound::from_config(&config.smtp, timeouts.command)?;

        let from = compose::parse_mailbox(&MailAddress::new(config.smtp.username.clone()))?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| compose::parse_mailbox(&MailAddress::new(r.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Relay::new(
            Arc::new(outbound),
            from,
            recipients,
            config.subject.prefix.clone(),
            config.watch.sent_folders.clone(),
        ))
    }

    pub fn new(
        outbound: Arc<dyn Outbound>,
        from: Mailbox,
        recipients: Vec<Mailbox>,
        subject_prefix: String,
        sent_folders: Vec<String>,
    ) -> Self {
        Relay {
            outbound,
            from,
            recipients,
            subject_prefix,
            sent_folders,
            archive_unsupported: AtomicBool::new(false),
        }
    }

    /// Forwards one message. Success means the relay accepted it; archival
    /// problems are only reported in the returned [`ForwardReport`].
    pub async fn forward(
        &self,
        store: &mut dyn MailStore,
        summary: &MailSummary,
        cancel: &CancellationToken,
    ) -> Result<ForwardReport, RelayError> {
        let subject = compose::outbound_subject(&self.subject_prefix, &summary.envelope.subject);
        let message = compose::compose(&self.from, &self.recipients, summary, &subject)?;
        let raw = message.formatted();

        if let Err(e) = self.outbound.send(message).await {
            error!("Failed to send mail {:?}: {}", subject, e);
            return Err(e);
        }

        let archive = if self.archive_unsupported.load(Ordering::Relaxed) {
            ArchiveOutcome::Unsupported
        } else if store.is_usable() {
            let outcome = archive::save_to_sent(store, &self.sent_folders, &raw, cancel).await;
            if outcome == ArchiveOutcome::Unsupported {
                info!("Server does not accept APPEND literals, no longer archiving sent mail");
                self.archive_unsupported.store(true, Ordering::Relaxed);
            }
            outcome
        } else {
            ArchiveOutcome::Skipped
        };

        info!(
            "Forwarded mail {:?} to {} recipient(s)",
            subject,
            self.recipients.len()
        );
        Ok(ForwardReport { subject, archive })
    }
}
