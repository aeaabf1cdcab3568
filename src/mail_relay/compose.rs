use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{Address, Message};
use log::warn;

use crate::error::RelayError;
use crate::mail_reader::message::{MailAddress, MailSummary};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Subject of the forward: the configured prefix, a space, the original.
pub fn outbound_subject(prefix: &str, subject: &str) -> String {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        subject.to_string()
    } else {
        format!("{} {}", prefix, subject)
    }
}

pub fn parse_mailbox(address: &MailAddress) -> Result<Mailbox, RelayError> {
    let email = address
        .email
        .trim()
        .parse::<Address>()
        .map_err(|e| RelayError::Address {
            address: address.email.clone(),
            message: e.to_string(),
        })?;
    let name = address.name.clone().filter(|n| !n.trim().is_empty());
    Ok(Mailbox::new(name, email))
}

fn attachment_type(declared: &str) -> Result<ContentType, RelayError> {
    ContentType::parse(declared)
        .or_else(|_| {
            warn!(
                "Unusable attachment content type {:?}, sending as {}",
                declared, FALLBACK_CONTENT_TYPE
            );
            ContentType::parse(FALLBACK_CONTENT_TYPE)
        })
        .map_err(|e| RelayError::Compose(e.to_string()))
}

/// Builds the forward of `summary`.
///
/// The original author goes into To and Reply-To, the recipient list into
/// Bcc only. Text is always present; HTML rides along as an alternative and
/// attachments keep their filename, content type and bytes.
pub fn compose(
    from: &Mailbox,
    recipients: &[Mailbox],
    summary: &MailSummary,
    subject: &str,
) -> Result<Message, RelayError> {
    let sender = summary
        .envelope
        .sender()
        .ok_or_else(|| RelayError::Compose(format!("message {} has no sender", summary.uid)))?;
    let sender = parse_mailbox(sender)?;

    let mut builder = Message::builder()
        .from(from.clone())
        .to(sender.clone())
        .reply_to(sender)
        .subject(subject);
    for recipient in recipients {
        builder = builder.bcc(recipient.clone());
    }

    let content = if summary.html_body.is_empty() {
        MultiPart::mixed().singlepart(SinglePart::plain(summary.text_body.clone()))
    } else {
        MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
            summary.text_body.clone(),
            summary.html_body.clone(),
        ))
    };

    let content = summary
        .attachments
        .iter()
        .try_fold(content, |content, attachment| {
            let part = Attachment::new(attachment.filename.clone()).body(
                attachment.content.clone(),
                attachment_type(&attachment.content_type)?,
            );
            Ok::<_, RelayError>(content.singlepart(part))
        })?;

    builder
        .multipart(content)
        .map_err(|e| RelayError::Compose(e.to_string()))
}
