use log::{debug, warn};
use mailparse::{parse_mail, DispositionType, MailHeaderMap, MailParseError, ParsedMail};
use serde::Serialize;

/// Server-assigned message identifier, only meaningful within one UIDVALIDITY.
pub type Uid = u32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl MailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        MailAddress {
            name: None,
            email: email.into(),
        }
    }
}

/// Read-only metadata as the mail store reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub from: Vec<MailAddress>,
    pub subject: String,
    pub date: Option<String>,
}

impl Envelope {
    /// The author a forward is attributed to.
    pub fn sender(&self) -> Option<&MailAddress> {
        self.from.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(skip)]
    pub content: Vec<u8>,
}

/// One matching message ready for relaying.
#[derive(Debug, Clone, Serialize)]
pub struct MailSummary {
    pub uid: Uid,
    pub envelope: Envelope,
    pub text_body: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Default)]
pub struct Decomposed {
    pub text: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
}

const DEFAULT_FILENAME: &str = "attachment";

/// Splits a parsed entity into text body, HTML body and attachments.
///
/// Later parts of the same type replace earlier ones. Parts that cannot be
/// decoded are skipped, the rest of the entity is still used.
pub fn decompose(entity: &ParsedMail) -> Decomposed {
    let mut decomposed = Decomposed::default();

    if is_multipart(entity) {
        walk_parts(&entity.subparts, &mut decomposed);
    } else {
        classify_body(entity, &mut decomposed);
    }

    decomposed
}

fn is_multipart(part: &ParsedMail) -> bool {
    part.ctype.mimetype.to_lowercase().starts_with("multipart/")
}

fn walk_parts(parts: &[ParsedMail], decomposed: &mut Decomposed) {
    for part in parts {
        if is_multipart(part) {
            walk_parts(&part.subparts, decomposed);
            continue;
        }

        let disposition = part.get_content_disposition();
        if disposition.disposition == DispositionType::Attachment {
            let content = match part.get_body_raw() {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping unreadable attachment: {}", e);
                    continue;
                }
            };
            let filename = disposition
                .params
                .get("filename")
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

            decomposed.attachments.push(Attachment {
                filename,
                content_type: part.ctype.mimetype.clone(),
                content,
            });
            continue;
        }

        classify_body(part, decomposed);
    }
}

fn classify_body(part: &ParsedMail, decomposed: &mut Decomposed) {
    let mimetype = part.ctype.mimetype.to_lowercase();
    let slot = match mimetype.as_str() {
        "text/plain" => &mut decomposed.text,
        "text/html" => &mut decomposed.html,
        other => {
            debug!("Ignoring inline part of type {}", other);
            return;
        }
    };

    match part.get_body() {
        Ok(body) => *slot = body,
        Err(e) => warn!("Failed to read {} part: {}", mimetype, e),
    }
}

/// Parses the raw RFC 822 bytes of `uid` and builds its summary.
///
/// The envelope's subject is replaced by the decoded `Subject` header when
/// one is present.
pub fn summarize(uid: Uid, mut envelope: Envelope, raw: &[u8]) -> Result<MailSummary, MailParseError> {
    let parsed = parse_mail(raw)?;

    if let Some(subject) = parsed.headers.get_first_value("Subject") {
        envelope.subject = subject;
    }

    let Decomposed {
        text,
        html,
        attachments,
    } = decompose(&parsed);

    Ok(MailSummary {
        uid,
        envelope,
        text_body: text,
        html_body: html,
        attachments,
    })
}

/// Decodes RFC 2047 encoded words in a raw header value.
pub fn decode_header_value(raw: &[u8]) -> String {
    let mut line = b"X: ".to_vec();
    line.extend_from_slice(raw);
    match mailparse::parse_header(&line) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}
