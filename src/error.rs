use std::time::Duration;
use thiserror::Error;

/// Failures raised by an established mailbox session.
#[derive(Debug, Error)]
pub enum ImapError {
    #[error("mailbox {0:?} does not exist")]
    MailboxNotFound(String),

    /// The server refused a literal/continuation handshake (typically APPEND).
    /// A late `+` may still be unread, so the session is not trusted after it.
    #[error("server does not support continuation requests: {0}")]
    ContinuationUnsupported(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("session is no longer usable")]
    Disconnected,

    #[error("imap protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImapError {
    /// Sorts a raw server/client error message into the taxonomy.
    ///
    /// Providers word "missing mailbox" in many ways (`TRYCREATE`, "no such
    /// mailbox", "does not exist", ...), so the text is the only portable signal.
    pub fn classify(mailbox: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        if lowered.contains("continuation") {
            return ImapError::ContinuationUnsupported(message);
        }

        let missing = [
            "trycreate",
            "no such mailbox",
            "does not exist",
            "doesn't exist",
            "nonexistent",
            "unknown mailbox",
            "mailbox not found",
        ];
        if missing.iter().any(|needle| lowered.contains(needle)) {
            return ImapError::MailboxNotFound(mailbox.unwrap_or_default().to_string());
        }

        if lowered.contains("connection lost") || lowered.contains("broken pipe") {
            return ImapError::Disconnected;
        }

        ImapError::Protocol(message)
    }

    /// Whether the session may be in an unknown framing state after this error.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            ImapError::Timeout { .. }
                | ImapError::Disconnected
                | ImapError::Io(_)
                | ImapError::ContinuationUnsupported(_)
        )
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::Io(io) => ImapError::Io(io),
            // APPEND got something other than a continuation request
            async_imap::error::Error::Append => ImapError::ContinuationUnsupported(
                "server did not ask for the message literal".to_string(),
            ),
            other => ImapError::classify(None, other.to_string()),
        }
    }
}

/// Failures while opening a session. Never retried inside the connection manager.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connecting to {address} timed out after {after:?}")]
    Timeout { address: String, after: Duration },

    #[error("tcp connect to {address} failed: {source}")]
    Tcp {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with {server} failed: {source}")]
    Tls {
        server: String,
        #[source]
        source: native_tls::Error,
    },

    #[error("login as {username} failed: {message}")]
    Auth { username: String, message: String },

    #[error("connection health check failed: {0}")]
    HealthCheck(#[source] ImapError),

    #[error("failed to select {mailbox}: {source}")]
    Select {
        mailbox: String,
        #[source]
        source: ImapError,
    },
}

/// Systemic fetch failures that abort the whole fetch call.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("search for unseen messages failed: {0}")]
    Search(#[source] ImapError),

    #[error("uid validation failed: {0}")]
    Validation(#[source] ImapError),
}

/// Failures of one forward attempt. Archival problems never surface here.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid address {address:?}: {message}")]
    Address { address: String, message: String },

    #[error("failed to compose outbound message: {0}")]
    Compose(String),

    #[error("failed to set up smtp transport: {0}")]
    Transport(String),

    #[error("smtp send failed: {0}")]
    Send(String),
}

/// Why a check pass did not run to completion.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("a check pass is already running")]
    Busy,

    #[error("check pass abandoned during shutdown")]
    Cancelled,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("configuration is invalid:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}
