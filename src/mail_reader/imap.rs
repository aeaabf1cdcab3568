use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectError, ImapError};
use crate::mail_reader::message::{decode_header_value, Envelope, MailAddress, Uid};
use crate::mail_reader::state::SharedState;
use crate::mail_reader::store::{Connector, IdleEvent, MailStore, MailboxStatus};
use crate::settings::{ImapConfig, Timeouts};
use log::{debug, info, warn};

type TlsStream = tokio_native_tls::TlsStream<TcpStream>;
type ImapSession = Session<Compat<TlsStream>>;

// Establish a TLS-encrypted connection to the IMAP server
async fn connect_to_server(server: &str, port: u16) -> Result<TlsStream, ConnectError> {
    let address = format!("{}:{}", server, port);
    let tcp_stream = TcpStream::connect((server, port))
        .await
        .map_err(|source| ConnectError::Tcp {
            address: address.clone(),
            source,
        })?;

    // The certificate must be valid for the configured hostname
    let tls_error = |source| ConnectError::Tls {
        server: server.to_string(),
        source,
    };
    let connector = native_tls::TlsConnector::new().map_err(tls_error)?;
    let tls = tokio_native_tls::TlsConnector::from(connector);
    let tls_stream = tls.connect(server, tcp_stream).await.map_err(tls_error)?;

    info!("-- connected to {}", address);
    Ok(tls_stream)
}

// Login to the IMAP server and return an authenticated session
async fn login_to_server(
    client: Client<Compat<TlsStream>>,
    username: &str,
    password: &str,
) -> Result<ImapSession, ConnectError> {
    let imap_session = client
        .login(username, password)
        .await
        .map_err(|(e, _client)| ConnectError::Auth {
            username: username.to_string(),
            message: e.to_string(),
        })?;

    info!("-- logged in as {}", username);
    Ok(imap_session)
}

/// Runs one command under a deadline.
async fn bounded<T, F>(operation: &'static str, after: Duration, command: F) -> Result<T, ImapError>
where
    F: Future<Output = Result<T, ImapError>>,
{
    match timeout(after, command).await {
        Ok(result) => result,
        Err(_) => Err(ImapError::Timeout { operation, after }),
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Builds `mailbox@host` from the parts of an ENVELOPE address. Group
/// markers and addresses without a host yield nothing.
fn mail_address(
    name: Option<&[u8]>,
    mailbox: Option<&[u8]>,
    host: Option<&[u8]>,
) -> Option<MailAddress> {
    let mailbox = mailbox?;
    let host = host?;
    Some(MailAddress {
        name: name.map(decode_header_value),
        email: format!("{}@{}", lossy(mailbox), lossy(host)),
    })
}

fn envelope_of(fetch: &Fetch) -> Option<Envelope> {
    let envelope = fetch.envelope()?;

    let from = envelope
        .from
        .as_ref()
        .map(|addresses| {
            addresses
                .iter()
                .filter_map(|address| {
                    mail_address(
                        address.name.as_deref(),
                        address.mailbox.as_deref(),
                        address.host.as_deref(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Some(Envelope {
        from,
        subject: envelope
            .subject
            .as_ref()
            .map(|s| decode_header_value(s))
            .unwrap_or_default(),
        date: envelope.date.as_ref().map(|d| lossy(d)),
    })
}

/// Compact UID set: consecutive runs collapse into `a:b` ranges.
fn uid_set(uids: &[Uid]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<(Uid, Uid)> = Vec::new();
    for uid in sorted {
        match ranges.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(uid) => *end = uid,
            _ => ranges.push((uid, uid)),
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}:{}", start, end)
            }
        })
        .join(",")
}

/// Cached status when `name` is already selected in the requested mode.
fn memoized_status(
    selected: Option<&(String, bool)>,
    status: Option<MailboxStatus>,
    name: &str,
    read_only: bool,
) -> Option<MailboxStatus> {
    match selected {
        Some((selected, mode)) if selected == name && *mode == read_only => status,
        _ => None,
    }
}

/// async-imap reports any APPEND that gets no continuation request the same
/// way. A folder LIST did not return was most likely refused with TRYCREATE;
/// otherwise the server may still send its `+` later.
fn refused_append(mailbox: &str, known: Option<&[String]>) -> ImapError {
    match known {
        Some(names) if !names.iter().any(|n| n.eq_ignore_ascii_case(mailbox)) => {
            ImapError::MailboxNotFound(mailbox.to_string())
        }
        _ => ImapError::from(async_imap::error::Error::Append),
    }
}

enum IdleStart {
    Started,
    Cancelled,
}

/// Waits for the server to accept IDLE, bounded by `after` and `cancel`.
async fn start_idle<F>(
    init: F,
    after: Duration,
    cancel: &CancellationToken,
) -> Result<IdleStart, ImapError>
where
    F: Future<Output = Result<(), async_imap::error::Error>>,
{
    tokio::select! {
        result = bounded("idle", after, async { Ok(init.await?) }) => {
            result.map(|()| IdleStart::Started)
        }
        _ = cancel.cancelled() => Ok(IdleStart::Cancelled),
    }
}

/// An authenticated IMAP session over TLS.
pub struct MailboxSession {
    server: String,
    session: Option<ImapSession>,
    selected: Option<(String, bool)>,
    status: Option<MailboxStatus>,
    // Names from the last LIST, used to tell refused APPENDs apart
    known_mailboxes: Option<Vec<String>>,
    idle_capable: bool,
    command_timeout: Duration,
    logout_grace: Duration,
    state: Arc<SharedState>,
}

impl std::fmt::Debug for MailboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxSession")
            .field("server", &self.server)
            .field("connected", &self.session.is_some())
            .field("selected", &self.selected)
            .field("status", &self.status)
            .finish()
    }
}

/// Connects, authenticates, checks health and selects the configured mailbox
/// read-write. Any failure closes what was opened so far.
pub async fn connect(
    config: &ImapConfig,
    timeouts: &Timeouts,
    state: Arc<SharedState>,
) -> Result<MailboxSession, ConnectError> {
    let address = format!("{}:{}", config.server, config.port);

    let tls_stream = timeout(timeouts.connect, connect_to_server(&config.server, config.port))
        .await
        .map_err(|_| ConnectError::Timeout {
            address: address.clone(),
            after: timeouts.connect,
        })??;

    let client = Client::new(tls_stream.compat());
    let imap_session = timeout(
        timeouts.command,
        login_to_server(client, &config.username, &config.password),
    )
    .await
    .map_err(|_| ConnectError::Timeout {
        address: address.clone(),
        after: timeouts.command,
    })??;

    let mut session = MailboxSession {
        server: address,
        session: Some(imap_session),
        selected: None,
        status: None,
        known_mailboxes: None,
        idle_capable: false,
        command_timeout: timeouts.command,
        logout_grace: timeouts.logout_grace,
        state,
    };

    if let Err(e) = session.health_check().await {
        session.close().await;
        return Err(ConnectError::HealthCheck(e));
    }

    // Read-write, otherwise flag updates are rejected
    if let Err(source) = session.select_mailbox(&config.mailbox, false).await {
        session.close().await;
        return Err(ConnectError::Select {
            mailbox: config.mailbox.clone(),
            source,
        });
    }

    Ok(session)
}

impl MailboxSession {
    fn imap(&mut self) -> Result<&mut ImapSession, ImapError> {
        self.session.as_mut().ok_or(ImapError::Disconnected)
    }

    /// Drops the connection when `result` means the framing can't be trusted.
    fn settle<T>(&mut self, result: Result<T, ImapError>) -> Result<T, ImapError> {
        if let Err(e) = &result {
            if e.poisons_session() && self.session.is_some() {
                warn!("Discarding IMAP session to {}: {}", self.server, e);
                self.invalidate();
            }
        }
        result
    }

    /// Capability round-trip; also learns whether IDLE is available.
    pub async fn health_check(&mut self) -> Result<(), ImapError> {
        let after = self.command_timeout;
        let session = self.imap()?;
        let result = bounded("capability", after, async {
            let capabilities = session.capabilities().await?;
            Ok(capabilities.has_str("IDLE"))
        })
        .await;

        self.idle_capable = self.settle(result)?;
        debug!(
            "-- {} capabilities checked, IDLE supported: {}",
            self.server, self.idle_capable
        );
        Ok(())
    }
}

#[async_trait]
impl MailStore for MailboxSession {
    fn server(&self) -> &str {
        &self.server
    }

    fn supports_idle(&self) -> bool {
        self.idle_capable
    }

    fn is_usable(&self) -> bool {
        self.session.is_some()
    }

    fn invalidate(&mut self) {
        // Dropping the stream closes the socket without a logout
        self.session = None;
        self.selected = None;
    }

    async fn select_mailbox(
        &mut self,
        name: &str,
        read_only: bool,
    ) -> Result<MailboxStatus, ImapError> {
        let cached = memoized_status(self.selected.as_ref(), self.status, name, read_only);
        if let Some(status) = cached {
            return Ok(status);
        }

        let after = self.command_timeout;
        let session = self.imap()?;
        let result = bounded("select", after, async {
            let selected = if read_only {
                session.examine(name).await
            } else {
                session.select(name).await
            };
            selected.map_err(|e| match e {
                async_imap::error::Error::Io(io) => ImapError::Io(io),
                other => ImapError::classify(Some(name), other.to_string()),
            })
        })
        .await;
        let mailbox = self.settle(result)?;

        let status = MailboxStatus {
            exists: mailbox.exists,
            unseen: mailbox.unseen,
            uid_validity: mailbox.uid_validity,
        };
        info!(
            "-- {} selected ({}), {} messages",
            name,
            if read_only { "read-only" } else { "read-write" },
            status.exists
        );

        self.selected = Some((name.to_string(), read_only));
        self.status = Some(status);
        self.state.observe_status(status);
        Ok(status)
    }

    async fn search_unseen(&mut self) -> Result<Vec<Uid>, ImapError> {
        let after = self.command_timeout;
        let session = self.imap()?;
        let result = bounded("search", after, async {
            Ok(session.uid_search("UNSEEN").await?)
        })
        .await;

        let uids = self.settle(result)?;
        Ok(uids.into_iter().sorted().collect())
    }

    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<(Uid, Envelope)>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_set = uid_set(uids);
        let after = self.command_timeout;
        let session = self.imap()?;
        let result = bounded("fetch envelopes", after, async {
            let stream = session.uid_fetch(&uid_set, "(UID ENVELOPE)").await?;
            let fetches: Vec<Fetch> = stream.try_collect().await?;
            Ok(fetches)
        })
        .await;

        let fetches = self.settle(result)?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| Some((fetch.uid?, envelope_of(fetch)?)))
            .collect())
    }

    async fn fetch_message(&mut self, uid: Uid) -> Result<Option<Vec<u8>>, ImapError> {
        let after = self.command_timeout;
        let session = self.imap()?;
        // BODY.PEEK leaves \Seen alone; the whole response is drained even
        // when it carries unsolicited updates for other messages
        let result = bounded("fetch message", after, async {
            let stream = session
                .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
                .await?;
            let fetches: Vec<Fetch> = stream.try_collect().await?;
            Ok(fetches)
        })
        .await;

        let fetches = self.settle(result)?;
        Ok(fetches
            .iter()
            .filter(|fetch| fetch.uid == Some(uid))
            .find_map(|fetch| fetch.body())
            .map(<[u8]>::to_vec))
    }

    async fn mark_seen(&mut self, uid: Uid) -> Result<(), ImapError> {
        debug!("Marking message {} as seen", uid);
        let after = self.command_timeout;
        let session = self.imap()?;
        let result = bounded("store", after, async {
            let stream = session
                .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Seen)")
                .await?;
            let _: Vec<Fetch> = stream.try_collect().await?;
            Ok(())
        })
        .await;

        self.settle(result)
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, ImapError> {
        let after = self.command_timeout;
        let session = self.imap()?;
        let result = bounded("list", after, async {
            let stream = session.list(Some(""), Some("*")).await?;
            let names: Vec<_> = stream.try_collect().await?;
            Ok(names.iter().map(|n| n.name().to_string()).collect::<Vec<_>>())
        })
        .await;

        let names = self.settle(result)?;
        self.known_mailboxes = Some(names.clone());
        Ok(names)
    }

    async fn append(&mut self, mailbox: &str, content: &[u8]) -> Result<(), ImapError> {
        let after = self.command_timeout;
        let known = self.known_mailboxes.clone();
        let session = self.imap()?;
        let result = bounded("append", after, async {
            session
                .append(mailbox, Some("(\\Seen)"), None, content)
                .await
                .map_err(|e| match e {
                    async_imap::error::Error::Io(io) => ImapError::Io(io),
                    async_imap::error::Error::Append => refused_append(mailbox, known.as_deref()),
                    other => ImapError::classify(Some(mailbox), other.to_string()),
                })
        })
        .await;

        self.settle(result)
    }

    async fn idle_wait(
        &mut self,
        deadline: Duration,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleEvent, ImapError> {
        enum Woke {
            Server(Result<IdleResponse, async_imap::error::Error>),
            Cancelled,
        }

        // IDLE consumes the session; it only comes back through `done`
        let session = self.session.take().ok_or(ImapError::Disconnected)?;
        let mut handle = session.idle();
        // Until `done` hands the session back, every early return leaves
        // `self.session` empty
        let selected = self.selected.take();
        match start_idle(handle.init(), self.command_timeout, cancel).await? {
            IdleStart::Started => debug!("-- idling on {}", self.server),
            IdleStart::Cancelled => {
                debug!("Cancelled before IDLE was accepted, dropping connection");
                return Ok(IdleEvent::Cancelled);
            }
        }

        let woke = {
            let (wait, stop) = handle.wait_with_timeout(deadline);
            tokio::pin!(wait);

            let woke = tokio::select! {
                response = &mut wait => Woke::Server(response),
                _ = cancel.cancelled() => Woke::Cancelled,
            };

            if matches!(woke, Woke::Cancelled) {
                drop(stop);
                if timeout(grace, &mut wait).await.is_err() {
                    warn!("IDLE did not stop within {:?}, proceeding", grace);
                }
            }
            woke
        };

        let session = match timeout(grace, handle.done()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(ImapError::Timeout {
                    operation: "idle done",
                    after: grace,
                });
            }
        };
        self.session = Some(session);
        self.selected = selected;

        match woke {
            Woke::Cancelled | Woke::Server(Ok(IdleResponse::ManualInterrupt)) => {
                Ok(IdleEvent::Cancelled)
            }
            Woke::Server(Ok(IdleResponse::NewData(_))) => Ok(IdleEvent::MailboxChanged),
            Woke::Server(Ok(IdleResponse::Timeout)) => Ok(IdleEvent::TimedOut),
            Woke::Server(Err(e)) => {
                let err = ImapError::from(e);
                self.settle(Err(err))
            }
        }
    }

    async fn close(&mut self) {
        self.selected = None;
        let Some(mut session) = self.session.take() else {
            return;
        };

        match timeout(self.logout_grace, session.logout()).await {
            Ok(Ok(())) => info!("-- logged out from {}", self.server),
            Ok(Err(e)) => debug!("Logout from {} failed: {}", self.server, e),
            Err(_) => warn!("Logout from {} timed out, dropping connection", self.server),
        }
    }
}

/// Opens real IMAP sessions for the watch loop and manual checks.
pub struct ImapConnector {
    config: ImapConfig,
    timeouts: Timeouts,
    state: Arc<SharedState>,
}

impl ImapConnector {
    pub fn new(config: ImapConfig, timeouts: Timeouts, state: Arc<SharedState>) -> Self {
        ImapConnector {
            config,
            timeouts,
            state,
        }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailStore>, ConnectError> {
        let session = connect(&self.config, &self.timeouts, self.state.clone()).await?;
        Ok(Box::new(session))
    }
}
