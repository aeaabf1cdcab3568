//! In-memory stand-ins for the mail server and the SMTP relay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lettre::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectError, ImapError, RelayError};
use crate::mail_reader::message::{Envelope, MailAddress, Uid};
use crate::mail_reader::store::{Connector, IdleEvent, MailStore, MailboxStatus};
use crate::mail_relay::smtp::Outbound;

pub struct FakeMessage {
    pub uid: Uid,
    pub from: String,
    pub subject: String,
    pub raw: Vec<u8>,
    pub seen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendFault {
    Missing,
    Continuation,
    Disconnect,
}

#[derive(Default)]
pub struct FakeMailbox {
    pub messages: Vec<FakeMessage>,
    /// Returned by the search but gone by the time envelopes are fetched.
    pub stale: Vec<Uid>,
    pub failing: HashSet<Uid>,
    /// Body fetches for these never complete.
    pub hanging: HashSet<Uid>,
    pub hang_envelopes: bool,
    pub folders: Vec<String>,
    pub list_fails: bool,
    pub append_faults: HashMap<String, AppendFault>,
    pub appended: Vec<(String, Vec<u8>)>,
    pub fail_mark_seen: bool,
    pub idle_unsupported: bool,
    /// Scripted idle results; an empty script waits for cancellation.
    pub idle_script: VecDeque<IdleEvent>,
    pub uid_validity: u32,
    pub calls: Vec<String>,
}

impl FakeMailbox {
    pub fn add_raw(&mut self, uid: Uid, from: &str, subject: &str, raw: &str) {
        self.messages.push(FakeMessage {
            uid,
            from: from.to_string(),
            subject: subject.to_string(),
            raw: raw.as_bytes().to_vec(),
            seen: false,
        });
    }

    pub fn add_text(&mut self, uid: Uid, from: &str, subject: &str, body: &str) {
        let raw = format!(
            "From: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            from, subject, body
        );
        self.add_raw(uid, from, subject, &raw);
    }

    fn status(&self) -> MailboxStatus {
        MailboxStatus {
            exists: self.messages.len() as u32,
            unseen: Some(self.messages.iter().filter(|m| !m.seen).count() as u32),
            uid_validity: Some(self.uid_validity),
        }
    }
}

/// Shared view on a [`FakeMailbox`] for assertions.
#[derive(Clone)]
pub struct FakeHandle(Arc<Mutex<FakeMailbox>>);

impl FakeHandle {
    pub fn new(mailbox: FakeMailbox) -> Self {
        FakeHandle(Arc::new(Mutex::new(mailbox)))
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeMailbox> {
        self.0.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == name).count()
    }

    pub fn is_seen(&self, uid: Uid) -> bool {
        self.lock().messages.iter().any(|m| m.uid == uid && m.seen)
    }

    pub fn appended(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().appended.clone()
    }
}

pub struct FakeStore {
    handle: FakeHandle,
    usable: bool,
}

impl FakeStore {
    pub fn new(mailbox: FakeMailbox) -> (Self, FakeHandle) {
        let handle = FakeHandle::new(mailbox);
        (FakeStore::attach(handle.clone()), handle)
    }

    pub fn attach(handle: FakeHandle) -> Self {
        FakeStore {
            handle,
            usable: true,
        }
    }

    fn record(&self, call: String) -> MutexGuard<'_, FakeMailbox> {
        let mut mailbox = self.handle.lock();
        mailbox.calls.push(call);
        mailbox
    }

    fn ensure_usable(&self) -> Result<(), ImapError> {
        if self.usable {
            Ok(())
        } else {
            Err(ImapError::Disconnected)
        }
    }
}

#[async_trait]
impl MailStore for FakeStore {
    fn server(&self) -> &str {
        "fake:993"
    }

    fn supports_idle(&self) -> bool {
        !self.handle.lock().idle_unsupported
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn invalidate(&mut self) {
        self.usable = false;
    }

    async fn select_mailbox(
        &mut self,
        name: &str,
        _read_only: bool,
    ) -> Result<MailboxStatus, ImapError> {
        self.ensure_usable()?;
        Ok(self.record(format!("select {}", name)).status())
    }

    async fn search_unseen(&mut self) -> Result<Vec<Uid>, ImapError> {
        self.ensure_usable()?;
        let mailbox = self.record("search_unseen".to_string());
        let mut uids: Vec<Uid> = mailbox
            .messages
            .iter()
            .filter(|m| !m.seen)
            .map(|m| m.uid)
            .chain(mailbox.stale.iter().copied())
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<(Uid, Envelope)>, ImapError> {
        self.ensure_usable()?;
        let hang = {
            let mailbox = self.record("fetch_envelopes".to_string());
            mailbox.hang_envelopes
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mailbox = self.handle.lock();
        Ok(mailbox
            .messages
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .map(|m| {
                (
                    m.uid,
                    Envelope {
                        from: vec![MailAddress::new(m.from.clone())],
                        subject: m.subject.clone(),
                        date: None,
                    },
                )
            })
            .collect())
    }

    async fn fetch_message(&mut self, uid: Uid) -> Result<Option<Vec<u8>>, ImapError> {
        self.ensure_usable()?;
        let (hang, fail, body) = {
            let mailbox = self.record(format!("fetch_message {}", uid));
            let body = mailbox
                .messages
                .iter()
                .find(|m| m.uid == uid)
                .map(|m| m.raw.clone());
            (
                mailbox.hanging.contains(&uid),
                mailbox.failing.contains(&uid),
                body,
            )
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(ImapError::Protocol(format!("cannot fetch {}", uid)));
        }
        Ok(body)
    }

    async fn mark_seen(&mut self, uid: Uid) -> Result<(), ImapError> {
        self.ensure_usable()?;
        let mut mailbox = self.record(format!("mark_seen {}", uid));
        if mailbox.fail_mark_seen {
            return Err(ImapError::Protocol("STORE rejected".to_string()));
        }
        if let Some(message) = mailbox.messages.iter_mut().find(|m| m.uid == uid) {
            message.seen = true;
        }
        Ok(())
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, ImapError> {
        self.ensure_usable()?;
        let mailbox = self.record("list".to_string());
        if mailbox.list_fails {
            return Err(ImapError::Protocol("LIST not permitted".to_string()));
        }
        Ok(mailbox.folders.clone())
    }

    async fn append(&mut self, folder: &str, content: &[u8]) -> Result<(), ImapError> {
        self.ensure_usable()?;
        let fault = {
            let mut mailbox = self.record(format!("append {}", folder));
            let fault = match mailbox.append_faults.get(folder) {
                Some(fault) => Some(*fault),
                None if mailbox.folders.iter().any(|f| f == folder) => None,
                None => Some(AppendFault::Missing),
            };
            if fault.is_none() {
                mailbox.appended.push((folder.to_string(), content.to_vec()));
            }
            fault
        };

        match fault {
            None => Ok(()),
            Some(AppendFault::Missing) => Err(ImapError::MailboxNotFound(folder.to_string())),
            Some(AppendFault::Continuation) => {
                self.usable = false;
                Err(ImapError::ContinuationUnsupported(
                    "no continuation request received".to_string(),
                ))
            }
            Some(AppendFault::Disconnect) => {
                self.usable = false;
                Err(ImapError::Disconnected)
            }
        }
    }

    async fn idle_wait(
        &mut self,
        deadline: Duration,
        _grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleEvent, ImapError> {
        self.ensure_usable()?;
        let scripted = self.record("idle".to_string()).idle_script.pop_front();
        if let Some(event) = scripted {
            return Ok(event);
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(IdleEvent::Cancelled),
            _ = tokio::time::sleep(deadline) => Ok(IdleEvent::TimedOut),
        }
    }

    async fn close(&mut self) {
        if self.usable {
            self.record("close".to_string());
        }
        self.usable = false;
    }
}

/// Hands out [`FakeStore`]s over one shared mailbox.
pub struct FakeConnector {
    handle: FakeHandle,
    failures_left: AtomicU32,
    connects: AtomicU32,
}

impl FakeConnector {
    pub fn new(handle: FakeHandle) -> Self {
        FakeConnector::failing(handle, 0)
    }

    /// Fails the first `failures` connection attempts.
    pub fn failing(handle: FakeHandle, failures: u32) -> Self {
        FakeConnector {
            handle,
            failures_left: AtomicU32::new(failures),
            connects: AtomicU32::new(0),
        }
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for Arc<FakeConnector> {
    async fn connect(&self) -> Result<Box<dyn MailStore>, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectError::Auth {
                username: "board@org.example".to_string(),
                message: "authentication failed".to_string(),
            });
        }
        Ok(Box::new(FakeStore::attach(self.handle.clone())))
    }
}

pub struct SentMail {
    pub envelope_to: Vec<String>,
    pub raw: String,
}

#[derive(Default)]
pub struct FakeOutbound {
    sent: Mutex<Vec<SentMail>>,
    fail: AtomicBool,
}

impl FakeOutbound {
    pub fn failing() -> Self {
        let outbound = FakeOutbound::default();
        outbound.set_failing(true);
        outbound
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> MutexGuard<'_, Vec<SentMail>> {
        self.sent.lock().unwrap()
    }
}

#[async_trait]
impl Outbound for FakeOutbound {
    async fn send(&self, message: Message) -> Result<(), RelayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Send("connection refused".to_string()));
        }
        let envelope_to = message
            .envelope()
            .to()
            .iter()
            .map(|address| address.to_string())
            .collect();
        let raw = String::from_utf8_lossy(&message.formatted()).into_owned();
        self.sent().push(SentMail { envelope_to, raw });
        Ok(())
    }
}
