use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectError, ImapError};
use crate::mail_reader::message::{Envelope, Uid};

/// Last-known counters of the selected mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MailboxStatus {
    pub exists: u32,
    pub unseen: Option<u32>,
    pub uid_validity: Option<u32>,
}

/// Why an idle wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The server pushed an untagged update for the selected mailbox.
    MailboxChanged,
    /// The wait hit its own deadline; the caller re-issues it.
    TimedOut,
    Cancelled,
}

/// One authenticated session against the mailbox server.
///
/// Commands are strictly sequential: a session never has an idle wait and
/// another command in flight at the same time.
#[async_trait]
pub trait MailStore: Send {
    fn server(&self) -> &str;

    fn supports_idle(&self) -> bool;

    /// False once a timeout or transport error may have desynchronized the
    /// session; it must then be closed and replaced.
    fn is_usable(&self) -> bool;

    fn invalidate(&mut self);

    /// Selects `name`, skipping the round-trip when it is already selected
    /// in the same mode.
    async fn select_mailbox(&mut self, name: &str, read_only: bool)
        -> Result<MailboxStatus, ImapError>;

    async fn search_unseen(&mut self) -> Result<Vec<Uid>, ImapError>;

    /// Envelopes for the UIDs that still exist. Stale UIDs are simply absent.
    async fn fetch_envelopes(&mut self, uids: &[Uid]) -> Result<Vec<(Uid, Envelope)>, ImapError>;

    /// Full RFC 822 source of `uid`, read without setting `\Seen`.
    async fn fetch_message(&mut self, uid: Uid) -> Result<Option<Vec<u8>>, ImapError>;

    async fn mark_seen(&mut self, uid: Uid) -> Result<(), ImapError>;

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, ImapError>;

    async fn append(&mut self, mailbox: &str, content: &[u8]) -> Result<(), ImapError>;

    /// Waits for a mailbox change, the deadline, or `cancel`.
    ///
    /// The wait is always terminated before returning; `grace` bounds how long
    /// the server gets to acknowledge the stop.
    async fn idle_wait(
        &mut self,
        deadline: Duration,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleEvent, ImapError>;

    /// Logs out. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailStore>, ConnectError>;
}
