pub mod backoff;
pub mod pass;
mod serve;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use itertools::Itertools;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{CheckError, FetchError, RelayError};
use crate::mail_reader::fetcher::FetchLimits;
use crate::mail_reader::filter::SenderFilter;
use crate::mail_reader::imap::ImapConnector;
use crate::mail_reader::message::Uid;
use crate::mail_reader::state::SharedState;
use crate::mail_reader::store::{Connector, MailStore, MailboxStatus};
use crate::mail_relay::Relay;
use crate::settings::{Config, Timeouts, WatchConfig};
pub use pass::PassReport;
use pass::PassContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Disconnected,
    Idle,
    Processing,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProblematicUid {
    pub uid: Uid,
    pub failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: WatchState,
    /// A pass is in flight right now.
    pub busy: bool,
    pub last_report: Option<PassReport>,
    pub mailbox: Option<MailboxStatus>,
    pub problematic_uids: Vec<ProblematicUid>,
}

/// The mail reflector: one-shot checks and the long-running watch loop.
///
/// Cheap to clone; clones share the pass guard, the failure registry and the
/// last report.
#[derive(Clone)]
pub struct Reflector {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Box<dyn Connector>,
    relay: Relay,
    filter: SenderFilter,
    state: Arc<SharedState>,
    // One pass at a time, across the watch loop and manual checks
    guard: Semaphore,
    watch_state: Mutex<WatchState>,
    last_report: Mutex<Option<PassReport>>,
    timeouts: Timeouts,
    limits: FetchLimits,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Reflector {
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        let state = Arc::new(SharedState::new(config.watch.failure_threshold));
        let connector = ImapConnector::new(
            config.imap.clone(),
            config.watch.timeouts(),
            state.clone(),
        );
        let relay = Relay::from_config(config)?;
        let filter = SenderFilter::new(&config.filter.from);
        info!(
            "Reflecting mail from {} to {} recipient(s)",
            filter.addresses().join(", "),
            config.recipients.len()
        );

        Ok(Reflector::new(
            Box::new(connector),
            relay,
            filter,
            state,
            &config.watch,
        ))
    }

    pub fn new(
        connector: Box<dyn Connector>,
        relay: Relay,
        filter: SenderFilter,
        state: Arc<SharedState>,
        watch: &WatchConfig,
    ) -> Self {
        let timeouts = watch.timeouts();
        Reflector {
            inner: Arc::new(Inner {
                connector,
                relay,
                filter,
                state,
                guard: Semaphore::new(1),
                watch_state: Mutex::new(WatchState::Disconnected),
                last_report: Mutex::new(None),
                timeouts,
                limits: FetchLimits {
                    validation: timeouts.validation,
                    message: timeouts.message,
                },
                reconnect_base: Duration::from_secs(watch.reconnect_base_secs),
                reconnect_max: Duration::from_secs(watch.reconnect_max_secs),
            }),
        }
    }

    /// Runs one pass over a fresh connection, closed again afterwards.
    ///
    /// Returns [`CheckError::Busy`] without touching the server when another
    /// pass is in flight.
    pub async fn check_once(&self, cancel: &CancellationToken) -> Result<PassReport, CheckError> {
        let _permit = self
            .inner
            .guard
            .try_acquire()
            .map_err(|_| CheckError::Busy)?;

        let mut store = self.inner.connector.connect().await?;
        let result = self.run_pass(store.as_mut(), cancel).await;
        store.close().await;
        result?.ok_or(CheckError::Cancelled)
    }

    /// Runs one pass; `None` when it was abandoned `stop_grace` after
    /// `cancel` fired. An abandoned pass may have left a command half done,
    /// so its session is invalidated.
    async fn run_pass(
        &self,
        store: &mut dyn MailStore,
        cancel: &CancellationToken,
    ) -> Result<Option<PassReport>, FetchError> {
        let context = PassContext {
            filter: &self.inner.filter,
            registry: &self.inner.state.problematic,
            relay: &self.inner.relay,
            limits: self.inner.limits,
        };
        let grace = self.inner.timeouts.stop_grace;
        let abandon = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        let finished = tokio::select! {
            result = pass::run_pass(store, context, cancel) => Some(result),
            _ = abandon => None,
        };
        let Some(result) = finished else {
            warn!("Pass still running {:?} after shutdown began, abandoning it", grace);
            store.invalidate();
            return Ok(None);
        };

        let report = result?;
        *lock(&self.inner.last_report) = Some(report.clone());
        Ok(Some(report))
    }

    fn set_state(&self, state: WatchState) {
        *lock(&self.inner.watch_state) = state;
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: *lock(&self.inner.watch_state),
            busy: self.inner.guard.available_permits() == 0,
            last_report: lock(&self.inner.last_report).clone(),
            mailbox: self.inner.state.mailbox_status(),
            problematic_uids: self
                .inner
                .state
                .problematic
                .snapshot()
                .into_iter()
                .map(|(uid, failures)| ProblematicUid { uid, failures })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeHandle, FakeMailbox, FakeOutbound};

    fn reflector(handle: FakeHandle) -> (Reflector, Arc<FakeConnector>, Arc<FakeOutbound>) {
        let connector = Arc::new(FakeConnector::new(handle));
        let outbound = Arc::new(FakeOutbound::default());
        let relay = Relay::new(
            outbound.clone(),
            "relay@org.example".parse().unwrap(),
            vec!["alice@org.example".parse().unwrap()],
            String::new(),
            vec!["Sent".to_string()],
        );
        let reflector = Reflector::new(
            Box::new(connector.clone()),
            relay,
            SenderFilter::new(["board@org.example"]),
            Arc::new(SharedState::new(3)),
            &WatchConfig::default(),
        );
        (reflector, connector, outbound)
    }

    #[tokio::test]
    async fn check_once_closes_its_connection() {
        let mut mailbox = FakeMailbox::default();
        mailbox.add_text(1, "board@org.example", "Update", "hello");
        let handle = FakeHandle::new(mailbox);
        let (reflector, connector, outbound) = reflector(handle.clone());

        let report = reflector.check_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.forwarded, 1);
        assert_eq!(connector.connects(), 1);
        assert_eq!(outbound.sent().len(), 1);
        assert!(handle.calls().contains(&"close".to_string()));

        let status = reflector.status();
        assert!(!status.busy);
        assert_eq!(status.last_report.unwrap().forwarded, 1);
    }

    #[tokio::test]
    async fn second_pass_is_rejected_while_one_runs() {
        let (reflector, connector, _) = reflector(FakeHandle::new(FakeMailbox::default()));

        let _permit = reflector.inner.guard.try_acquire().unwrap();
        assert!(reflector.status().busy);

        let err = reflector
            .check_once(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Busy));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let failing = Reflector::new(
            Box::new(Arc::new(FakeConnector::failing(
                FakeHandle::new(FakeMailbox::default()),
                1,
            ))),
            Relay::new(
                Arc::new(FakeOutbound::default()),
                "relay@org.example".parse().unwrap(),
                Vec::new(),
                String::new(),
                Vec::new(),
            ),
            SenderFilter::default(),
            Arc::new(SharedState::new(3)),
            &WatchConfig::default(),
        );

        let err = failing.check_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CheckError::Connect(_)));
        assert!(failing.status().last_report.is_none());
        assert!(!failing.status().busy);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_pass_is_abandoned_on_shutdown() {
        let mut mailbox = FakeMailbox::default();
        mailbox.add_text(1, "board@org.example", "Slow", "x");
        mailbox.hanging.insert(1);
        let handle = FakeHandle::new(mailbox);
        let (reflector, _, outbound) = reflector(handle.clone());

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            }
        });

        let started = tokio::time::Instant::now();
        let err = reflector.check_once(&cancel).await.unwrap_err();
        assert!(matches!(err, CheckError::Cancelled));
        // Stop grace, well before the message timeout
        assert!(started.elapsed() < WatchConfig::default().timeouts().message);
        assert_eq!(handle.count_calls("close"), 0);
        assert!(outbound.sent().is_empty());
        assert!(reflector.status().last_report.is_none());
        assert!(!reflector.status().busy);
    }
}
