use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::{Reflector, WatchState};
use crate::mail_reader::store::{IdleEvent, MailStore};

enum SessionEnd {
    Cancelled,
    Lost(String),
}

/// Sleeps for `duration`; false when `cancel` fired first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

impl Reflector {
    /// Watches the mailbox until `cancel` fires.
    ///
    /// Each connection starts with a full pass, then alternates between
    /// waiting for changes (IDLE, or polling without it) and processing.
    /// Lost connections are re-established with exponential backoff.
    pub async fn serve(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.inner.reconnect_base, self.inner.reconnect_max);
        info!("Watch loop started");

        while !cancel.is_cancelled() {
            self.set_state(WatchState::Disconnected);

            let connected = tokio::select! {
                result = self.inner.connector.connect() => result,
                _ = cancel.cancelled() => break,
            };

            match connected {
                Ok(mut store) => {
                    backoff.reset();
                    let end = self.watch_session(store.as_mut(), &cancel).await;
                    if let SessionEnd::Cancelled = end {
                        self.set_state(WatchState::ShuttingDown);
                    }
                    store.close().await;

                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(reason) => warn!("Connection lost: {}", reason),
                    }
                }
                Err(e) => error!("Failed to connect: {}", e),
            }

            let delay = backoff.next_delay();
            info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        self.set_state(WatchState::ShuttingDown);
        info!("Watch loop stopped");
    }

    async fn watch_session(
        &self,
        store: &mut dyn MailStore,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let timeouts = self.inner.timeouts;
        info!(
            "Watching {} ({})",
            store.server(),
            if store.supports_idle() { "IDLE" } else { "polling" }
        );

        loop {
            if let Some(end) = self.triggered_pass(store, cancel).await {
                return end;
            }
            if cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }
            if !store.is_usable() {
                return SessionEnd::Lost("session is no longer usable".to_string());
            }

            self.set_state(WatchState::Idle);
            let event = if store.supports_idle() {
                match store
                    .idle_wait(timeouts.idle, timeouts.stop_grace, cancel)
                    .await
                {
                    Ok(event) => event,
                    Err(e) => return SessionEnd::Lost(format!("idle failed: {}", e)),
                }
            } else if sleep_or_cancel(timeouts.poll_interval, cancel).await {
                IdleEvent::TimedOut
            } else {
                IdleEvent::Cancelled
            };

            match event {
                IdleEvent::Cancelled => return SessionEnd::Cancelled,
                IdleEvent::MailboxChanged => debug!("Mailbox changed"),
                IdleEvent::TimedOut => debug!("No change reported, refreshing"),
            }
        }
    }

    /// Runs a pass unless one is already in flight, in which case the trigger
    /// is dropped.
    async fn triggered_pass(
        &self,
        store: &mut dyn MailStore,
        cancel: &CancellationToken,
    ) -> Option<SessionEnd> {
        let Ok(_permit) = self.inner.guard.try_acquire() else {
            debug!("A pass is already running, dropping trigger");
            return None;
        };

        self.set_state(WatchState::Processing);
        match self.run_pass(store, cancel).await {
            Ok(Some(_)) => None,
            Ok(None) => Some(SessionEnd::Cancelled),
            Err(e) => {
                error!("Pass aborted: {}", e);
                Some(SessionEnd::Lost(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail_reader::filter::SenderFilter;
    use crate::mail_reader::state::SharedState;
    use crate::mail_relay::Relay;
    use crate::settings::WatchConfig;
    use crate::testing::{FakeConnector, FakeHandle, FakeMailbox, FakeOutbound};
    use std::sync::Arc;

    fn reflector(connector: Arc<FakeConnector>, watch: &WatchConfig) -> Reflector {
        Reflector::new(
            Box::new(connector),
            Relay::new(
                Arc::new(FakeOutbound::default()),
                "relay@org.example".parse().unwrap(),
                vec!["alice@org.example".parse().unwrap()],
                String::new(),
                Vec::new(),
            ),
            SenderFilter::new(["board@org.example"]),
            Arc::new(SharedState::new(3)),
            watch,
        )
    }

    async fn wait_for(handle: &FakeHandle, call: &str, times: usize) {
        while handle.count_calls(call) < times {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn cancel_during_idle_stops_without_fetching() {
        let handle = FakeHandle::new(FakeMailbox::default());
        let connector = Arc::new(FakeConnector::new(handle.clone()));
        let reflector = reflector(connector.clone(), &WatchConfig::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let reflector = reflector.clone();
            let cancel = cancel.clone();
            async move { reflector.serve(cancel).await }
        });

        wait_for(&handle, "idle", 1).await;
        assert_eq!(reflector.status().state, WatchState::Idle);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.count_calls("search_unseen"), 1);
        assert_eq!(handle.count_calls("close"), 1);
        assert_eq!(connector.connects(), 1);
        assert_eq!(reflector.status().state, WatchState::ShuttingDown);
    }

    #[tokio::test]
    async fn mailbox_change_triggers_a_pass() {
        let mut mailbox = FakeMailbox::default();
        mailbox.idle_script.push_back(IdleEvent::MailboxChanged);
        let handle = FakeHandle::new(mailbox);
        let reflector = reflector(
            Arc::new(FakeConnector::new(handle.clone())),
            &WatchConfig::default(),
        );
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let reflector = reflector.clone();
            let cancel = cancel.clone();
            async move { reflector.serve(cancel).await }
        });

        wait_for(&handle, "idle", 2).await;
        cancel.cancel();
        task.await.unwrap();

        // Initial pass plus the one for the change
        assert_eq!(handle.count_calls("search_unseen"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff() {
        let handle = FakeHandle::new(FakeMailbox::default());
        let connector = Arc::new(FakeConnector::failing(handle.clone(), 2));
        let reflector = reflector(connector.clone(), &WatchConfig::default());
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let task = tokio::spawn({
            let reflector = reflector.clone();
            let cancel = cancel.clone();
            async move { reflector.serve(cancel).await }
        });

        wait_for(&handle, "idle", 1).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(connector.connects(), 3);
        // 10s after the first failure, 20s after the second
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_without_idle_support() {
        let mut mailbox = FakeMailbox::default();
        mailbox.idle_unsupported = true;
        let handle = FakeHandle::new(mailbox);
        let watch = WatchConfig {
            poll_interval_secs: 1,
            ..WatchConfig::default()
        };
        let reflector = reflector(Arc::new(FakeConnector::new(handle.clone())), &watch);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let reflector = reflector.clone();
            let cancel = cancel.clone();
            async move { reflector.serve(cancel).await }
        });

        wait_for(&handle, "search_unseen", 3).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(handle.count_calls("idle"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_does_not_wait_for_a_stuck_pass() {
        let mut mailbox = FakeMailbox::default();
        mailbox.add_text(1, "board@org.example", "Slow", "x");
        mailbox.hanging.insert(1);
        let handle = FakeHandle::new(mailbox);
        let reflector = reflector(
            Arc::new(FakeConnector::new(handle.clone())),
            &WatchConfig::default(),
        );
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let reflector = reflector.clone();
            let cancel = cancel.clone();
            async move { reflector.serve(cancel).await }
        });

        wait_for(&handle, "fetch_message 1", 1).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();
        task.await.unwrap();

        assert!(started.elapsed() <= WatchConfig::default().timeouts().stop_grace);
        assert_eq!(handle.count_calls("idle"), 0);
        assert_eq!(reflector.status().state, WatchState::ShuttingDown);
    }

    #[tokio::test]
    async fn unusable_session_is_replaced() {
        let mut mailbox = FakeMailbox::default();
        mailbox.add_text(1, "board@org.example", "Slow", "x");
        mailbox.hanging.insert(1);
        let handle = FakeHandle::new(mailbox);
        let connector = Arc::new(FakeConnector::new(handle.clone()));
        let watch = WatchConfig {
            message_timeout_secs: 0,
            reconnect_base_secs: 1,
            ..WatchConfig::default()
        };
        let reflector = reflector(connector.clone(), &watch);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let reflector = reflector.clone();
            let cancel = cancel.clone();
            async move { reflector.serve(cancel).await }
        });

        while connector.connects() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let status = reflector.status();
        assert_eq!(status.problematic_uids.len(), 1);
        assert!(status.problematic_uids[0].failures >= 1);
    }
}
