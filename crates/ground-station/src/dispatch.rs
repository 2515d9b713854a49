use anyhow::Result;
use ground_alert::{AlertEngine, LinkCheck};
use ground_proto::{ConnectionState, TelemetrySample};
use ground_store::{HistoryConfig, HistoryStore, PersistenceError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::observer::StationObserver;

/// Fans each sample out to history, alerts and the observer, in that order.
pub struct Dispatcher {
    store: HistoryStore,
    flush_every_sample: bool,
    flush_interval: Option<Duration>,
    alerts: AlertEngine,
    observer: Box<dyn StationObserver>,
    state: ConnectionState,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state)
            .field("pending", &self.store.pending())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: HistoryStore,
        history: &HistoryConfig,
        alerts: AlertEngine,
        observer: Box<dyn StationObserver>,
    ) -> Result<Self> {
        anyhow::ensure!(
            history.has_flush_policy(),
            "history needs flush_every_sample or a flush interval, otherwise nothing is ever written"
        );
        Ok(Self {
            store,
            flush_every_sample: history.flush_every_sample,
            flush_interval: history.flush_interval(),
            alerts,
            observer,
            state: ConnectionState::default(),
        })
    }

    pub async fn dispatch(&mut self, source: &str, sample: TelemetrySample, now: Instant) {
        match self.store.append(source, &sample) {
            Ok(()) if self.flush_every_sample => self.flush().await,
            Ok(()) => {}
            Err(e) => warn!("history: append failed: {}", e),
        }

        for event in self.alerts.evaluate(&sample, now) {
            self.observer.on_alert_change(&event);
        }

        self.observer.on_sample(source, &sample);
    }

    /// Periodic flush hook.
    pub async fn tick(&mut self) {
        self.flush().await;
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    async fn flush(&mut self) {
        if let Err(e) = self.store.flush().await {
            warn!("history: flush failed, {} rows kept for retry: {}", self.store.pending(), e);
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Publishes a state change. Repeating the current state emits nothing.
    pub async fn set_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }
        let was_connected = self.state.is_connected();
        self.state = state;
        if was_connected && !self.state.is_connected() {
            self.alerts.disarm();
            self.flush().await;
        }
        self.observer.on_connection_change(&self.state);
    }

    pub fn arm_watchdog(&mut self, now: Instant) {
        self.alerts.arm(now);
    }

    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.alerts.deadline()
    }

    /// True when the link watchdog fired. A new link alert has already been emitted.
    pub fn poll_watchdog(&mut self, now: Instant) -> bool {
        match self.alerts.poll_watchdog(now) {
            LinkCheck::Alive => false,
            LinkCheck::Silent(event) => {
                warn!("link: no sample before watchdog deadline");
                if let Some(event) = event {
                    self.observer.on_alert_change(&event);
                }
                true
            }
        }
    }

    pub fn pending_rows(&self) -> usize {
        self.store.pending()
    }

    pub async fn close(self) -> Result<(), PersistenceError> {
        self.store.close().await
    }
}
