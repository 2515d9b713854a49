//! Reconnection supervisor: the single task that owns the live source.
//!
//! Every `select!` below also listens on the command channel, so a stop or a
//! switch never waits for the next sample, a connect, or a backoff sleep.

use ground_proto::{ConnectionState, DisconnectReason};
use ground_source::{SourceConfig, TelemetrySource};
use ground_store::PersistenceError;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::dispatch::Dispatcher;

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Retries after the first failure. 0 means unlimited.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_auto_reconnect() -> bool {
    true
}
fn default_interval_ms() -> u64 {
    2000
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(c: &ReconnectConfig) -> Self {
        Self {
            auto_reconnect: c.auto_reconnect,
            interval: Duration::from_millis(c.interval_ms),
            max_attempts: c.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Whether `failures` consecutive failures end the session.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        !self.auto_reconnect || (self.max_attempts != 0 && failures > self.max_attempts)
    }
}

/// Builds a fresh source for a config. `ground_source::build_source` is the
/// production factory; tests pass closures returning scripted sources.
pub trait SourceFactory: Send {
    fn build(&mut self, cfg: &SourceConfig) -> Box<dyn TelemetrySource>;
}

impl<F> SourceFactory for F
where
    F: FnMut(&SourceConfig) -> Box<dyn TelemetrySource> + Send,
{
    fn build(&mut self, cfg: &SourceConfig) -> Box<dyn TelemetrySource> {
        self(cfg)
    }
}

#[derive(Debug)]
enum Command {
    Switch(SourceConfig),
    Stop,
    Shutdown,
}

#[derive(Debug, Error)]
#[error("supervisor task has exited")]
pub struct SupervisorGone;

/// Cloneable control handle. Commands are applied in order.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    /// Stops the current source, then connects `cfg`.
    pub fn switch(&self, cfg: SourceConfig) -> Result<(), SupervisorGone> {
        self.send(Command::Switch(cfg))
    }

    /// Idempotent; stopping twice reports `Disconnected(Stopped)` once.
    pub fn stop(&self) -> Result<(), SupervisorGone> {
        self.send(Command::Stop)
    }

    /// Stops, flushes and closes history, then ends the task.
    pub fn shutdown(&self) -> Result<(), SupervisorGone> {
        self.send(Command::Shutdown)
    }

    fn send(&self, cmd: Command) -> Result<(), SupervisorGone> {
        self.tx.send(cmd).map_err(|_| SupervisorGone)
    }
}

/// Spawns the supervisor. The join handle resolves after `shutdown` (or once
/// every handle is dropped) with the result of closing the history store.
pub fn spawn<F>(
    factory: F,
    policy: ReconnectPolicy,
    dispatcher: Dispatcher,
    initial: Option<SourceConfig>,
) -> (SupervisorHandle, JoinHandle<Result<(), PersistenceError>>)
where
    F: SourceFactory + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let ticker = dispatcher.flush_interval().map(|period| {
        let mut t = interval_at(Instant::now() + period, period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });
    let sup = Supervisor { factory, policy, dispatcher, commands: rx, ticker };
    let task = tokio::spawn(sup.run(initial));
    (SupervisorHandle { tx }, task)
}

/// What the supervisor does after a session ends.
enum Next {
    Idle,
    Connect(SourceConfig),
    Shutdown,
}

/// Why a connected stream ended.
enum StreamEnd {
    Command(Next),
    Lost(String),
    Watchdog,
}

enum Wake {
    Deadline,
    Command(Next),
}

struct Supervisor<F> {
    factory: F,
    policy: ReconnectPolicy,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    ticker: Option<Interval>,
}

impl<F: SourceFactory> Supervisor<F> {
    async fn run(mut self, initial: Option<SourceConfig>) -> Result<(), PersistenceError> {
        let mut next = initial.map_or(Next::Idle, Next::Connect);
        loop {
            next = match next {
                Next::Connect(cfg) => self.session(cfg).await,
                Next::Idle => match self.wait(None).await {
                    Wake::Command(next) => self.settle(next).await,
                    Wake::Deadline => Next::Idle,
                },
                Next::Shutdown => break,
            };
        }
        info!("supervisor: shutting down");
        self.dispatcher.close().await
    }

    /// Connect, stream, and retry per policy until stopped, switched or halted.
    async fn session(&mut self, cfg: SourceConfig) -> Next {
        let mut source = self.factory.build(&cfg);
        let mut failures: u32 = 0;

        loop {
            let attempt = failures + 1;
            self.dispatcher.set_state(ConnectionState::Connecting { attempt }).await;
            info!("supervisor: connecting {} to {} (attempt {})", source.name(), cfg.endpoint(), attempt);

            let connected = tokio::select! {
                r = source.connect(cfg.endpoint(), cfg.connect_timeout()) => r,
                cmd = self.commands.recv() => return self.interrupt(&mut source, cmd).await,
            };

            let reason = match connected {
                Ok(()) => {
                    failures = 0;
                    let name = source.name().to_string();
                    self.dispatcher.set_state(ConnectionState::Connected { source: name }).await;
                    self.dispatcher.arm_watchdog(Instant::now());

                    match self.stream(&mut source).await {
                        StreamEnd::Command(next) => return next,
                        StreamEnd::Lost(reason) => {
                            source.stop().await;
                            Some(reason)
                        }
                        StreamEnd::Watchdog => {
                            source.stop().await;
                            self.dispatcher.set_state(ConnectionState::Disconnected(DisconnectReason::Timeout)).await;
                            None
                        }
                    }
                }
                Err(e) => {
                    source.stop().await;
                    Some(e.to_string())
                }
            };

            failures += 1;
            let terminal = self.policy.is_exhausted(failures);
            match reason {
                Some(reason) => {
                    warn!("supervisor: {} failed ({} consecutive): {}", source.name(), failures, reason);
                    self.dispatcher
                        .set_state(ConnectionState::Error { reason, attempts: failures, terminal })
                        .await;
                }
                None => warn!("supervisor: {} timed out ({} consecutive)", source.name(), failures),
            }

            if terminal {
                warn!("supervisor: giving up on {} after {} attempts", source.name(), failures);
                return Next::Idle;
            }

            match self.wait(Some(Instant::now() + self.policy.interval)).await {
                Wake::Deadline => {}
                Wake::Command(next) => return self.settle(next).await,
            }
        }
    }

    async fn stream(&mut self, source: &mut Box<dyn TelemetrySource>) -> StreamEnd {
        loop {
            let deadline = self.dispatcher.watchdog_deadline();
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    return StreamEnd::Command(self.interrupt(source, cmd).await);
                }
                _ = sleep_until_opt(deadline) => {
                    if self.dispatcher.poll_watchdog(Instant::now()) {
                        return StreamEnd::Watchdog;
                    }
                }
                _ = tick(&mut self.ticker) => self.dispatcher.tick().await,
                r = source.next_sample() => match r {
                    Ok(Some(sample)) => {
                        let name = source.name().to_string();
                        self.dispatcher.dispatch(&name, sample, Instant::now()).await;
                    }
                    Ok(None) => return StreamEnd::Lost("stream ended".into()),
                    Err(e) => return StreamEnd::Lost(e.to_string()),
                },
            }
        }
    }

    /// Applies a command that arrived while a source is live.
    async fn interrupt(&mut self, source: &mut Box<dyn TelemetrySource>, cmd: Option<Command>) -> Next {
        source.stop().await;
        self.dispatcher.set_state(ConnectionState::Disconnected(DisconnectReason::Stopped)).await;
        command_next(cmd)
    }

    /// A stop or shutdown with no live source still reports `Disconnected(Stopped)`.
    async fn settle(&mut self, next: Next) -> Next {
        if matches!(next, Next::Idle | Next::Shutdown) {
            self.dispatcher.set_state(ConnectionState::Disconnected(DisconnectReason::Stopped)).await;
        }
        next
    }

    /// Sleeps until `until` (forever when `None`) while serving flush ticks,
    /// returning early on a command.
    async fn wait(&mut self, until: Option<Instant>) -> Wake {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => return Wake::Command(command_next(cmd)),
                _ = sleep_until_opt(until) => return Wake::Deadline,
                _ = tick(&mut self.ticker) => self.dispatcher.tick().await,
            }
        }
    }
}

fn command_next(cmd: Option<Command>) -> Next {
    match cmd {
        Some(Command::Switch(cfg)) => Next::Connect(cfg),
        Some(Command::Stop) => Next::Idle,
        // All handles dropped: nobody can stop us later, so wind down now.
        Some(Command::Shutdown) | None => Next::Shutdown,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, StationEvent};
    use async_trait::async_trait;
    use ground_alert::{AlertConfig, AlertEngine};
    use ground_proto::TelemetrySample;
    use ground_source::{ConnectError, LinkLost, SourceKind};
    use ground_store::{HistoryConfig, HistoryStore};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Fails every connect, or streams its samples and then goes silent.
    /// With `refill` every connect streams the samples again.
    struct Scripted {
        connects: Arc<AtomicU32>,
        fail: bool,
        samples: VecDeque<TelemetrySample>,
        refill: Option<Vec<TelemetrySample>>,
        live: bool,
    }

    #[async_trait]
    impl TelemetrySource for Scripted {
        fn name(&self) -> &str {
            "SCRIPTED"
        }

        async fn connect(&mut self, _endpoint: &str, _timeout: Duration) -> Result<(), ConnectError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectError::Unavailable("no route".into()));
            }
            if let Some(script) = &self.refill {
                self.samples = script.iter().cloned().collect();
            }
            self.live = true;
            Ok(())
        }

        async fn next_sample(&mut self) -> Result<Option<TelemetrySample>, LinkLost> {
            if !self.live {
                return Ok(None);
            }
            if self.samples.is_empty() {
                return std::future::pending().await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(self.samples.pop_front())
        }

        async fn stop(&mut self) {
            self.live = false;
        }
    }

    fn factory(fail: bool, samples: usize, connects: Arc<AtomicU32>) -> impl SourceFactory {
        move |_: &SourceConfig| -> Box<dyn TelemetrySource> {
            Box::new(Scripted {
                connects: connects.clone(),
                fail,
                samples: (0..samples).map(|i| TelemetrySample::at(i as f64)).collect(),
                refill: None,
                live: false,
            })
        }
    }

    async fn station(
        dir: &tempfile::TempDir,
        link_timeout_s: f64,
    ) -> (Dispatcher, UnboundedReceiver<StationEvent>) {
        let history = HistoryConfig::new(dir.path().join("h.db"));
        let store = HistoryStore::open(&history.db_path).await.unwrap();
        let alerts = AlertEngine::new(&AlertConfig { link_timeout_s, ..AlertConfig::default() });
        let (observer, rx) = ChannelObserver::new();
        (Dispatcher::new(store, &history, alerts, Box::new(observer)).unwrap(), rx)
    }

    fn policy(auto_reconnect: bool, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy { auto_reconnect, interval: Duration::from_millis(20), max_attempts }
    }

    async fn next_state(rx: &mut UnboundedReceiver<StationEvent>) -> ConnectionState {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            if let StationEvent::Connection(st) = ev {
                return st;
            }
        }
    }

    fn states(events: &[StationEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                StationEvent::Connection(st) => Some(st.clone()),
                _ => None,
            })
            .collect()
    }

    async fn drain(rx: &mut UnboundedReceiver<StationEvent>) -> Vec<StationEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_policy_bounds() {
        let p = policy(true, 3);
        assert!(!p.is_exhausted(3));
        assert!(p.is_exhausted(4));
        assert!(policy(false, 3).is_exhausted(1));
        assert!(!policy(true, 0).is_exhausted(1_000));
    }

    #[tokio::test]
    async fn test_always_failing_connect_is_tried_four_times() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.0).await;
        let connects = Arc::new(AtomicU32::new(0));
        let (handle, task) = spawn(
            factory(true, 0, connects.clone()),
            policy(true, 3),
            dispatcher,
            Some(SourceConfig::new(SourceKind::Demo)),
        );

        let last = loop {
            let st = next_state(&mut rx).await;
            if st.is_terminal() {
                break st;
            }
        };
        assert_eq!(last, ConnectionState::Error { reason: "transport unavailable: no route".into(), attempts: 4, terminal: true });
        assert_eq!(connects.load(Ordering::SeqCst), 4);

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_attempt_numbers_and_non_terminal_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.0).await;
        let connects = Arc::new(AtomicU32::new(0));
        let (handle, task) = spawn(factory(true, 0, connects), policy(true, 1), dispatcher, None);
        handle.switch(SourceConfig::new(SourceKind::Radio)).unwrap();

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting { attempt: 1 });
        assert!(matches!(next_state(&mut rx).await, ConnectionState::Error { attempts: 1, terminal: false, .. }));
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting { attempt: 2 });
        assert!(matches!(next_state(&mut rx).await, ConnectionState::Error { attempts: 2, terminal: true, .. }));

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_auto_reconnect_off_halts_on_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.0).await;
        let connects = Arc::new(AtomicU32::new(0));
        let (handle, task) = spawn(
            factory(true, 0, connects.clone()),
            policy(false, 3),
            dispatcher,
            Some(SourceConfig::new(SourceKind::Demo)),
        );

        next_state(&mut rx).await;
        assert!(next_state(&mut rx).await.is_terminal());
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watchdog_disconnects_once_with_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.2).await;
        let connects = Arc::new(AtomicU32::new(0));
        let (handle, task) = spawn(
            factory(false, 3, connects.clone()),
            policy(false, 3),
            dispatcher,
            Some(SourceConfig::new(SourceKind::Demo)),
        );

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting { attempt: 1 });
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connected { source: "SCRIPTED".into() });
        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnected(DisconnectReason::Timeout));

        // Halted: nothing more until shutdown.
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();

        let rest = drain(&mut rx).await;
        assert_eq!(states(&rest), [ConnectionState::Disconnected(DisconnectReason::Stopped)]);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watchdog_timeout_counts_as_failure_and_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.2).await;
        let connects = Arc::new(AtomicU32::new(0));
        let (handle, task) = spawn(
            factory(false, 2, connects.clone()),
            policy(true, 3),
            dispatcher,
            Some(SourceConfig::new(SourceKind::Demo)),
        );

        // Wait for the reconnect after the first silent gap.
        loop {
            if next_state(&mut rx).await == (ConnectionState::Connecting { attempt: 2 }) {
                break;
            }
        }
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
        assert!(connects.load(Ordering::SeqCst) >= 2);

        let mut store = HistoryStore::open(&dir.path().join("h.db")).await.unwrap();
        assert!(store.get_all().await.unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_link_alert_clears_on_first_sample_after_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.2).await;
        let refilling = move |_: &SourceConfig| -> Box<dyn TelemetrySource> {
            Box::new(Scripted {
                connects: Arc::default(),
                fail: false,
                samples: VecDeque::new(),
                refill: Some(vec![TelemetrySample::at(0.0), TelemetrySample::at(0.1)]),
                live: false,
            })
        };
        let (handle, task) =
            spawn(refilling, policy(true, 3), dispatcher, Some(SourceConfig::new(SourceKind::Demo)));

        let mut trace = Vec::new();
        loop {
            let line = match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
                StationEvent::Alert(a) => format!("alert {}:{:?}", a.metric, a.level),
                StationEvent::Connection(st) => format!("state {}", st),
                StationEvent::Sample { .. } => "sample".to_string(),
            };
            let cleared = line == "alert link:Ok";
            trace.push(line);
            if cleared {
                break;
            }
        }
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();

        let count = |l: &str| trace.iter().filter(|t| *t == l).count();
        let pos = |l: &str| trace.iter().position(|t| t == l).unwrap();
        assert_eq!(count("alert link:Critical"), 1);
        assert_eq!(count("state connected (SCRIPTED)"), 2);
        assert!(pos("alert link:Critical") < pos("state disconnected (timeout)"));
        // Cleared by the first sample of the new session, ahead of that sample.
        assert_eq!(trace[trace.len() - 2], "state connected (SCRIPTED)");
    }

    #[tokio::test]
    async fn test_double_stop_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.0).await;
        let connects = Arc::new(AtomicU32::new(0));
        let (handle, task) = spawn(
            factory(false, 1, connects),
            policy(true, 3),
            dispatcher,
            Some(SourceConfig::new(SourceKind::Demo)),
        );

        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting { attempt: 1 });
        assert!(next_state(&mut rx).await.is_connected());

        handle.stop().unwrap();
        handle.stop().unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();

        let rest = drain(&mut rx).await;
        assert_eq!(states(&rest), [ConnectionState::Disconnected(DisconnectReason::Stopped)]);
    }

    #[tokio::test]
    async fn test_switch_stops_before_connecting_next() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.0).await;
        let connects = Arc::new(AtomicU32::new(0));
        let (handle, task) = spawn(
            factory(false, 0, connects.clone()),
            policy(true, 3),
            dispatcher,
            Some(SourceConfig::new(SourceKind::Demo)),
        );

        next_state(&mut rx).await;
        assert!(next_state(&mut rx).await.is_connected());
        handle.switch(SourceConfig::new(SourceKind::Replay)).unwrap();

        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnected(DisconnectReason::Stopped));
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting { attempt: 1 });
        assert!(next_state(&mut rx).await.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_samples_reach_observer_with_alerts_first() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = station(&dir, 0.0).await;
        let low_battery = move |_: &SourceConfig| -> Box<dyn TelemetrySource> {
            let mut s = TelemetrySample::at(0.5);
            s.battery_percent = Some(12.0);
            Box::new(Scripted {
                connects: Arc::default(),
                fail: false,
                samples: VecDeque::from([s]),
                refill: None,
                live: false,
            })
        };
        let (handle, task) =
            spawn(low_battery, policy(true, 3), dispatcher, Some(SourceConfig::new(SourceKind::Demo)));

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
                StationEvent::Alert(a) => seen.push(format!("{}:{:?}", a.metric, a.level)),
                StationEvent::Sample { source, .. } => seen.push(source),
                StationEvent::Connection(_) => {}
            }
        }
        assert_eq!(seen, ["battery:Warning", "battery:Critical", "SCRIPTED"]);

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }
}
