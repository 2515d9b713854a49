pub mod demo;
pub mod doctor;
pub mod error;
pub mod line;
pub mod mav;
pub mod radio;

use async_trait::async_trait;
use ground_proto::TelemetrySample;
use serde::Deserialize;
use std::time::Duration;

pub use demo::DemoSource;
pub use error::{ConnectError, LinkLost};
pub use mav::FlightControllerLink;
pub use radio::RadioLink;

/// One live telemetry feed. At most one is active at a time.
///
/// `next_sample` is the stream: it yields `Ok(None)` before any `connect`
/// and after `stop`, and `Err` when the transport dies. A fresh `connect`
/// is needed after either.
#[async_trait]
pub trait TelemetrySource: Send {
    fn name(&self) -> &str;

    async fn connect(&mut self, endpoint: &str, timeout: Duration) -> Result<(), ConnectError>;

    async fn next_sample(&mut self) -> Result<Option<TelemetrySample>, LinkLost>;

    /// Safe to call repeatedly and from any state.
    async fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Demo,
    Fc,
    Radio,
    Replay,
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "demo" => Ok(SourceKind::Demo),
            "fc" | "mavlink" => Ok(SourceKind::Fc),
            "radio" | "lora" => Ok(SourceKind::Radio),
            "replay" => Ok(SourceKind::Replay),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,

    /// MAVLink address (`udpin:0.0.0.0:14540`), serial device, or replay log path.
    pub endpoint: Option<String>,

    /// Radio serial baud. Default 57600.
    pub baud: Option<u32>,

    /// Budget for connect + first health report. Default 10s.
    pub connect_timeout_ms: Option<u64>,

    /// Radio read poll. Default 2s.
    pub poll_timeout_ms: Option<u64>,
}

impl SourceConfig {
    pub fn new(kind: SourceKind) -> Self {
        Self { kind, endpoint: None, baud: None, connect_timeout_ms: None, poll_timeout_ms: None }
    }

    pub fn endpoint(&self) -> &str {
        match (&self.endpoint, self.kind) {
            (Some(e), _) => e,
            (None, SourceKind::Demo) => "demo",
            (None, SourceKind::Fc) => mav::DEFAULT_ENDPOINT,
            (None, SourceKind::Radio) => "/dev/ttyUSB0",
            (None, SourceKind::Replay) => "",
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(10_000))
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout_ms.map(Duration::from_millis).unwrap_or(radio::DEFAULT_POLL_TIMEOUT)
    }
}

/// Builds the source for a config section. Nothing is opened until `connect`.
pub fn build_source(cfg: &SourceConfig) -> Box<dyn TelemetrySource> {
    match cfg.kind {
        SourceKind::Demo => Box::new(DemoSource::new()),
        SourceKind::Fc => Box::new(FlightControllerLink::new()),
        SourceKind::Radio => Box::new(
            RadioLink::serial(cfg.baud.unwrap_or(radio::DEFAULT_BAUD)).with_poll_timeout(cfg.poll_timeout()),
        ),
        SourceKind::Replay => Box::new(RadioLink::replay().with_poll_timeout(cfg.poll_timeout())),
    }
}
