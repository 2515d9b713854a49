use ground_alert::{AlertEvent, AlertLevel};
use ground_proto::{ConnectionState, TelemetrySample};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Presentation boundary. Called on the supervisor task, in dispatch order.
pub trait StationObserver: Send {
    fn on_sample(&mut self, _source: &str, _sample: &TelemetrySample) {}
    fn on_connection_change(&mut self, _state: &ConnectionState) {}
    fn on_alert_change(&mut self, _event: &AlertEvent) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    Sample { source: String, sample: TelemetrySample },
    Connection(ConnectionState),
    Alert(AlertEvent),
}

/// Forwards every callback as a [`StationEvent`]. Events are dropped once
/// the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StationEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StationObserver for ChannelObserver {
    fn on_sample(&mut self, source: &str, sample: &TelemetrySample) {
        let _ = self.tx.send(StationEvent::Sample { source: source.to_string(), sample: sample.clone() });
    }

    fn on_connection_change(&mut self, state: &ConnectionState) {
        let _ = self.tx.send(StationEvent::Connection(state.clone()));
    }

    fn on_alert_change(&mut self, event: &AlertEvent) {
        let _ = self.tx.send(StationEvent::Alert(event.clone()));
    }
}

/// Logs everything; used by the headless binary.
#[derive(Debug, Default)]
pub struct TracingObserver {
    samples: u64,
}

impl StationObserver for TracingObserver {
    fn on_sample(&mut self, source: &str, s: &TelemetrySample) {
        self.samples += 1;
        debug!(
            "{} t={:.1}s lat={:?} lon={:?} alt={:?} bat={:?} mode={:?}",
            source, s.time_s, s.lat_deg, s.lon_deg, s.rel_alt_m, s.battery_percent, s.flight_mode
        );
        if self.samples % 100 == 0 {
            info!("{}: {} samples received", source, self.samples);
        }
    }

    fn on_connection_change(&mut self, state: &ConnectionState) {
        match state {
            ConnectionState::Error { terminal: true, .. } => warn!("link: {}", state),
            _ => info!("link: {}", state),
        }
    }

    fn on_alert_change(&mut self, e: &AlertEvent) {
        match (e.level, e.value) {
            (AlertLevel::Ok, Some(v)) => info!("alert cleared: {} ({:.1})", e.metric, v),
            (AlertLevel::Ok, None) => info!("alert cleared: {}", e.metric),
            (level, Some(v)) => warn!("alert {:?}: {} ({:.1})", level, e.metric, v),
            (level, None) => warn!("alert {:?}: {}", level, e.metric),
        }
    }
}
