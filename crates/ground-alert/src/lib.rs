pub mod battery;
pub mod doctor;
pub mod limit;
pub mod watchdog;

use ground_proto::TelemetrySample;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use battery::BatteryMonitor;
use limit::{Bound, EdgeAlert};
use watchdog::LinkWatchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertLevel {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Battery,
    Altitude,
    Speed,
    Temperature,
    Gps,
    Link,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Battery => "battery",
            Metric::Altitude => "altitude",
            Metric::Speed => "speed",
            Metric::Temperature => "temperature",
            Metric::Gps => "gps",
            Metric::Link => "link",
        })
    }
}

/// One alert transition, raise or clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub metric: Metric,
    pub level: AlertLevel,
    /// Reading that caused the transition; `None` for link events.
    pub value: Option<f64>,
}

/// Outcome of a link watchdog poll.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCheck {
    Alive,
    /// No sample before the deadline. Carries the raise event unless the link
    /// alert was already active from an earlier gap.
    Silent(Option<AlertEvent>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryRule {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub warning_pct: f64,
    pub critical_pct: f64,
    /// Points above a threshold needed before the level drops back.
    #[serde(default = "default_recovery_margin")]
    pub recovery_margin_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitRule {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsRule {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub min_sats: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_battery")]
    pub battery: BatteryRule,
    /// Relative altitude ceiling, metres.
    #[serde(default = "default_altitude")]
    pub altitude: LimitRule,
    /// Ground speed ceiling, m/s.
    #[serde(default = "default_speed")]
    pub speed: LimitRule,
    /// Ambient temperature ceiling, deg C.
    #[serde(default = "default_temperature")]
    pub temperature: LimitRule,
    #[serde(default = "default_gps")]
    pub gps: GpsRule,
    /// Seconds without a sample before the link is declared lost. 0 disables.
    #[serde(default = "default_link_timeout")]
    pub link_timeout_s: f64,
}

fn enabled() -> bool {
    true
}
fn default_recovery_margin() -> f64 {
    5.0
}
fn default_battery() -> BatteryRule {
    BatteryRule { enabled: true, warning_pct: 30.0, critical_pct: 15.0, recovery_margin_pct: 5.0 }
}
fn default_altitude() -> LimitRule {
    LimitRule { enabled: true, max: 120.0 }
}
fn default_speed() -> LimitRule {
    LimitRule { enabled: true, max: 15.0 }
}
fn default_temperature() -> LimitRule {
    LimitRule { enabled: true, max: 60.0 }
}
fn default_gps() -> GpsRule {
    GpsRule { enabled: true, min_sats: 6 }
}
fn default_link_timeout() -> f64 {
    5.0
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            battery: default_battery(),
            altitude: default_altitude(),
            speed: default_speed(),
            temperature: default_temperature(),
            gps: default_gps(),
            link_timeout_s: default_link_timeout(),
        }
    }
}

impl AlertConfig {
    pub fn link_timeout(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.link_timeout_s).ok().filter(|d| !d.is_zero())
    }
}

/// Per-metric alert state. Samples must be evaluated in arrival order.
#[derive(Debug, Clone)]
pub struct AlertEngine {
    battery: Option<BatteryMonitor>,
    altitude: Option<EdgeAlert>,
    speed: Option<EdgeAlert>,
    temperature: Option<EdgeAlert>,
    gps: Option<EdgeAlert>,
    watchdog: LinkWatchdog,
}

impl AlertEngine {
    pub fn new(cfg: &AlertConfig) -> Self {
        let limit = |rule: &LimitRule| rule.enabled.then(|| EdgeAlert::new(Bound::Above(rule.max)));
        let b = &cfg.battery;
        Self {
            battery: b.enabled.then(|| BatteryMonitor::new(b.warning_pct, b.critical_pct, b.recovery_margin_pct)),
            altitude: limit(&cfg.altitude),
            speed: limit(&cfg.speed),
            temperature: limit(&cfg.temperature),
            gps: cfg.gps.enabled.then(|| EdgeAlert::new(Bound::Below(cfg.gps.min_sats as f64))),
            watchdog: LinkWatchdog::new(cfg.link_timeout()),
        }
    }

    /// Runs every rule against one sample and resets the link watchdog.
    /// An absent reading leaves that metric where it was.
    pub fn evaluate(&mut self, s: &TelemetrySample, now: Instant) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        if self.watchdog.feed(now) {
            events.push(AlertEvent { metric: Metric::Link, level: AlertLevel::Ok, value: None });
        }

        if let (Some(m), Some(v)) = (self.battery.as_mut(), s.battery_percent) {
            events.extend(m.update(v).into_iter().map(|level| AlertEvent {
                metric: Metric::Battery,
                level,
                value: Some(v),
            }));
        }

        let edges = [
            (Metric::Altitude, self.altitude.as_mut(), s.rel_alt_m),
            (Metric::Speed, self.speed.as_mut(), s.groundspeed_ms),
            (Metric::Temperature, self.temperature.as_mut(), s.temp_c),
            (Metric::Gps, self.gps.as_mut(), s.num_sat.map(f64::from)),
        ];
        for (metric, alert, value) in edges {
            let (Some(alert), Some(v)) = (alert, value) else { continue };
            if let Some(level) = alert.update(v) {
                events.push(AlertEvent { metric, level, value: Some(v) });
            }
        }
        events
    }

    /// Starts link supervision, normally on connect.
    pub fn arm(&mut self, now: Instant) {
        self.watchdog.arm(now);
    }

    pub fn disarm(&mut self) {
        self.watchdog.disarm();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.watchdog.deadline()
    }

    /// Fires at most once per silent gap. The alert is raised only on the
    /// first gap; it stays raised across reconnects until a sample arrives.
    pub fn poll_watchdog(&mut self, now: Instant) -> LinkCheck {
        let was_lost = self.watchdog.is_lost();
        if !self.watchdog.poll(now) {
            return LinkCheck::Alive;
        }
        LinkCheck::Silent(
            (!was_lost).then_some(AlertEvent { metric: Metric::Link, level: AlertLevel::Critical, value: None }),
        )
    }

    pub fn level(&self, metric: Metric) -> AlertLevel {
        let edge = |a: &Option<EdgeAlert>| match a {
            Some(a) if a.is_active() => AlertLevel::Warning,
            _ => AlertLevel::Ok,
        };
        match metric {
            Metric::Battery => self.battery.as_ref().map_or(AlertLevel::Ok, |b| b.level()),
            Metric::Altitude => edge(&self.altitude),
            Metric::Speed => edge(&self.speed),
            Metric::Temperature => edge(&self.temperature),
            Metric::Gps => edge(&self.gps),
            Metric::Link if self.watchdog.is_lost() => AlertLevel::Critical,
            Metric::Link => AlertLevel::Ok,
        }
    }
}
