use crate::AlertLevel;

/// Two-level battery monitor.
///
/// Escalates on `pct <= critical` / `pct <= warning`. Falls back only once the
/// value clears a band by `margin` points, so a reading hovering at a
/// threshold does not flap between levels.
#[derive(Debug, Clone)]
pub struct BatteryMonitor {
    warning: f64,
    critical: f64,
    margin: f64,
    level: AlertLevel,
}

impl BatteryMonitor {
    pub fn new(warning_pct: f64, critical_pct: f64, recovery_margin_pct: f64) -> Self {
        Self {
            warning: warning_pct,
            critical: critical_pct.min(warning_pct),
            margin: recovery_margin_pct.max(0.0),
            level: AlertLevel::Ok,
        }
    }

    pub fn level(&self) -> AlertLevel {
        self.level
    }

    /// Feeds one reading; returns every level entered, in order.
    pub fn update(&mut self, pct: f64) -> Vec<AlertLevel> {
        let target = match self.level {
            AlertLevel::Ok if pct <= self.critical => AlertLevel::Critical,
            AlertLevel::Ok if pct <= self.warning => AlertLevel::Warning,
            AlertLevel::Ok => AlertLevel::Ok,

            AlertLevel::Warning if pct <= self.critical => AlertLevel::Critical,
            AlertLevel::Warning if pct > self.warning + self.margin => AlertLevel::Ok,
            AlertLevel::Warning => AlertLevel::Warning,

            AlertLevel::Critical if pct > self.warning + self.margin => AlertLevel::Ok,
            AlertLevel::Critical if pct > self.critical + self.margin => AlertLevel::Warning,
            AlertLevel::Critical => AlertLevel::Critical,
        };

        if target == self.level {
            return Vec::new();
        }
        let mut entered = Vec::with_capacity(2);
        // Never skip Warning on the way up.
        if self.level == AlertLevel::Ok && target == AlertLevel::Critical {
            entered.push(AlertLevel::Warning);
        }
        entered.push(target);
        self.level = target;
        entered
    }
}
