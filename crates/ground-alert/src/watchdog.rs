use std::time::Duration;
use tokio::time::Instant;

/// Link-liveness timer. Fires once per silent gap; the next sample re-arms it.
///
/// Firing raises the link alert, which only a sample clears. Disarming on
/// disconnect and re-arming on reconnect leave the alert raised.
#[derive(Debug, Clone)]
pub struct LinkWatchdog {
    timeout: Option<Duration>,
    last: Option<Instant>,
    fired: bool,
    lost: bool,
}

impl LinkWatchdog {
    /// `None` disables the watchdog.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout, last: None, fired: false, lost: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }

    /// Whether the link alert is raised.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn arm(&mut self, now: Instant) {
        if self.timeout.is_some() {
            self.last = Some(now);
        }
        self.fired = false;
    }

    pub fn disarm(&mut self) {
        self.last = None;
        self.fired = false;
    }

    /// Resets on a received sample. Returns true when this clears the link alert.
    pub fn feed(&mut self, now: Instant) -> bool {
        let was_lost = std::mem::replace(&mut self.lost, false);
        self.arm(now);
        was_lost
    }

    /// When the watchdog will fire; `None` while disarmed or already fired.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.timeout, self.last) {
            (Some(t), Some(last)) if !self.fired => Some(last + t),
            _ => None,
        }
    }

    /// True exactly once per gap, on the first poll at or past the deadline.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(d) if now >= d => {
                self.fired = true;
                self.lost = true;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_fires_once_per_gap() {
        let t0 = Instant::now();
        let mut w = LinkWatchdog::new(Some(secs(5)));
        w.arm(t0);
        assert!(!w.poll(t0 + secs(4)));
        assert!(w.poll(t0 + secs(5)));
        assert!(!w.poll(t0 + secs(6)));
        assert!(!w.poll(t0 + secs(60)));
        assert_eq!(w.deadline(), None);

        // A late sample closes the gap and re-arms.
        assert!(w.feed(t0 + secs(61)));
        assert_eq!(w.deadline(), Some(t0 + secs(66)));
        assert!(!w.poll(t0 + secs(65)));
        assert!(w.poll(t0 + secs(66)));
    }

    #[test]
    fn test_steady_samples_never_fire() {
        let t0 = Instant::now();
        let mut w = LinkWatchdog::new(Some(secs(5)));
        w.arm(t0);
        for i in 1..20 {
            assert!(!w.feed(t0 + secs(i * 4)));
            assert!(!w.poll(t0 + secs(i * 4 + 1)));
        }
    }

    #[test]
    fn test_disabled_and_disarmed() {
        let t0 = Instant::now();
        let mut off = LinkWatchdog::new(None);
        off.arm(t0);
        assert_eq!(off.deadline(), None);
        assert!(!off.poll(t0 + secs(3600)));

        let mut w = LinkWatchdog::new(Some(secs(1)));
        w.arm(t0);
        w.disarm();
        assert!(!w.poll(t0 + secs(10)));
    }

    #[test]
    fn test_alert_survives_reconnect_until_a_sample() {
        let t0 = Instant::now();
        let mut w = LinkWatchdog::new(Some(secs(5)));
        w.arm(t0);
        assert!(w.poll(t0 + secs(5)));

        w.disarm();
        w.arm(t0 + secs(7));
        assert!(w.is_lost());

        // A second silent session fires its own gap without clearing the alert.
        assert!(w.poll(t0 + secs(12)));
        w.disarm();
        w.arm(t0 + secs(13));

        assert!(w.feed(t0 + secs(14)));
        assert!(!w.is_lost());
        assert!(!w.feed(t0 + secs(15)));
    }
}
