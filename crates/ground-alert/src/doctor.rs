use anyhow::Result;

use crate::AlertConfig;

pub fn check_alerts(cfg: &AlertConfig) -> Result<()> {
    let b = &cfg.battery;
    if b.enabled {
        anyhow::ensure!((0.0..=100.0).contains(&b.warning_pct), "alerts.battery.warning_pct out of 0..100");
        anyhow::ensure!((0.0..=100.0).contains(&b.critical_pct), "alerts.battery.critical_pct out of 0..100");
        anyhow::ensure!(b.critical_pct <= b.warning_pct, "alerts.battery.critical_pct must be <= warning_pct");
        anyhow::ensure!(
            b.recovery_margin_pct >= 0.0 && b.recovery_margin_pct < 50.0,
            "alerts.battery.recovery_margin_pct should be 0..50"
        );
    }
    for (name, rule) in [("altitude", &cfg.altitude), ("speed", &cfg.speed), ("temperature", &cfg.temperature)] {
        anyhow::ensure!(rule.max.is_finite(), "alerts.{}.max must be a number", name);
    }
    if cfg.gps.enabled {
        anyhow::ensure!(cfg.gps.min_sats >= 4, "alerts.gps.min_sats too low");
    }
    anyhow::ensure!(
        cfg.link_timeout_s.is_finite() && cfg.link_timeout_s >= 0.0,
        "alerts.link_timeout_s must be >= 0 (0 disables)"
    );
    anyhow::ensure!(
        cfg.link_timeout_s == 0.0 || cfg.link_timeout_s >= 0.5,
        "alerts.link_timeout_s too short; set >= 0.5 or 0"
    );
    Ok(())
}
