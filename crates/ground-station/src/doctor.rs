use anyhow::Result;

use crate::ReconnectConfig;

pub fn check_reconnect(cfg: &ReconnectConfig) -> Result<()> {
    if cfg.auto_reconnect {
        anyhow::ensure!(cfg.interval_ms >= 100, "reconnect.interval_ms too small; set >= 100");
        anyhow::ensure!(cfg.interval_ms <= 60_000, "reconnect.interval_ms should be <= 60000");
    }
    if cfg.max_attempts == 0 {
        tracing::info!("doctor: reconnect.max_attempts=0, retrying forever");
    }
    Ok(())
}
