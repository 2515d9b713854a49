use anyhow::Result;

use crate::HistoryConfig;

pub fn check_history(cfg: &HistoryConfig) -> Result<()> {
    anyhow::ensure!(!cfg.db_path.as_os_str().is_empty(), "history.db_path missing");
    if cfg.db_path.exists() {
        anyhow::ensure!(cfg.db_path.is_file(), "history.db_path is not a file: {}", cfg.db_path.display());
    }
    anyhow::ensure!(
        cfg.has_flush_policy(),
        "history: enable flush_every_sample or set flush_interval_ms > 0"
    );
    if let Some(ms) = cfg.flush_interval_ms.filter(|ms| *ms > 0) {
        anyhow::ensure!(ms >= 50, "history.flush_interval_ms too small; set >= 50");
    }
    Ok(())
}
