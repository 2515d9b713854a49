use anyhow::Result;
use std::path::Path;

use crate::{SourceConfig, SourceKind};

pub fn check_source(cfg: &SourceConfig) -> Result<()> {
    anyhow::ensure!(cfg.connect_timeout_ms.unwrap_or(1) > 0, "source.connect_timeout_ms must be > 0");
    anyhow::ensure!(cfg.poll_timeout_ms.unwrap_or(1) > 0, "source.poll_timeout_ms must be > 0");

    match cfg.kind {
        SourceKind::Demo => {}
        SourceKind::Fc => {
            let ep = cfg.endpoint();
            anyhow::ensure!(
                crate::mav::SUPPORTED_SCHEMES.iter().any(|s| ep.starts_with(s)),
                "source.endpoint {:?} is not a mavlink address",
                ep
            );
        }
        SourceKind::Radio => {
            anyhow::ensure!(!cfg.endpoint().is_empty(), "source.endpoint (serial device) missing");
            anyhow::ensure!(cfg.baud.unwrap_or(crate::radio::DEFAULT_BAUD) > 0, "source.baud invalid");
        }
        SourceKind::Replay => {
            let p = Path::new(cfg.endpoint());
            anyhow::ensure!(p.is_file(), "source.endpoint replay log not found: {}", cfg.endpoint());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_always_ok() {
        assert!(check_source(&SourceConfig::new(SourceKind::Demo)).is_ok());
    }

    #[test]
    fn test_fc_endpoint_scheme_checked() {
        let mut cfg = SourceConfig::new(SourceKind::Fc);
        assert!(check_source(&cfg).is_ok());
        cfg.endpoint = Some("/dev/ttyACM0".into());
        assert!(check_source(&cfg).is_err());
    }

    #[test]
    fn test_replay_needs_existing_file() {
        let mut cfg = SourceConfig::new(SourceKind::Replay);
        assert!(check_source(&cfg).is_err());
        let f = tempfile::NamedTempFile::new().unwrap();
        cfg.endpoint = Some(f.path().to_string_lossy().into_owned());
        assert!(check_source(&cfg).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut cfg = SourceConfig::new(SourceKind::Demo);
        cfg.connect_timeout_ms = Some(0);
        assert!(check_source(&cfg).is_err());
    }
}
