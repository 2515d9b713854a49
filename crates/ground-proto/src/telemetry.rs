use serde::{Deserialize, Serialize};

/// One normalized observation. Every field but `time_s` may be unknown;
/// `None` means the source did not report it, never that it reported zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub time_s: f64,

    // Navigation
    pub lat_deg: Option<f64>,
    pub lon_deg: Option<f64>,
    pub abs_alt_m: Option<f64>,
    pub rel_alt_m: Option<f64>,

    // Attitude
    pub roll_deg: Option<f64>,
    pub pitch_deg: Option<f64>,
    pub yaw_deg: Option<f64>,

    // Velocity (NED)
    pub vx_ms: Option<f64>,
    pub vy_ms: Option<f64>,
    pub vz_ms: Option<f64>,
    pub groundspeed_ms: Option<f64>,

    // Power
    pub voltage_v: Option<f64>,
    pub battery_percent: Option<f64>,

    // Status
    pub flight_mode: Option<String>,
    pub in_air: Option<bool>,
    pub gps_fix_type: Option<u8>,
    pub num_sat: Option<u32>,

    // Environment
    pub temp_c: Option<f64>,
    pub hum_pct: Option<f64>,
    pub pres_hpa: Option<f64>,
    pub rad_mwcm2: Option<f64>,
    pub acc_ms2: Option<f64>,

    /// Wire text exactly as received, kept for audit and replay.
    pub raw_line: Option<String>,
}

impl TelemetrySample {
    /// A sample stamped at `time_s` with every other field unknown.
    pub fn at(time_s: f64) -> Self {
        Self { time_s, ..Self::default() }
    }

    /// Norm of the NED velocity, only when all three components are known.
    pub fn derived_groundspeed(&self) -> Option<f64> {
        match (self.vx_ms, self.vy_ms, self.vz_ms) {
            (Some(n), Some(e), Some(d)) => Some((n * n + e * e + d * d).sqrt()),
            _ => None,
        }
    }
}

/// Persisted projection of a sample. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    /// ISO 8601 (RFC 3339) UTC ingestion timestamp.
    pub ingested_at: String,
    pub source: String,
    pub sample: TelemetrySample,
}
