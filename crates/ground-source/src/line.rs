//! Radio wire contract: one `key:value,key:value,...` record per line.
//!
//! Keys are lowercase without surrounding whitespace, values are decimal
//! numbers. The same format is used to render `raw_line` for sources that
//! do not receive text (demo, MAVLink) so history rows stay comparable.

use ground_proto::TelemetrySample;
use std::fmt::Write;

/// Keys understood on the wire, in the order the demo contract emits them.
pub const KNOWN_KEYS: [&str; 11] = [
    "temp", "hum", "pres", "rad", "lat", "lon", "speed", "acc", "ts", "vbat", "bat",
];

/// Reason a line was discarded. Only ever counted, never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseDrop {
    Empty,
    NoFields,
}

/// Parse one wire line. `elapsed_s` stamps the sample when the line has no `ts`.
///
/// A key whose value is not a finite number is dropped on its own; the line is
/// only dropped when no recognized key survives.
pub fn parse_line(line: &str, elapsed_s: f64) -> Result<TelemetrySample, ParseDrop> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseDrop::Empty);
    }

    let mut s = TelemetrySample::at(elapsed_s);
    let mut accepted = 0usize;

    for part in line.split(',') {
        let Some((key, value)) = part.split_once(':') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let Some(v) = parse_number(value) else { continue };

        let slot = match key.as_str() {
            "temp" => &mut s.temp_c,
            "hum" => &mut s.hum_pct,
            "pres" => &mut s.pres_hpa,
            "rad" => &mut s.rad_mwcm2,
            "lat" => &mut s.lat_deg,
            "lon" => &mut s.lon_deg,
            "speed" => &mut s.groundspeed_ms,
            "acc" => &mut s.acc_ms2,
            "vbat" => &mut s.voltage_v,
            "bat" => {
                if !(0.0..=100.0).contains(&v) {
                    continue;
                }
                &mut s.battery_percent
            }
            "ts" => {
                s.time_s = v;
                accepted += 1;
                continue;
            }
            _ => continue,
        };
        *slot = Some(v);
        accepted += 1;
    }

    if accepted == 0 {
        return Err(ParseDrop::NoFields);
    }
    s.raw_line = Some(line.to_string());
    Ok(s)
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Renders the present fields of a sample in wire format.
#[derive(Debug, Default)]
pub struct LineBuilder {
    out: String,
}

impl LineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key:value` with `decimals` places; absent values are skipped.
    pub fn field(mut self, key: &str, value: Option<f64>, decimals: usize) -> Self {
        if let Some(v) = value {
            if !self.out.is_empty() {
                self.out.push(',');
            }
            let _ = write!(self.out, "{}:{:.*}", key, decimals, v);
        }
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}
