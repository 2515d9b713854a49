use ground_proto::HistoryRecord;
use std::io::Write;

use crate::schema::COLUMNS;
use crate::PersistenceError;

/// Writes `records` as CSV, header first. Returns the number of data rows.
pub fn write_csv<W: Write>(records: &[HistoryRecord], mut out: W) -> Result<usize, PersistenceError> {
    writeln!(out, "{}", COLUMNS.join(","))?;
    for r in records {
        writeln!(out, "{}", csv_row(r))?;
    }
    out.flush()?;
    Ok(records.len())
}

fn csv_row(r: &HistoryRecord) -> String {
    let s = &r.sample;
    let cells = [
        r.id.to_string(),
        text(&r.ingested_at),
        text(&r.source),
        s.raw_line.as_deref().map(text).unwrap_or_default(),
        s.time_s.to_string(),
        num(s.lat_deg),
        num(s.lon_deg),
        num(s.abs_alt_m),
        num(s.rel_alt_m),
        num(s.roll_deg),
        num(s.pitch_deg),
        num(s.yaw_deg),
        num(s.vx_ms),
        num(s.vy_ms),
        num(s.vz_ms),
        num(s.groundspeed_ms),
        num(s.voltage_v),
        num(s.battery_percent),
        s.flight_mode.as_deref().map(text).unwrap_or_default(),
        s.in_air.map(|b| u8::from(b).to_string()).unwrap_or_default(),
        s.gps_fix_type.map(|v| v.to_string()).unwrap_or_default(),
        s.num_sat.map(|v| v.to_string()).unwrap_or_default(),
        num(s.temp_c),
        num(s.hum_pct),
        num(s.pres_hpa),
        num(s.rad_mwcm2),
        num(s.acc_ms2),
    ];
    cells.join(",")
}

fn num(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

// RFC 4180 quoting
fn text(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ground_proto::TelemetrySample;

    fn record(id: i64, sample: TelemetrySample) -> HistoryRecord {
        HistoryRecord { id, ingested_at: "2024-05-01T12:00:00Z".into(), source: "RADIO".into(), sample }
    }

    #[test]
    fn test_header_matches_table_columns() {
        let mut out = Vec::new();
        assert_eq!(write_csv(&[], &mut out).unwrap(), 0);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().next().unwrap(), COLUMNS.join(","));
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn test_raw_line_with_commas_is_quoted() {
        let mut s = TelemetrySample::at(1.5);
        s.temp_c = Some(21.5);
        s.in_air = Some(true);
        s.raw_line = Some("temp:21.5,note:\"hi\"".into());

        let mut out = Vec::new();
        write_csv(&[record(7, s)], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let row = text.lines().nth(1).unwrap();

        assert!(row.starts_with("7,2024-05-01T12:00:00Z,RADIO,\"temp:21.5,note:\"\"hi\"\"\",1.5,"));
        // 27 columns: 26 separators outside the quoted cell
        let unquoted = row.replace("\"temp:21.5,note:\"\"hi\"\"\"", "RAW");
        assert_eq!(unquoted.split(',').count(), COLUMNS.len());
    }

    #[test]
    fn test_absent_values_are_empty_cells() {
        let mut out = Vec::new();
        write_csv(&[record(1, TelemetrySample::at(0.0))], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let row = text.lines().nth(1).unwrap();
        let cells: Vec<&str> = row.split(',').collect();
        assert_eq!(cells.len(), COLUMNS.len());
        assert_eq!(cells[4], "0");
        assert!(cells[5..].iter().all(|c| c.is_empty()));
    }
}
