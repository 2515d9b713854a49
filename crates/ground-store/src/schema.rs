use ground_proto::{HistoryRecord, TelemetrySample};

/// Table columns in storage order. CSV export uses the same names and order.
pub const COLUMNS: [&str; 27] = [
    "id", "ingested_at", "source", "raw_line", "time_s",
    "lat", "lon", "abs_alt_m", "rel_alt_m",
    "roll", "pitch", "yaw",
    "vx", "vy", "vz", "groundspeed",
    "voltage", "battery_pct",
    "flight_mode", "in_air", "gps_fix_type", "num_sat",
    "temp", "hum", "pres", "rad", "acc",
];

pub const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS samples (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    ingested_at  TEXT NOT NULL,
    source       TEXT NOT NULL,
    raw_line     TEXT,
    time_s       REAL NOT NULL,
    lat          REAL,
    lon          REAL,
    abs_alt_m    REAL,
    rel_alt_m    REAL,
    roll         REAL,
    pitch        REAL,
    yaw          REAL,
    vx           REAL,
    vy           REAL,
    vz           REAL,
    groundspeed  REAL,
    voltage      REAL,
    battery_pct  REAL,
    flight_mode  TEXT,
    in_air       INTEGER,
    gps_fix_type INTEGER,
    num_sat      INTEGER,
    temp         REAL,
    hum          REAL,
    pres         REAL,
    rad          REAL,
    acc          REAL
)";

pub const INSERT: &str = "INSERT INTO samples (
    ingested_at, source, raw_line, time_s,
    lat, lon, abs_alt_m, rel_alt_m,
    roll, pitch, yaw,
    vx, vy, vz, groundspeed,
    voltage, battery_pct,
    flight_mode, in_air, gps_fix_type, num_sat,
    temp, hum, pres, rad, acc
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub const SELECT_ALL: &str = "SELECT * FROM samples ORDER BY id ASC";
pub const SELECT_LATEST: &str = "SELECT * FROM samples ORDER BY id DESC LIMIT ?";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SampleRow {
    id: i64,
    ingested_at: String,
    source: String,
    raw_line: Option<String>,
    time_s: f64,
    lat: Option<f64>,
    lon: Option<f64>,
    abs_alt_m: Option<f64>,
    rel_alt_m: Option<f64>,
    roll: Option<f64>,
    pitch: Option<f64>,
    yaw: Option<f64>,
    vx: Option<f64>,
    vy: Option<f64>,
    vz: Option<f64>,
    groundspeed: Option<f64>,
    voltage: Option<f64>,
    battery_pct: Option<f64>,
    flight_mode: Option<String>,
    in_air: Option<bool>,
    gps_fix_type: Option<i64>,
    num_sat: Option<i64>,
    temp: Option<f64>,
    hum: Option<f64>,
    pres: Option<f64>,
    rad: Option<f64>,
    acc: Option<f64>,
}

impl From<SampleRow> for HistoryRecord {
    fn from(r: SampleRow) -> Self {
        HistoryRecord {
            id: r.id,
            ingested_at: r.ingested_at,
            source: r.source,
            sample: TelemetrySample {
                time_s: r.time_s,
                lat_deg: r.lat,
                lon_deg: r.lon,
                abs_alt_m: r.abs_alt_m,
                rel_alt_m: r.rel_alt_m,
                roll_deg: r.roll,
                pitch_deg: r.pitch,
                yaw_deg: r.yaw,
                vx_ms: r.vx,
                vy_ms: r.vy,
                vz_ms: r.vz,
                groundspeed_ms: r.groundspeed,
                voltage_v: r.voltage,
                battery_percent: r.battery_pct,
                flight_mode: r.flight_mode,
                in_air: r.in_air,
                gps_fix_type: r.gps_fix_type.and_then(|v| u8::try_from(v).ok()),
                num_sat: r.num_sat.and_then(|v| u32::try_from(v).ok()),
                temp_c: r.temp,
                hum_pct: r.hum,
                pres_hpa: r.pres,
                rad_mwcm2: r.rad,
                acc_ms2: r.acc,
                raw_line: r.raw_line,
            },
        }
    }
}
