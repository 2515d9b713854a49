use async_trait::async_trait;
use ground_proto::TelemetrySample;
use std::time::Duration;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::info;

use crate::error::{ConnectError, LinkLost};
use crate::line::LineBuilder;
use crate::TelemetrySource;

/// Fixed sample period of the synthetic flight.
pub const DEMO_PERIOD: Duration = Duration::from_millis(100);

// Orbit centre and radius (~50 m).
const ORIGIN_LAT: f64 = 19.332;
const ORIGIN_LON: f64 = -99.184;
const ORBIT_DEG: f64 = 0.0005;
const GROUND_MSL_M: f64 = 2240.0;

// Orbit phase advances 0.15 rad per 100 ms period.
const PHASE_RATE: f64 = 1.5;

/// The demo flight at `t` seconds after connect. Pure: same `t`, same sample.
pub fn demo_sample_at(t: f64) -> TelemetrySample {
    let phi = PHASE_RATE * t;

    let lat = ORIGIN_LAT + ORBIT_DEG * phi.cos();
    let lon = ORIGIN_LON + ORBIT_DEG * phi.sin();
    let rel_alt = 30.0 + 10.0 * (0.25 * phi).sin();

    let vn = 2.0 * phi.cos();
    let ve = 2.0 * phi.sin();
    let vd = -0.2 * (0.2 * phi).sin();
    let gs = (vn * vn + ve * ve + vd * vd).sqrt();

    let temp = 24.0 + 0.8 * (0.05 * t).sin();
    let hum = 45.0 + 8.0 * (0.03 * t).cos();
    let pres = 1012.0 + (0.01 * t).sin();
    let rad = 0.25 + 0.05 * (0.07 * t).sin();
    let acc = 0.3 + 0.2 * (0.4 * t).sin().abs();

    let raw = LineBuilder::new()
        .field("temp", Some(temp), 1)
        .field("hum", Some(hum), 1)
        .field("pres", Some(pres), 1)
        .field("rad", Some(rad), 2)
        .field("lat", Some(lat), 4)
        .field("lon", Some(lon), 4)
        .field("speed", Some(gs), 2)
        .field("acc", Some(acc), 2)
        .field("ts", Some(t), 1)
        .finish();

    TelemetrySample {
        time_s: t,
        lat_deg: Some(lat),
        lon_deg: Some(lon),
        abs_alt_m: Some(GROUND_MSL_M + rel_alt),
        rel_alt_m: Some(rel_alt),
        roll_deg: Some(8.0 * (0.6 * phi).sin()),
        pitch_deg: Some(4.0 * (0.5 * phi).cos()),
        yaw_deg: Some((phi * 30.0) % 360.0),
        vx_ms: Some(vn),
        vy_ms: Some(ve),
        vz_ms: Some(vd),
        groundspeed_ms: Some(gs),
        voltage_v: Some(15.8 - 0.0015 * t),
        battery_percent: Some((100.0 - 0.5 * t).max(0.0)),
        flight_mode: Some("DEMO".to_string()),
        in_air: Some(true),
        gps_fix_type: Some(3),
        num_sat: Some(12),
        temp_c: Some(temp),
        hum_pct: Some(hum),
        pres_hpa: Some(pres),
        rad_mwcm2: Some(rad),
        acc_ms2: Some(acc),
        raw_line: Some(raw),
    }
}

/// Synthetic circular flight; never fails to connect.
#[derive(Debug, Default)]
pub struct DemoSource {
    started: Option<Instant>,
    ticker: Option<Interval>,
}

impl DemoSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetrySource for DemoSource {
    fn name(&self) -> &str {
        "DEMO"
    }

    async fn connect(&mut self, _endpoint: &str, _timeout: Duration) -> Result<(), ConnectError> {
        let mut ticker = interval(DEMO_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.started = Some(Instant::now());
        info!("demo source: generating at {:?} period", DEMO_PERIOD);
        Ok(())
    }

    async fn next_sample(&mut self) -> Result<Option<TelemetrySample>, LinkLost> {
        let (Some(started), Some(ticker)) = (self.started, self.ticker.as_mut()) else {
            return Ok(None);
        };
        ticker.tick().await;
        Ok(Some(demo_sample_at(started.elapsed().as_secs_f64())))
    }

    async fn stop(&mut self) {
        self.ticker = None;
        self.started = None;
    }
}
