use async_trait::async_trait;
use ground_proto::TelemetrySample;
use mavlink::common::{
    MavAutopilot, MavLandedState, MavMessage, MavType, ATTITUDE_DATA, EXTENDED_SYS_STATE_DATA,
    GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, HEARTBEAT_DATA, LOCAL_POSITION_NED_DATA,
    SYS_STATUS_DATA,
};
use mavlink::error::MessageReadError;
use mavlink::MavConnection;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, LinkLost};
use crate::line::LineBuilder;
use crate::TelemetrySource;

pub const DEFAULT_ENDPOINT: &str = "udpin:0.0.0.0:14540";

pub const SUPPORTED_SCHEMES: [&str; 6] = ["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

/// How long `stop()` waits for the reader thread to drop the transport.
const READER_RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

type Conn = Box<dyn MavConnection<MavMessage> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Attitude {
    roll_deg: f64,
    pitch_deg: f64,
    yaw_deg: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Velocity {
    vn: f64,
    ve: f64,
    vd: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct BatteryStatus {
    voltage: Option<f64>,   // Volts
    remaining: Option<f64>, // Percent 0-100
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct GpsStatus {
    fix_type: Option<u8>,
    num_sat: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Handshake {
    heartbeat: bool,
    health: bool,
}

/// Latest value of each slower sub-stream. Every part has its own channel
/// and its own writer task, so the merge on each position never takes a
/// lock shared between writers.
struct Parts {
    attitude: watch::Receiver<Option<Attitude>>,
    velocity: watch::Receiver<Option<Velocity>>,
    battery: watch::Receiver<BatteryStatus>,
    gps: watch::Receiver<GpsStatus>,
    mode: watch::Receiver<Option<String>>,
    in_air: watch::Receiver<Option<bool>>,
}

/// Routes decoded frames from the blocking reader to the sub-stream tasks.
struct Router {
    handshake: watch::Sender<Handshake>,
    attitude: mpsc::UnboundedSender<ATTITUDE_DATA>,
    velocity: mpsc::UnboundedSender<LOCAL_POSITION_NED_DATA>,
    battery: mpsc::UnboundedSender<SYS_STATUS_DATA>,
    gps: mpsc::UnboundedSender<GPS_RAW_INT_DATA>,
    mode: mpsc::UnboundedSender<HEARTBEAT_DATA>,
    in_air: mpsc::UnboundedSender<EXTENDED_SYS_STATE_DATA>,
    position: mpsc::UnboundedSender<GLOBAL_POSITION_INT_DATA>,
}

impl Router {
    fn route(&self, msg: MavMessage) {
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                // Ignore other ground stations on the same link.
                if hb.mavtype == MavType::MAV_TYPE_GCS {
                    return;
                }
                self.handshake.send_modify(|h| h.heartbeat = true);
                let _ = self.mode.send(hb);
            }
            MavMessage::SYS_STATUS(st) => {
                self.handshake.send_modify(|h| {
                    if h.heartbeat {
                        h.health = true;
                    }
                });
                let _ = self.battery.send(st);
            }
            MavMessage::ATTITUDE(a) => {
                let _ = self.attitude.send(a);
            }
            MavMessage::LOCAL_POSITION_NED(v) => {
                let _ = self.velocity.send(v);
            }
            MavMessage::GPS_RAW_INT(g) => {
                let _ = self.gps.send(g);
            }
            MavMessage::EXTENDED_SYS_STATE(s) => {
                let _ = self.in_air.send(s);
            }
            MavMessage::GLOBAL_POSITION_INT(p) => {
                let _ = self.position.send(p);
            }
            _ => {}
        }
    }

    fn is_closed(&self) -> bool {
        self.position.is_closed()
    }
}

/// MAVLink autopilot telemetry. Receive-only: nothing is ever sent to the vehicle.
#[derive(Default)]
pub struct FlightControllerLink {
    running: Arc<AtomicBool>,
    started: Option<Instant>,
    positions: Option<mpsc::UnboundedReceiver<GLOBAL_POSITION_INT_DATA>>,
    parts: Option<Parts>,
    tasks: Vec<JoinHandle<()>>,
    reader: Option<std::thread::JoinHandle<()>>,
    /// Where to send a datagram that unblocks the reader of a `udpin:` link.
    wake: Option<SocketAddr>,
}

impl std::fmt::Debug for FlightControllerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightControllerLink")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("tasks", &self.tasks.len())
            .field("reader", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

impl FlightControllerLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self, conn: Conn) -> Result<watch::Receiver<Handshake>, ConnectError> {
        let running = Arc::new(AtomicBool::new(true));
        self.running = running.clone();

        let (handshake_tx, handshake_rx) = watch::channel(Handshake::default());
        let (attitude_tx, attitude_rx) = mpsc::unbounded_channel();
        let (velocity_tx, velocity_rx) = mpsc::unbounded_channel();
        let (battery_tx, battery_rx) = mpsc::unbounded_channel();
        let (gps_tx, gps_rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = mpsc::unbounded_channel();
        let (air_tx, air_rx) = mpsc::unbounded_channel();
        let (position_tx, position_rx) = mpsc::unbounded_channel();

        let (attitude_part, attitude) = watch::channel(None);
        let (velocity_part, velocity) = watch::channel(None);
        let (battery_part, battery) = watch::channel(BatteryStatus::default());
        let (gps_part, gps) = watch::channel(GpsStatus::default());
        let (mode_part, mode) = watch::channel(None);
        let (air_part, in_air) = watch::channel(None);

        self.tasks = vec![
            spawn_part(attitude_rx, attitude_part, |p, a| *p = Some(attitude_from(&a))),
            spawn_part(velocity_rx, velocity_part, |p, v| *p = Some(velocity_from(&v))),
            spawn_part(battery_rx, battery_part, update_battery),
            spawn_part(gps_rx, gps_part, update_gps),
            spawn_part(mode_rx, mode_part, |p, hb| *p = Some(flight_mode_name(&hb))),
            spawn_part(air_rx, air_part, |p, s| *p = in_air_from(&s)),
        ];
        self.parts = Some(Parts { attitude, velocity, battery, gps, mode, in_air });
        self.positions = Some(position_rx);

        let router = Router {
            handshake: handshake_tx,
            attitude: attitude_tx,
            velocity: velocity_tx,
            battery: battery_tx,
            gps: gps_tx,
            mode: mode_tx,
            in_air: air_tx,
            position: position_tx,
        };

        // A plain thread rather than spawn_blocking: recv() can block forever on
        // a quiet UDP socket and must not hold up runtime shutdown.
        let reader = std::thread::Builder::new()
            .name("mavlink-reader".into())
            .spawn(move || read_loop(conn, router, running))
            .map_err(|e| ConnectError::IoFailure { endpoint: "mavlink-reader".into(), source: e })?;
        self.reader = Some(reader);

        Ok(handshake_rx)
    }

    fn merge(&self, pos: &GLOBAL_POSITION_INT_DATA, time_s: f64) -> TelemetrySample {
        let mut s = TelemetrySample::at(time_s);
        let Some(parts) = &self.parts else { return s };

        let gps = *parts.gps.borrow();
        s.gps_fix_type = gps.fix_type;
        s.num_sat = gps.num_sat;

        // GPS_FIX_TYPE_2D_FIX and up; with no fix reported the position is zeros.
        let has_fix = gps.fix_type.map_or(true, |f| f >= 2);
        if has_fix {
            s.lat_deg = Some(pos.lat as f64 / 1e7);
            s.lon_deg = Some(pos.lon as f64 / 1e7);
            s.abs_alt_m = Some(pos.alt as f64 / 1000.0);
            s.rel_alt_m = Some(pos.relative_alt as f64 / 1000.0);
        }

        if let Some(a) = *parts.attitude.borrow() {
            s.roll_deg = Some(a.roll_deg);
            s.pitch_deg = Some(a.pitch_deg);
            s.yaw_deg = Some(a.yaw_deg);
        }
        if let Some(v) = *parts.velocity.borrow() {
            s.vx_ms = Some(v.vn);
            s.vy_ms = Some(v.ve);
            s.vz_ms = Some(v.vd);
            s.groundspeed_ms = s.derived_groundspeed();
        }

        let battery = *parts.battery.borrow();
        s.voltage_v = battery.voltage;
        s.battery_percent = battery.remaining;
        s.flight_mode = parts.mode.borrow().clone();
        s.in_air = *parts.in_air.borrow();

        s.raw_line = Some(
            LineBuilder::new()
                .field("lat", s.lat_deg, 4)
                .field("lon", s.lon_deg, 4)
                .field("speed", s.groundspeed_ms, 4)
                .field("vbat", s.voltage_v, 4)
                .field("bat", s.battery_percent, 4)
                .field("ts", Some(time_s), 4)
                .finish(),
        );
        s
    }

    /// Unblocks a reader parked in `recv()` and waits for it to drop the
    /// connection, so the endpoint can be bound again by the next connect.
    async fn release_reader(&mut self) {
        let wake = self.wake.take();
        let Some(reader) = self.reader.take() else { return };
        if let Some(addr) = wake {
            if let Err(e) = send_wake(addr) {
                debug!("fc link: wake datagram to {} failed: {}", addr, e);
            }
        }

        let deadline = Instant::now() + READER_RELEASE_TIMEOUT;
        while !reader.is_finished() {
            if Instant::now() >= deadline {
                warn!("fc link: reader still blocked after {:?}, detaching it", READER_RELEASE_TIMEOUT);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if reader.join().is_err() {
            warn!("fc link: reader thread panicked");
        }
    }
}

#[async_trait]
impl TelemetrySource for FlightControllerLink {
    fn name(&self) -> &str {
        "MAVLINK"
    }

    async fn connect(&mut self, endpoint: &str, timeout: Duration) -> Result<(), ConnectError> {
        if !transport_supported(endpoint) {
            return Err(ConnectError::Unavailable(format!(
                "unsupported mavlink endpoint {:?} (expected one of {:?})",
                endpoint, SUPPORTED_SCHEMES
            )));
        }
        self.stop().await;

        let addr = endpoint.to_string();
        let opened = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || mavlink::connect::<MavMessage>(&addr)),
        )
        .await
        .map_err(|_| ConnectError::Timeout(timeout))?
        .map_err(|e| ConnectError::Unavailable(format!("mavlink connect task: {}", e)))?;

        let conn = opened.map_err(|e| match e.kind() {
            ErrorKind::AddrNotAvailable | ErrorKind::Unsupported => {
                ConnectError::Unavailable(format!("{}: {}", endpoint, e))
            }
            _ => ConnectError::IoFailure { endpoint: endpoint.to_string(), source: e },
        })?;

        let mut handshake = self.start(conn)?;
        self.wake = udpin_wake_addr(endpoint);
        let healthy = tokio::time::timeout(timeout, handshake.wait_for(|h| h.heartbeat && h.health))
            .await
            .map(|r| r.is_ok());
        match healthy {
            Ok(true) => {
                self.started = Some(Instant::now());
                info!("fc link: {} healthy", endpoint);
                Ok(())
            }
            _ => {
                warn!("fc link: no heartbeat/health from {} within {:?}", endpoint, timeout);
                self.stop().await;
                Err(ConnectError::Timeout(timeout))
            }
        }
    }

    async fn next_sample(&mut self) -> Result<Option<TelemetrySample>, LinkLost> {
        let (Some(started), Some(positions)) = (self.started, self.positions.as_mut()) else {
            return Ok(None);
        };
        match positions.recv().await {
            Some(pos) => {
                let time_s = started.elapsed().as_secs_f64();
                Ok(Some(self.merge(&pos, time_s)))
            }
            None if self.running.load(Ordering::Acquire) => {
                Err(LinkLost("mavlink reader stopped".into()))
            }
            None => Ok(None),
        }
    }

    async fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.positions = None;
        self.parts = None;
        self.started = None;
        self.release_reader().await;
    }
}

fn transport_supported(endpoint: &str) -> bool {
    SUPPORTED_SCHEMES.iter().any(|s| endpoint.starts_with(s))
}

/// Address that reaches a `udpin:` listener from this host. `None` for other
/// transports and for an ephemeral port, which cannot be addressed.
fn udpin_wake_addr(endpoint: &str) -> Option<SocketAddr> {
    let mut addr: SocketAddr = endpoint.strip_prefix("udpin:")?.parse().ok()?;
    if addr.port() == 0 {
        return None;
    }
    if addr.ip().is_unspecified() {
        let loopback: IpAddr = match addr {
            SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
        };
        addr.set_ip(loopback);
    }
    Some(addr)
}

/// Sends one GCS heartbeat, which the router ignores, so `recv()` returns and
/// the reader sees the stop flag.
fn send_wake(addr: SocketAddr) -> std::io::Result<()> {
    let local: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = UdpSocket::bind(SocketAddr::new(local, 0))?;
    socket.send_to(&wake_frame(), addr)?;
    Ok(())
}

fn wake_frame() -> Vec<u8> {
    let hb = MavMessage::HEARTBEAT(HEARTBEAT_DATA { mavtype: MavType::MAV_TYPE_GCS, ..Default::default() });
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = mavlink::write_versioned_msg(&mut buf, mavlink::MavlinkVersion::V2, mavlink::MavHeader::default(), &hb);
    buf
}

fn read_loop(conn: Conn, router: Router, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) && !router.is_closed() {
        match conn.recv() {
            Ok((_hdr, msg)) => router.route(msg),
            Err(MessageReadError::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) =>
            {
                continue
            }
            Err(MessageReadError::Io(e)) => {
                warn!("fc link: read failed: {}", e);
                break;
            }
            Err(e) => debug!("fc link: skipping frame: {:?}", e),
        }
    }
    debug!("fc link: reader exiting");
}

fn spawn_part<M, P>(
    mut rx: mpsc::UnboundedReceiver<M>,
    tx: watch::Sender<P>,
    apply: fn(&mut P, M),
) -> JoinHandle<()>
where
    M: Send + 'static,
    P: Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            tx.send_modify(|part| apply(part, msg));
        }
    })
}

fn attitude_from(a: &ATTITUDE_DATA) -> Attitude {
    Attitude {
        roll_deg: (a.roll as f64).to_degrees(),
        pitch_deg: (a.pitch as f64).to_degrees(),
        yaw_deg: (a.yaw as f64).to_degrees(),
    }
}

fn velocity_from(v: &LOCAL_POSITION_NED_DATA) -> Velocity {
    Velocity { vn: v.vx as f64, ve: v.vy as f64, vd: v.vz as f64 }
}

fn update_battery(battery: &mut BatteryStatus, status: SYS_STATUS_DATA) {
    // voltage_battery is in millivolts, UINT16_MAX means unknown
    battery.voltage = (status.voltage_battery != u16::MAX)
        .then(|| status.voltage_battery as f64 / 1000.0);
    // battery_remaining is percentage 0-100, -1 means unknown
    battery.remaining = (0..=100)
        .contains(&status.battery_remaining)
        .then(|| status.battery_remaining as f64);
}

fn update_gps(gps: &mut GpsStatus, raw: GPS_RAW_INT_DATA) {
    gps.fix_type = Some(raw.fix_type as u8);
    // 255 means unknown
    gps.num_sat = (raw.satellites_visible != u8::MAX).then(|| raw.satellites_visible as u32);
}

fn in_air_from(s: &EXTENDED_SYS_STATE_DATA) -> Option<bool> {
    match s.landed_state {
        MavLandedState::MAV_LANDED_STATE_UNDEFINED => None,
        MavLandedState::MAV_LANDED_STATE_ON_GROUND => Some(false),
        _ => Some(true),
    }
}

fn flight_mode_name(hb: &HEARTBEAT_DATA) -> String {
    match hb.autopilot {
        MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA => ardupilot_copter_mode(hb.custom_mode),
        MavAutopilot::MAV_AUTOPILOT_PX4 => px4_mode(hb.custom_mode),
        _ => format!("CUSTOM({})", hb.custom_mode),
    }
}

fn ardupilot_copter_mode(mode: u32) -> String {
    let name = match mode {
        0 => "STABILIZE",
        1 => "ACRO",
        2 => "ALT_HOLD",
        3 => "AUTO",
        4 => "GUIDED",
        5 => "LOITER",
        6 => "RTL",
        7 => "CIRCLE",
        9 => "LAND",
        11 => "DRIFT",
        13 => "SPORT",
        14 => "FLIP",
        15 => "AUTOTUNE",
        16 => "POSHOLD",
        17 => "BRAKE",
        18 => "THROW",
        20 => "GUIDED_NOGPS",
        21 => "SMART_RTL",
        other => return format!("CUSTOM({})", other),
    };
    name.to_string()
}

fn px4_mode(custom_mode: u32) -> String {
    let main = (custom_mode >> 16) & 0xff;
    let sub = (custom_mode >> 24) & 0xff;
    let name = match (main, sub) {
        (1, _) => "MANUAL",
        (2, _) => "ALTCTL",
        (3, _) => "POSCTL",
        (4, 2) => "TAKEOFF",
        (4, 3) => "HOLD",
        (4, 4) => "MISSION",
        (4, 5) => "RTL",
        (4, 6) => "LAND",
        (4, _) => "AUTO",
        (5, _) => "ACRO",
        (6, _) => "OFFBOARD",
        (7, _) => "STABILIZED",
        _ => return format!("CUSTOM({})", custom_mode),
    };
    name.to_string()
}
