use async_trait::async_trait;
use ground_proto::TelemetrySample;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::{timeout, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, LinkLost};
use crate::line::parse_line;
use crate::TelemetrySource;

pub const DEFAULT_BAUD: u32 = 57600;

/// A read that stays silent this long is "no data yet", not a failure.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest accepted line. Anything longer (noise, wrong baud) is dropped up to
/// the next newline.
pub const MAX_LINE_BYTES: usize = 1024;

type LineReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

enum Transport {
    Serial { baud: u32 },
    File,
    Attached(Option<LineReader>),
}

/// Newline-delimited `key:value` records from a serial radio, a recorded
/// log file, or any byte reader.
pub struct RadioLink {
    name: &'static str,
    transport: Transport,
    poll_timeout: Duration,
    reader: Option<LineReader>,
    pending: Vec<u8>,
    /// Inside an overlong line; discard until its newline.
    skipping: bool,
    started: Option<Instant>,
    dropped: u64,
}

impl std::fmt::Debug for RadioLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioLink")
            .field("name", &self.name)
            .field("connected", &self.reader.is_some())
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

impl RadioLink {
    /// Serial radio; `connect` takes the device path as endpoint.
    pub fn serial(baud: u32) -> Self {
        Self::with_transport("RADIO", Transport::Serial { baud })
    }

    /// Recorded raw-line log; `connect` takes the file path as endpoint.
    pub fn replay() -> Self {
        Self::with_transport("REPLAY", Transport::File)
    }

    /// Reads from an already-open byte stream. `connect` ignores the endpoint.
    pub fn from_reader<R>(name: &'static str, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self::with_transport(name, Transport::Attached(Some(BufReader::new(boxed))))
    }

    fn with_transport(name: &'static str, transport: Transport) -> Self {
        Self {
            name,
            transport,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            reader: None,
            pending: Vec::new(),
            skipping: false,
            started: None,
            dropped: 0,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Lines discarded as malformed since construction.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped
    }

    async fn open(&mut self, endpoint: &str) -> Result<LineReader, ConnectError> {
        match &mut self.transport {
            Transport::Serial { baud } => {
                let port = tokio_serial::new(endpoint, *baud)
                    .open_native_async()
                    .map_err(|e| match e.kind {
                        tokio_serial::ErrorKind::NoDevice => {
                            ConnectError::Unavailable(format!("{}: {}", endpoint, e))
                        }
                        _ => ConnectError::IoFailure {
                            endpoint: endpoint.to_string(),
                            source: e.into(),
                        },
                    })?;
                let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(port);
                Ok(BufReader::new(boxed))
            }
            Transport::File => {
                let file = tokio::fs::File::open(endpoint).await.map_err(|e| {
                    ConnectError::IoFailure { endpoint: endpoint.to_string(), source: e }
                })?;
                let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(file);
                Ok(BufReader::new(boxed))
            }
            Transport::Attached(reader) => reader
                .take()
                .ok_or_else(|| ConnectError::Unavailable("attached reader already consumed".into())),
        }
    }

    fn take_line(&mut self, elapsed_s: f64) -> Option<TelemetrySample> {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        match parse_line(&line, elapsed_s) {
            Ok(sample) => Some(sample),
            Err(reason) => {
                self.dropped += 1;
                debug!("{}: dropped line ({:?}): {:?}", self.name, reason, line);
                None
            }
        }
    }
}

#[async_trait]
impl TelemetrySource for RadioLink {
    fn name(&self) -> &str {
        self.name
    }

    async fn connect(&mut self, endpoint: &str, _timeout: Duration) -> Result<(), ConnectError> {
        let reader = self.open(endpoint).await?;
        self.reader = Some(reader);
        self.pending.clear();
        self.skipping = false;
        self.started = Some(Instant::now());
        info!("{}: reading lines from {}", self.name, endpoint);
        Ok(())
    }

    async fn next_sample(&mut self) -> Result<Option<TelemetrySample>, LinkLost> {
        loop {
            let (Some(reader), Some(started)) = (self.reader.as_mut(), self.started) else {
                return Ok(None);
            };

            // read_until keeps partial bytes in `pending` when the poll times out.
            // `pending` never exceeds MAX_LINE_BYTES here, so the limit is at least 1.
            let room = (MAX_LINE_BYTES + 1 - self.pending.len()) as u64;
            let mut limited = (&mut *reader).take(room);
            let n = match timeout(self.poll_timeout, limited.read_until(b'\n', &mut self.pending)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("{}: read failed: {}", self.name, e);
                    return Err(LinkLost(e.to_string()));
                }
                Ok(Ok(n)) => n,
            };

            if n == 0 && self.pending.is_empty() {
                return Err(LinkLost("transport closed".into()));
            }

            if self.pending.len() > MAX_LINE_BYTES && self.pending.last() != Some(&b'\n') {
                if !self.skipping {
                    self.dropped += 1;
                    debug!("{}: dropped line longer than {} bytes", self.name, MAX_LINE_BYTES);
                }
                self.skipping = true;
                self.pending.clear();
                continue;
            }
            if std::mem::take(&mut self.skipping) {
                self.pending.clear();
                continue;
            }

            let elapsed = started.elapsed().as_secs_f64();
            if let Some(sample) = self.take_line(elapsed) {
                return Ok(Some(sample));
            }
        }
    }

    async fn stop(&mut self) {
        self.reader = None;
        self.started = None;
        self.pending.clear();
        self.skipping = false;
    }
}
