//! # Time Authority
//!
//! Wall-clock handling for the sign. Two reference frames matter here:
//!
//! - **Uncorrected epoch**: device clock in UTC. The backend publishes its timestamps in
//!   this frame, so every "seconds until arrival" figure is computed against it.
//! - **Corrected epoch**: uncorrected epoch plus the daylight saving offset from the
//!   [`DstTable`]. Only the on-screen clock uses it.
//!
//! Mixing the two shifts every arrival by an hour for half of the year.
//!
//! ## Network Time
//! [`TimeAuthority::sync`] walks an ordered list of SNTP servers and keeps the first
//! answer. Rather than setting the OS clock it stores the difference between server
//! time and the device clock, which keeps the process unprivileged and testable.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use log::{info, warn};
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Backend timestamp layout, e.g. `2025-03-21T18:34:10` (no timezone, UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Standard NTP port
const NTP_PORT: u16 = 123;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01)
const NTP_TO_UNIX_OFFSET: i64 = 2_208_988_800;

/// A backend timestamp that does not match [`TIMESTAMP_FORMAT`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bad timestamp: {text:?}")]
pub struct TimestampFormatError {
    /// The offending input, verbatim
    pub text: String,
}

/// Errors raised while synchronising against network time servers.
#[derive(Error, Debug)]
pub enum TimeSyncError {
    /// Socket setup, send or receive failed (includes receive timeouts)
    #[error("time server IO: {0}")]
    Io(#[from] std::io::Error),

    /// Host name did not resolve to any address
    #[error("could not resolve time server {0}")]
    Resolve(String),

    /// Reply shorter than an SNTP packet
    #[error("time server reply too short: {0} bytes")]
    ShortResponse(usize),

    /// Transmit timestamp predates the Unix epoch
    #[error("invalid NTP timestamp: {0}")]
    InvalidTimestamp(u32),

    /// Every configured server failed (or none were configured)
    #[error("all {attempted} time servers failed")]
    Exhausted { attempted: usize },
}

/// DST breakpoints were not strictly ascending.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("DST breakpoint {index} is not after the previous one")]
pub struct DstTableError {
    pub index: usize,
}

/// Parse a backend timestamp into Unix epoch seconds.
///
/// # Example
/// ```
/// use bus_stop_lib::clock::parse_timestamp;
///
/// assert_eq!(parse_timestamp("1970-01-01T00:01:00"), Ok(60));
/// assert!(parse_timestamp("yesterday").is_err());
/// ```
pub fn parse_timestamp(text: &str) -> Result<i64, TimestampFormatError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| TimestampFormatError {
            text: text.to_string(),
        })
}

/// Source of raw device time in Unix epoch seconds.
pub trait Clock {
    fn now_epoch(&self) -> i64;
}

/// The host's system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Something that can report the current epoch as seen by a named time server.
pub trait TimeSource {
    fn query(&mut self, server: &str) -> Result<i64, TimeSyncError>;
}

/// Minimal SNTP v3 client over a blocking UDP socket.
#[derive(Clone, Debug)]
pub struct SntpClient {
    timeout: Duration,
}

impl SntpClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SntpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TimeSource for SntpClient {
    fn query(&mut self, server: &str) -> Result<i64, TimeSyncError> {
        let addr = (server, NTP_PORT)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TimeSyncError::Resolve(server.to_string()))?;

        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(self.timeout))?;

        // LI=0, VN=3, Mode=3 (client)
        let mut request = [0u8; 48];
        request[0] = 0x1B;
        socket.send_to(&request, addr)?;

        let mut response = [0u8; 48];
        let (n, _) = socket.recv_from(&mut response)?;
        if n < response.len() {
            return Err(TimeSyncError::ShortResponse(n));
        }

        // transmit timestamp, seconds part
        let seconds = u32::from_be_bytes([response[40], response[41], response[42], response[43]]);
        if i64::from(seconds) < NTP_TO_UNIX_OFFSET {
            return Err(TimeSyncError::InvalidTimestamp(seconds));
        }

        Ok(i64::from(seconds) - NTP_TO_UNIX_OFFSET)
    }
}

/// One DST breakpoint: from `epoch` onwards, add `hours` to UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DstBreakpoint {
    pub epoch: i64,
    pub hours: i64,
}

/// Ordered, manually maintained daylight saving breakpoints.
///
/// The table covers a finite horizon; past its last entry no further changes happen
/// without a firmware update, so the last entry should be a standard-time (0) one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DstTable {
    breakpoints: Vec<DstBreakpoint>,
}

/// Irish/UK changeovers, (year, month, day, hour UTC, offset).
const EUROPE_DUBLIN_CHANGES: [(i32, u32, u32, u32, i64); 13] = [
    (2024, 10, 27, 2, 0),
    (2025, 3, 30, 1, 1),
    (2025, 10, 26, 2, 0),
    (2026, 3, 29, 1, 1),
    (2026, 10, 25, 2, 0),
    (2027, 3, 28, 1, 1),
    (2027, 10, 31, 2, 0),
    (2028, 3, 26, 1, 1),
    (2028, 10, 29, 2, 0),
    (2029, 3, 25, 1, 1),
    (2029, 10, 28, 2, 0),
    (2030, 3, 31, 1, 1),
    (2030, 10, 27, 2, 0),
];

impl DstTable {
    /// Build a table from `(epoch, hours)` pairs, which must be strictly ascending.
    pub fn new(pairs: impl IntoIterator<Item = (i64, i64)>) -> Result<Self, DstTableError> {
        let breakpoints: Vec<DstBreakpoint> = pairs
            .into_iter()
            .map(|(epoch, hours)| DstBreakpoint { epoch, hours })
            .collect();

        if let Some(index) = breakpoints
            .windows(2)
            .position(|w| w[1].epoch <= w[0].epoch)
        {
            return Err(DstTableError { index: index + 1 });
        }

        Ok(Self { breakpoints })
    }

    /// A table that never corrects anything.
    pub fn empty() -> Self {
        Self {
            breakpoints: Vec::new(),
        }
    }

    pub fn breakpoints(&self) -> &[DstBreakpoint] {
        &self.breakpoints
    }

    /// Hour offset in force at `epoch`.
    ///
    /// Inclusive at each breakpoint; 0 before the first one.
    pub fn offset_hours(&self, epoch: i64) -> i64 {
        let idx = self.breakpoints.partition_point(|b| b.epoch <= epoch);
        if idx == 0 {
            0
        } else {
            self.breakpoints[idx - 1].hours
        }
    }
}

impl Default for DstTable {
    fn default() -> Self {
        let breakpoints = EUROPE_DUBLIN_CHANGES
            .iter()
            .filter_map(|&(y, m, d, h, hours)| {
                let epoch = NaiveDate::from_ymd_opt(y, m, d)?
                    .and_hms_opt(h, 0, 0)?
                    .and_utc()
                    .timestamp();
                Some(DstBreakpoint { epoch, hours })
            })
            .collect();
        Self { breakpoints }
    }
}

/// Owner of the device's notion of "now".
pub struct TimeAuthority<C = SystemClock> {
    clock: C,
    dst: DstTable,
    /// Server time minus device time, learnt from the last successful sync
    offset_secs: i64,
}

impl<C: Clock> TimeAuthority<C> {
    pub fn new(clock: C, dst: DstTable) -> Self {
        Self {
            clock,
            dst,
            offset_secs: 0,
        }
    }

    /// Device epoch in UTC. Use this for all arrival arithmetic.
    pub fn raw_epoch(&self) -> i64 {
        self.clock.now_epoch() + self.offset_secs
    }

    /// Device epoch, optionally shifted by the DST table. For display only.
    pub fn corrected_epoch(&self, apply_dst: bool) -> i64 {
        let raw = self.raw_epoch();
        if apply_dst {
            raw + 3600 * self.dst.offset_hours(raw)
        } else {
            raw
        }
    }

    /// Try each server in order and adopt the first answer.
    ///
    /// Returns the server that answered. On failure the previous clock is kept.
    pub fn sync<'a, S: AsRef<str>>(
        &mut self,
        servers: &'a [S],
        source: &mut impl TimeSource,
    ) -> Result<&'a str, TimeSyncError> {
        for server in servers {
            let server = server.as_ref();
            match source.query(server) {
                Ok(epoch) => {
                    self.offset_secs = epoch - self.clock.now_epoch();
                    info!("time synced from {server} (offset {}s)", self.offset_secs);
                    return Ok(server);
                }
                Err(e) => warn!("time server {server} failed: {e}"),
            }
        }

        Err(TimeSyncError::Exhausted {
            attempted: servers.len(),
        })
    }
}
