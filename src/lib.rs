//! # Bus Stop Display Core Library
//!
//! This library provides the data pipeline and rendering pipeline for a dedicated
//! transit arrival sign: a Raspberry Pi polling a schedule backend and drawing the
//! next few services onto an ST7920 128x64 monochrome LCD over SPI.
//!
//! ## Design Philosophy
//!
//! ### Single Loop, Single Owner
//! Everything runs on one synchronous control loop. The receive buffer, the cache and
//! the framebuffer each have exactly one owner, so nothing here needs a lock.
//!
//! ### Memory Efficiency
//! - **Fixed receive buffer**: backend responses are read into one reusable buffer
//!   (4096 bytes by default); anything larger is rejected rather than grown
//! - **Fixed framebuffer**: 128x64 at one bit per pixel is 1 KiB, cleared in place
//!
//! ### Data Flow
//! 1. **Fetch**: backend JSON for each underlying stop id ([`arrivals`])
//! 2. **Cache**: validated records held per stop id with the staleness hold-over ([`stops`])
//! 3. **Rank**: merge, compute seconds until arrival, sort ([`stops::BusStop::arrival_board`])
//! 4. **Layout**: badges, destinations and minutes into the framebuffer ([`layout`])
//! 5. **Show**: framebuffer rows pushed through the ST7920 protocol ([`st7920`])
//!
//! ## Core Types
//! - [`Arrival`]: one ranked service, ready to draw

pub mod arrivals;
pub mod clock;
pub mod config;
pub mod controller;
pub mod framebuffer;
pub mod layout;
pub mod log_buffer;
pub mod network;
pub mod st7920;
pub mod stops;

/// One ranked service on the arrival board.
///
/// Built fresh on every refresh cycle from the cached backend records and never
/// persisted. `seconds` is measured against the uncorrected device epoch because the
/// backend publishes its timestamps in UTC.
///
/// # Example
/// ```
/// use bus_stop_lib::Arrival;
///
/// let arrival = Arrival {
///     route: "208".to_string(),
///     headsign: "Lotabeg".to_string(),
///     seconds: 150,
///     scheduled: false,
/// };
///
/// assert_eq!(arrival.minutes(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arrival {
    /// Route designation drawn inside the badge
    pub route: String,
    /// Destination after headsign substitution
    pub headsign: String,
    /// Seconds until the real-time arrival, negative once it is due
    pub seconds: i64,
    /// True when the real-time arrival is exactly the timetabled one
    pub scheduled: bool,
}

impl Arrival {
    /// Whole minutes until arrival, rounded towards negative infinity.
    pub fn minutes(&self) -> i64 {
        self.seconds.div_euclid(60)
    }
}
