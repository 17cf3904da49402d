//! # Control Loop
//!
//! Boot sequence and the steady-state refresh/draw cycle.
//!
//! ## Startup
//! Each step returns its own result and [`Controller::start`] decides what is fatal:
//!
//! 1. Power up the panel and switch the backlight on
//! 2. Wait for the network (only if a probe is configured)
//! 3. Sync the clock; failure here is logged and the device carries on
//! 4. Flush the boot log and stop buffering
//!
//! A fatal failure is drawn on the panel before it is handed back to the caller.
//!
//! ## Cycle
//! Refresh the registry against the uncorrected epoch, rank the board for the current
//! stop, draw it with the corrected clock in the header, push the frame. A failure is
//! logged at the cycle boundary and the next cycle starts from whatever cache survived.

use crate::arrivals::{ArrivalFetcher, Backend};
use crate::clock::{Clock, SystemClock, TimeAuthority, TimeSource};
use crate::config::{Config, ConfigError};
use crate::layout::BoardLayout;
use crate::log_buffer::LogBuffer;
use crate::network::{wait_until_online, NetworkError, ReadinessProbe};
use crate::st7920::{DisplayError, Lcd, RowDisplay};
use crate::stops::StopRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fatal failures during boot.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("network association: {0}")]
    Network(#[from] NetworkError),

    #[error("display: {0}")]
    Display(#[from] DisplayError),

    #[error("log sink: {0}")]
    Log(#[from] std::io::Error),
}

/// A failed cycle. The loop logs it and moves on.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("display: {0}")]
    Display(#[from] DisplayError),

    #[error("no stop at index {0}")]
    NoSuchStop(usize),
}

/// Loop behaviour taken from the settings file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub refresh_period: Duration,
    pub board_rows: usize,
    pub dst_correction: bool,
    pub time_servers: Vec<String>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_period: config.refresh_period(),
            board_rows: config.display.board_rows,
            dst_correction: config.time.dst_correction,
            time_servers: config.time.servers.clone(),
        }
    }
}

/// What one cycle did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleSummary {
    pub rows_drawn: usize,
    pub fetch_errors: usize,
}

pub struct Controller<P, B, C = SystemClock> {
    lcd: Lcd<P>,
    layout: BoardLayout,
    registry: StopRegistry,
    fetcher: ArrivalFetcher<B>,
    time: TimeAuthority<C>,
    log: LogBuffer,
    settings: Settings,
    current: usize,
    running: Arc<AtomicBool>,
}

/// Longest single sleep between checks of the running flag
const IDLE_SLICE: Duration = Duration::from_millis(100);

impl<P: RowDisplay, B: Backend, C: Clock> Controller<P, B, C> {
    /// The board starts on the registry's default stop.
    pub fn new(
        lcd: Lcd<P>,
        layout: BoardLayout,
        registry: StopRegistry,
        fetcher: ArrivalFetcher<B>,
        time: TimeAuthority<C>,
        log: LogBuffer,
        settings: Settings,
    ) -> Self {
        let current = registry.default_index();
        Self {
            lcd,
            layout,
            registry,
            fetcher,
            time,
            log,
            settings,
            current,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn lcd(&self) -> &Lcd<P> {
        &self.lcd
    }

    pub fn registry(&self) -> &StopRegistry {
        &self.registry
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn time(&self) -> &TimeAuthority<C> {
        &self.time
    }

    pub fn current_stop(&self) -> usize {
        self.current
    }

    /// Flag that keeps [`Controller::run`] cycling. Clear it, from a signal handler for
    /// instance, and the loop returns at the next cycle boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Select which logical stop the board shows.
    pub fn select_stop(&mut self, index: usize) -> Result<(), CycleError> {
        if index >= self.registry.len() {
            return Err(CycleError::NoSuchStop(index));
        }
        self.current = index;
        Ok(())
    }

    /// Run the whole boot sequence. On a fatal error the message is shown on the panel.
    pub fn start(
        &mut self,
        probe: Option<(&mut dyn ReadinessProbe, Duration)>,
        time_source: &mut impl TimeSource,
    ) -> Result<(), StartupError> {
        let result = self.boot(probe, time_source);
        if let Err(e) = &result {
            self.log.error_chain(e);
            self.show_error("Startup failed", &e.to_string());
            if let Err(io) = self.log.flush() {
                log::error!("could not persist boot log: {io}");
            }
        }
        result
    }

    fn boot(
        &mut self,
        probe: Option<(&mut dyn ReadinessProbe, Duration)>,
        time_source: &mut impl TimeSource,
    ) -> Result<(), StartupError> {
        self.init_display()?;
        if let Some((probe, timeout)) = probe {
            self.wait_for_network(probe, timeout)?;
        }
        self.sync_time(time_source);
        self.finish_boot()
    }

    pub fn init_display(&mut self) -> Result<(), StartupError> {
        self.lcd.init()?;
        self.lcd.panel_mut().set_backlight(true)?;
        self.lcd.clear_display()?;
        self.log.info("display ready");
        Ok(())
    }

    pub fn wait_for_network(
        &mut self,
        probe: &mut dyn ReadinessProbe,
        timeout: Duration,
    ) -> Result<(), StartupError> {
        self.log
            .info(&format!("waiting up to {} s for the network", timeout.as_secs()));
        let waited = wait_until_online(probe, timeout)?;
        self.log
            .info(&format!("network up after {:.2} s", waited.as_secs_f64()));
        Ok(())
    }

    /// Best effort; returns whether any server answered.
    pub fn sync_time(&mut self, source: &mut impl TimeSource) -> bool {
        match self.time.sync(&self.settings.time_servers, source) {
            Ok(server) => {
                let message = format!("clock set from {server}");
                self.log.info(&message);
                true
            }
            Err(e) => {
                self.log.warn(&format!("{e}, keeping the device clock"));
                false
            }
        }
    }

    /// There is no remote log sink, so the boot log goes to disk and buffering stops.
    pub fn finish_boot(&mut self) -> Result<(), StartupError> {
        self.log.info("boot complete");
        self.log.discard_future()?;
        Ok(())
    }

    /// Refresh, rank, draw and show the current stop.
    pub fn run_cycle(&mut self) -> Result<CycleSummary, CycleError> {
        let now = self.time.raw_epoch();
        let report = self.registry.refresh(&mut self.fetcher, now);
        for (stop_id, e) in &report.errors {
            self.log.warn(&format!("stop {stop_id}: {e}"));
        }

        let stop = self
            .registry
            .stop(self.current)
            .ok_or(CycleError::NoSuchStop(self.current))?;
        let title = stop
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Stop {}", stop.config().stop_ids[0]));

        let board = self
            .registry
            .arrival_board(self.current, self.settings.board_rows, now);
        let clock = self.time.corrected_epoch(self.settings.dst_correction);

        self.lcd.clear_framebuffer();
        self.layout
            .draw_board(self.lcd.framebuffer_mut(), &title, clock, &board);
        self.lcd.show()?;

        Ok(CycleSummary {
            rows_drawn: board.len(),
            fetch_errors: report.errors.len(),
        })
    }

    /// Cycle every refresh period, `cycles` times or until the stop handle is cleared.
    ///
    /// The period is slept in full after each cycle, however long the cycle took.
    pub fn run(&mut self, cycles: Option<u64>) {
        let mut completed = 0u64;
        while self.is_running() && cycles.map_or(true, |limit| completed < limit) {
            match self.run_cycle() {
                Ok(summary) => log::debug!(
                    "cycle {completed}: {} row(s), {} fetch error(s)",
                    summary.rows_drawn,
                    summary.fetch_errors
                ),
                Err(e) => self.log.error_chain(&e),
            }
            completed += 1;

            if cycles.map_or(true, |limit| completed < limit) {
                self.idle(self.settings.refresh_period);
            }
        }
        if !self.is_running() {
            self.log.info("stop requested");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep for `period`, waking early if a stop is requested.
    fn idle(&self, period: Duration) {
        let deadline = Instant::now() + period;
        while self.is_running() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            thread::sleep(left.min(IDLE_SLICE));
        }
    }

    /// Draw a message screen. Display failures are only logged; this is already the
    /// error path.
    pub fn show_error(&mut self, title: &str, message: &str) {
        self.lcd.clear_framebuffer();
        self.layout
            .draw_message(self.lcd.framebuffer_mut(), title, message);
        if let Err(e) = self.lcd.show() {
            log::error!("could not show error screen: {e}");
        }
    }

    /// Backlight off and a last flush of whatever is still buffered.
    pub fn shutdown(&mut self) {
        self.log.info("shutting down");
        if let Err(e) = self.lcd.panel_mut().set_backlight(false) {
            self.log.error(&format!("backlight: {e}"));
        }
        if let Err(e) = self.log.flush() {
            log::error!("could not flush log: {e}");
        }
    }
}
