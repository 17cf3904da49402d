//! # Bus Stop Display Entry Point
//!
//! Wires the library together for one of two targets:
//!
//! - **Production** (`--features hardware` on Linux): ST7920 over spidev with GPIO
//!   chip select, reset and backlight, cycling until SIGINT or SIGTERM
//! - **Development** (`--stdout`): one refresh drawn to the terminal as ASCII art
//!
//! ```text
//! bus-stop-display [--config bus-stop.toml] [--stdout] [--write-default-config]
//! ```


#[cfg(all(target_os = "linux", feature = "hardware"))]
mod hardware;

use anyhow::Context;
use bus_stop_lib::arrivals::{ArrivalFetcher, HttpBackend};
use bus_stop_lib::clock::{DstTable, SntpClient, SystemClock, TimeAuthority};
use bus_stop_lib::config::{Config, DEFAULT_CONFIG_PATH};
use bus_stop_lib::controller::{Controller, Settings};
use bus_stop_lib::framebuffer::Framebuffer;
use bus_stop_lib::layout::BoardLayout;
use bus_stop_lib::log_buffer::LogBuffer;
use bus_stop_lib::network::{ReadinessProbe, TcpProbe};
use bus_stop_lib::st7920::{DisplayError, Lcd, RowDisplay, HEIGHT, ROW_BYTES, WIDTH};
use bus_stop_lib::stops::StopRegistry;
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

/// Arrival board for an ST7920 128x64 LCD
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(name = "bus-stop-display")]
#[command(version)]
#[command(about = "Next buses at your stop on an ST7920 LCD")]
struct Args {
    /// Settings file
    #[arg(long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    /// Draw one refresh to the terminal as ASCII art instead of driving the panel
    #[arg(long = "stdout")]
    development_mode: bool,

    /// Write a settings file with default values to the --config path and exit
    #[arg(long)]
    write_default_config: bool,
}

/// Panel stand-in that prints each completed frame to a writer as ASCII art.
struct TerminalPanel<W> {
    frame: Framebuffer,
    out: W,
}

impl<W: Write> TerminalPanel<W> {
    fn new(out: W) -> Self {
        Self {
            frame: Framebuffer::new(WIDTH, HEIGHT),
            out,
        }
    }
}

impl<W: Write> RowDisplay for TerminalPanel<W> {
    fn write_row(&mut self, row: u32, bytes: &[u8]) -> Result<(), DisplayError> {
        if row >= HEIGHT {
            return Err(DisplayError::RowOutOfRange(row));
        }
        if bytes.len() != ROW_BYTES {
            return Err(DisplayError::RowLength(bytes.len()));
        }
        for (x, byte) in (0..).step_by(8).zip(bytes) {
            for bit in 0..8 {
                self.frame
                    .set_pixel(x + bit, row as i32, byte & (0x80 >> bit) != 0);
            }
        }

        if row == HEIGHT - 1 {
            // a lost terminal is not worth failing the cycle over
            let _ = writeln!(self.out, "{}", self.frame.to_ascii());
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        self.frame.clear();
        Ok(())
    }
}

/// Build the controller around whichever panel this target has.
fn build_controller<P: RowDisplay>(
    panel: P,
    config: &Config,
    log: LogBuffer,
) -> anyhow::Result<Controller<P, HttpBackend, SystemClock>> {
    let registry = StopRegistry::new(config.stop_configurations()?)
        .with_name_substitutions(config.name_substitutions.clone())
        .with_staleness_secs(config.backend.staleness_secs as i64);

    let backend = HttpBackend::new(config.request_timeout()).context("create HTTP client")?;
    let fetcher = ArrivalFetcher::new(
        backend,
        config.backend.url_template.as_str(),
        config.backend.receive_buffer_bytes,
    );

    Ok(Controller::new(
        Lcd::new(panel),
        BoardLayout::new(WIDTH, config.display.designation_min_chars),
        registry,
        fetcher,
        TimeAuthority::new(SystemClock, DstTable::default()),
        log,
        Settings::from_config(config),
    ))
}

/// Boot and cycle until a termination signal arrives.
#[cfg_attr(not(all(target_os = "linux", feature = "hardware")), allow(dead_code))]
fn run_board<P: RowDisplay>(panel: P, config: &Config, log: LogBuffer) -> anyhow::Result<()> {
    let mut controller = build_controller(panel, config, log)?;

    let mut time_source = SntpClient::new(config.time_server_timeout());
    let mut tcp_probe = config.network.probe_host.as_deref().map(TcpProbe::new);
    let probe = tcp_probe
        .as_mut()
        .map(|p| (p as &mut dyn ReadinessProbe, config.connect_timeout()));

    controller.start(probe, &mut time_source)?;

    // SIGINT or SIGTERM ends the loop so the backlight goes off and the log is flushed
    let running = controller.stop_handle();
    ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
        .context("install termination handler")?;

    info!("arrival board running");
    controller.run(None);
    controller.shutdown();
    Ok(())
}

/// One refresh, printed to stdout.
fn run_once_to_stdout(config: &Config, log: LogBuffer) -> anyhow::Result<()> {
    let panel = TerminalPanel::new(std::io::stdout());
    let mut controller = build_controller(panel, config, log)?;
    controller.init_display()?;
    controller.run(Some(1));
    controller.shutdown();
    Ok(())
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.write_default_config {
        Config::default()
            .save(&args.config_path)
            .with_context(|| format!("write {}", args.config_path.display()))?;
        return Ok(());
    }

    // Configuration problems are fatal: show them and stop
    let config = Config::load_from_path(&args.config_path)
        .with_context(|| format!("load {}", args.config_path.display()))?;
    let log = LogBuffer::new(&config.log.dir)
        .with_context(|| format!("open log directory {}", config.log.dir))?;

    // Development mode: ASCII output for testing
    if args.development_mode {
        return run_once_to_stdout(&config, log);
    }

    run_production(&config, log)
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
fn run_production(config: &Config, log: LogBuffer) -> anyhow::Result<()> {
    let panel = hardware::open_panel(&config.display)?;
    run_board(panel, config, log)
}

#[cfg(all(target_os = "linux", not(feature = "hardware")))]
fn run_production(config: &Config, log: LogBuffer) -> anyhow::Result<()> {
    log::warn!("LCD support not enabled. Rebuild with --features hardware for the panel.");
    log::warn!("Showing ASCII output instead:");
    run_once_to_stdout(config, log)
}

#[cfg(not(target_os = "linux"))]
fn run_production(_config: &Config, _log: LogBuffer) -> anyhow::Result<()> {
    log::warn!("Hardware mode is only available on Linux. Use --stdout for development mode.");
    Err(anyhow::anyhow!("Hardware mode not supported on this platform"))
}
