//! Raspberry Pi wiring for the ST7920: kernel spidev for the bus, gpio-cdev lines for
//! chip select, reset and backlight.
//!
//! The kernel's own chip select is active low and cannot be used, so the SPI device's
//! CE line is left unconnected and a plain GPIO drives the panel's CS.

use anyhow::Context;
use bus_stop_lib::config::DisplayConfig;
use bus_stop_lib::st7920::St7920;
use linux_embedded_hal::gpio_cdev::{Chip, LineRequestFlags};
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::{CdevPin, Delay, SpidevBus};
use log::info;

const GPIO_CHIP: &str = "/dev/gpiochip0";
const CONSUMER: &str = "bus-stop-display";

pub type Panel = St7920<SpidevBus, CdevPin, Delay>;

fn output_pin(chip: &mut Chip, offset: u32, initial: u8) -> anyhow::Result<CdevPin> {
    let handle = chip
        .get_line(offset)
        .with_context(|| format!("get GPIO line {offset}"))?
        .request(LineRequestFlags::OUTPUT, initial, CONSUMER)
        .with_context(|| format!("request GPIO line {offset} as output"))?;
    CdevPin::new(handle).with_context(|| format!("wrap GPIO line {offset}"))
}

/// Open the bus and pins described by `display`. The panel is not initialised yet.
pub fn open_panel(display: &DisplayConfig) -> anyhow::Result<Panel> {
    let mut spi = SpidevBus::open(&display.spi_device)
        .with_context(|| format!("open {}", display.spi_device))?;
    let options = SpidevOptions::new()
        .bits_per_word(8)
        .max_speed_hz(display.spi_hz)
        .mode(SpiModeFlags::SPI_MODE_0)
        .build();
    spi.configure(&options).context("configure spidev")?;

    let mut chip = Chip::new(GPIO_CHIP).with_context(|| format!("open {GPIO_CHIP}"))?;
    // CS idles low (deselected), reset idles high (running)
    let cs = output_pin(&mut chip, display.cs_pin, 0)?;
    let reset = display
        .reset_pin
        .map(|pin| output_pin(&mut chip, pin, 1))
        .transpose()?;
    let backlight = display
        .backlight_pin
        .map(|pin| output_pin(&mut chip, pin, 0))
        .transpose()?;

    info!(
        "ST7920 on {} at {} Hz, CS GPIO {}, reset {:?}, backlight {:?}",
        display.spi_device, display.spi_hz, display.cs_pin, display.reset_pin, display.backlight_pin
    );

    Ok(St7920::new(spi, cs, reset, backlight, Delay))
}
