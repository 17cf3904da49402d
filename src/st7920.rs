//! ST7920 128x64 LCD driver over SPI.
//!
//! This implementation follows the ST7920 datasheet serial-mode timing and the power-up
//! sequence on page 34 to stay compatible with the common 12864 modules.
//!
//! ## Serial Framing
//! Every transfer starts with a synchronisation byte, `0b11111_RW_RS_0`, followed by each
//! payload byte split into two bytes: the high nibble, then the low nibble shifted up.
//!
//! ```text
//! RS RW
//!  0  0   write instruction register
//!  1  0   write data register
//! ```
//!
//! ## Graphics RAM Addressing
//! GDRAM is 256 pixels wide by 32 rows, not 128x64. The panel's bottom half lives to the
//! right of the top half, so panel row `r` is at vertical `r % 32`, horizontal word
//! `8 * (r / 32)`. The horizontal address wraps after 16 bytes without advancing the
//! row, so every row needs its own address instruction.
//!
//! ## Chip Select
//! CS is active HIGH on this controller, which rules out `SpiDevice`. The driver owns the
//! raw `SpiBus` and drives CS itself, releasing it even when the transfer fails.

use crate::framebuffer::Framebuffer;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiBus};
use log::{debug, info};
use thiserror::Error;

/// Panel dimensions
pub const WIDTH: u32 = 128;
pub const HEIGHT: u32 = 64;

/// Bytes sent per GDRAM address
pub const ROW_BYTES: usize = 16;

/// Rows in one GDRAM bank
const GDRAM_ROWS: u32 = 32;

// Instruction register bytes
const DISPLAY_CLEAR: u8 = 0x01;
const DISPLAY_CONTROL: u8 = 0x08;
const FUNCTION_SET: u8 = 0x20;
const SET_GDRAM_ADDRESS: u8 = 0x80;

/// Five ones: serial synchronisation pattern
const SYNC: u8 = 0b1111_1000;

/// Failures talking to the controller (the hardware protocol error kind).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("SPI transfer failed: {0:?}")]
    Spi(spi::ErrorKind),

    #[error("GPIO write failed: {0:?}")]
    Pin(digital::ErrorKind),

    #[error("row {0} is outside the panel")]
    RowOutOfRange(u32),

    #[error("row data must be 16 bytes, got {0}")]
    RowLength(usize),
}

fn spi_error(e: impl spi::Error) -> DisplayError {
    DisplayError::Spi(e.kind())
}

fn pin_error(e: impl digital::Error) -> DisplayError {
    DisplayError::Pin(e.kind())
}

/// Target register of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Instruction,
    Data,
}

/// Synchronisation byte for a write (RW = 0) to `register`.
pub fn sync_header(register: Register) -> u8 {
    let rs = match register {
        Register::Instruction => 0,
        Register::Data => 1,
    };
    SYNC | (rs << 1)
}

/// Append each byte of `payload` to `out` as a high-nibble byte and a low-nibble byte.
pub fn encode_nibbles(payload: &[u8], out: &mut Vec<u8>) {
    for &byte in payload {
        out.push(byte & 0xF0);
        out.push((byte & 0x0F) << 4);
    }
}

/// GDRAM (vertical, horizontal) address for a panel row.
pub fn gdram_address(row: u32) -> (u8, u8) {
    ((row % GDRAM_ROWS) as u8, (8 * (row / GDRAM_ROWS)) as u8)
}

/// Where the controller is in its power-up sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Reset,
    BasicMode,
    DisplayOn,
    ExtendedMode,
    GraphicsMode,
    Ready,
}

/// What the layout side needs from a panel: push one row, clear everything.
pub trait RowDisplay {
    /// Bring the panel up. Panels without a power-up sequence need not override this.
    fn init(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }

    /// Write `ROW_BYTES` bytes of packed pixels to panel row `row`.
    fn write_row(&mut self, row: u32, bytes: &[u8]) -> Result<(), DisplayError>;

    /// Issue the controller's clear.
    fn clear(&mut self) -> Result<(), DisplayError>;

    fn set_backlight(&mut self, _on: bool) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// ST7920 driver. All GPIOs share one pin type.
pub struct St7920<SPI, P, D> {
    spi: SPI,
    cs: P,
    reset: Option<P>,
    backlight: Option<P>,
    delay: D,
    /// Reused transmit buffer: header plus two bytes per payload byte
    tx: Vec<u8>,
    state: ControllerState,
}

impl<SPI, P, D> St7920<SPI, P, D>
where
    SPI: SpiBus,
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, cs: P, reset: Option<P>, backlight: Option<P>, delay: D) -> Self {
        Self {
            spi,
            cs,
            reset,
            backlight,
            delay,
            tx: Vec::with_capacity(1 + 2 * ROW_BYTES),
            state: ControllerState::Reset,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Run the datasheet power-up sequence and leave the controller in graphics mode.
    pub fn power_up(&mut self) -> Result<(), DisplayError> {
        info!("initialising ST7920");
        self.state = ControllerState::Reset;
        self.hardware_reset()?;

        // the datasheet sends basic function set twice
        for _ in 0..2 {
            self.function_set(false, false)?;
            self.delay.delay_us(100);
        }
        self.state = ControllerState::BasicMode;

        self.display_control(true, false, false)?;
        self.delay.delay_us(100);
        self.state = ControllerState::DisplayOn;

        self.function_set(true, false)?;
        self.delay.delay_us(100);
        self.state = ControllerState::ExtendedMode;

        self.function_set(true, true)?;
        self.state = ControllerState::GraphicsMode;

        self.write_instruction(&[DISPLAY_CLEAR])?;
        self.delay.delay_ms(10);
        self.state = ControllerState::Ready;

        debug!("ST7920 ready");
        Ok(())
    }

    /// Pulse reset low for 50 ms; the datasheet wants at least 40 ms afterwards.
    fn hardware_reset(&mut self) -> Result<(), DisplayError> {
        if let Some(reset) = self.reset.as_mut() {
            reset.set_low().map_err(pin_error)?;
            self.delay.delay_ms(50);
            reset.set_high().map_err(pin_error)?;
            self.delay.delay_ms(50);
        }
        Ok(())
    }

    /// Function set, always 8-bit interface. RE selects the extended set, G the graphic display.
    fn function_set(&mut self, extended: bool, graphic: bool) -> Result<(), DisplayError> {
        self.write_instruction(&[FUNCTION_SET
            | (1 << 4)
            | (u8::from(extended) << 2)
            | (u8::from(graphic) << 1)])
    }

    fn display_control(&mut self, display: bool, cursor: bool, blink: bool) -> Result<(), DisplayError> {
        self.write_instruction(&[DISPLAY_CONTROL
            | (u8::from(display) << 2)
            | (u8::from(cursor) << 1)
            | u8::from(blink)])
    }

    pub fn set_gdram_address(&mut self, vertical: u8, horizontal: u8) -> Result<(), DisplayError> {
        self.write_instruction(&[SET_GDRAM_ADDRESS | vertical, SET_GDRAM_ADDRESS | horizontal])
    }

    pub fn write_instruction(&mut self, instruction: &[u8]) -> Result<(), DisplayError> {
        self.write(Register::Instruction, instruction)
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<(), DisplayError> {
        self.write(Register::Data, data)
    }

    fn write(&mut self, register: Register, payload: &[u8]) -> Result<(), DisplayError> {
        self.tx.clear();
        self.tx.push(sync_header(register));
        encode_nibbles(payload, &mut self.tx);
        self.transmit()
    }

    /// Select, write, deselect. Deselect happens whether or not the write succeeded.
    fn transmit(&mut self) -> Result<(), DisplayError> {
        self.cs.set_high().map_err(pin_error)?;
        let written = self
            .spi
            .write(&self.tx)
            .and_then(|_| self.spi.flush())
            .map_err(spi_error);
        let released = self.cs.set_low().map_err(pin_error);
        written.and(released)
    }
}

impl<SPI, P, D> RowDisplay for St7920<SPI, P, D>
where
    SPI: SpiBus,
    P: OutputPin,
    D: DelayNs,
{
    fn init(&mut self) -> Result<(), DisplayError> {
        self.power_up()
    }

    fn write_row(&mut self, row: u32, bytes: &[u8]) -> Result<(), DisplayError> {
        if row >= HEIGHT {
            return Err(DisplayError::RowOutOfRange(row));
        }
        if bytes.len() != ROW_BYTES {
            return Err(DisplayError::RowLength(bytes.len()));
        }
        let (vertical, horizontal) = gdram_address(row);
        self.set_gdram_address(vertical, horizontal)?;
        self.write_data(bytes)
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        self.write_instruction(&[DISPLAY_CLEAR])
    }

    fn set_backlight(&mut self, on: bool) -> Result<(), DisplayError> {
        match self.backlight.as_mut() {
            Some(pin) if on => pin.set_high().map_err(pin_error),
            Some(pin) => pin.set_low().map_err(pin_error),
            None => Ok(()),
        }
    }
}

/// Owner of the framebuffer and the panel it is shown on.
pub struct Lcd<P> {
    framebuffer: Framebuffer,
    panel: P,
}

impl<P: RowDisplay> Lcd<P> {
    pub fn new(panel: P) -> Self {
        Self {
            framebuffer: Framebuffer::new(WIDTH, HEIGHT),
            panel,
        }
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn framebuffer_mut(&mut self) -> &mut Framebuffer {
        &mut self.framebuffer
    }

    pub fn panel(&self) -> &P {
        &self.panel
    }

    pub fn panel_mut(&mut self) -> &mut P {
        &mut self.panel
    }

    /// Power up the panel and start from a blank frame.
    pub fn init(&mut self) -> Result<(), DisplayError> {
        self.framebuffer.clear();
        self.panel.init()
    }

    pub fn clear_framebuffer(&mut self) {
        self.framebuffer.clear();
    }

    /// Zero the framebuffer and clear the panel.
    pub fn clear_display(&mut self) -> Result<(), DisplayError> {
        self.framebuffer.clear();
        self.panel.clear()
    }

    /// Push every framebuffer row to the panel.
    pub fn show(&mut self) -> Result<(), DisplayError> {
        for row in 0..self.framebuffer.height() {
            self.panel.write_row(row, self.framebuffer.row(row))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::convert::Infallible;
    use std::rc::Rc;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        High(&'static str),
        Low(&'static str),
        Spi(Vec<u8>),
        Delay(u32),
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct MockSpi {
        log: Log,
        fail: bool,
    }

    impl spi::ErrorType for MockSpi {
        type Error = spi::ErrorKind;
    }

    impl SpiBus for MockSpi {
        fn read(&mut self, _words: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
            if self.fail {
                return Err(spi::ErrorKind::Overrun);
            }
            self.log.borrow_mut().push(Event::Spi(words.to_vec()));
            Ok(())
        }

        fn transfer(&mut self, _read: &mut [u8], _write: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        fn transfer_in_place(&mut self, _words: &mut [u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    struct MockPin {
        name: &'static str,
        log: Log,
    }

    impl digital::ErrorType for MockPin {
        type Error = Infallible;
    }

    impl OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.log.borrow_mut().push(Event::Low(self.name));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.log.borrow_mut().push(Event::High(self.name));
            Ok(())
        }
    }

    struct MockDelay {
        log: Log,
    }

    impl DelayNs for MockDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.log.borrow_mut().push(Event::Delay(ns));
        }
    }

    fn driver(log: &Log, fail: bool) -> St7920<MockSpi, MockPin, MockDelay> {
        let pin = |name| MockPin {
            name,
            log: log.clone(),
        };
        St7920::new(
            MockSpi {
                log: log.clone(),
                fail,
            },
            pin("cs"),
            Some(pin("rst")),
            Some(pin("bl")),
            MockDelay { log: log.clone() },
        )
    }

    fn spi_frames(log: &Log) -> Vec<Vec<u8>> {
        log.borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Spi(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_nibble_encoding() {
        let mut out = Vec::new();
        encode_nibbles(&[0xA5, 0x0F, 0xF0], &mut out);
        assert_eq!(out, vec![0xA0, 0x50, 0x00, 0xF0, 0xF0, 0x00]);
    }

    #[test]
    fn test_sync_headers() {
        assert_eq!(sync_header(Register::Instruction), 0xF8);
        assert_eq!(sync_header(Register::Data), 0xFA);
    }

    #[test]
    fn test_bottom_half_uses_horizontal_offset() {
        assert_eq!(gdram_address(0), (0, 0));
        assert_eq!(gdram_address(31), (31, 0));
        assert_eq!(gdram_address(32), (0, 8));
        assert_eq!(gdram_address(63), (31, 8));
    }

    #[test]
    fn test_init_sequence() {
        let log: Log = Rc::default();
        let mut lcd = driver(&log, false);
        assert_eq!(lcd.state(), ControllerState::Reset);
        lcd.power_up().unwrap();
        assert_eq!(lcd.state(), ControllerState::Ready);

        assert_eq!(
            spi_frames(&log),
            vec![
                vec![0xF8, 0x30, 0x00], // basic, 8-bit
                vec![0xF8, 0x30, 0x00], // and again
                vec![0xF8, 0x00, 0xC0], // display on
                vec![0xF8, 0x30, 0x40], // extended
                vec![0xF8, 0x30, 0x60], // extended + graphics
                vec![0xF8, 0x00, 0x10], // clear
            ]
        );

        let events = log.borrow();
        assert_eq!(&events[..4], &[
            Event::Low("rst"),
            Event::Delay(50_000_000),
            Event::High("rst"),
            Event::Delay(50_000_000),
        ]);
        let delays: Vec<u32> = events
            .iter()
            .skip(4)
            .filter_map(|e| match e {
                Event::Delay(ns) => Some(*ns),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![100_000, 100_000, 100_000, 100_000, 10_000_000]);
    }

    #[test]
    fn test_every_transfer_is_framed_by_chip_select() {
        let log: Log = Rc::default();
        let mut lcd = driver(&log, false);
        lcd.write_row(5, &[0u8; ROW_BYTES]).unwrap();

        let events = log.borrow();
        assert_eq!(events.len(), 6);
        for frame in events.chunks(3) {
            assert_eq!(frame[0], Event::High("cs"));
            assert!(matches!(frame[1], Event::Spi(_)));
            assert_eq!(frame[2], Event::Low("cs"));
        }
    }

    #[test]
    fn test_write_row_addresses_and_data() {
        let log: Log = Rc::default();
        let mut lcd = driver(&log, false);
        let mut row = [0u8; ROW_BYTES];
        row[0] = 0x81;
        lcd.write_row(33, &row).unwrap();

        let frames = spi_frames(&log);
        // vertical 1, horizontal 8
        assert_eq!(frames[0], vec![0xF8, 0x80, 0x10, 0x80, 0x80]);
        assert_eq!(frames[1].len(), 1 + 2 * ROW_BYTES);
        assert_eq!(&frames[1][..3], &[0xFA, 0x80, 0x10]);
    }

    #[test]
    fn test_write_row_rejects_bad_input() {
        let log: Log = Rc::default();
        let mut lcd = driver(&log, false);
        assert_eq!(lcd.write_row(64, &[0; ROW_BYTES]), Err(DisplayError::RowOutOfRange(64)));
        assert_eq!(lcd.write_row(0, &[0; 8]), Err(DisplayError::RowLength(8)));
        assert!(spi_frames(&log).is_empty());
    }

    #[test]
    fn test_chip_select_released_on_spi_failure() {
        let log: Log = Rc::default();
        let mut lcd = driver(&log, true);
        let err = lcd.clear().unwrap_err();
        assert_eq!(err, DisplayError::Spi(spi::ErrorKind::Overrun));
        assert_eq!(*log.borrow(), vec![Event::High("cs"), Event::Low("cs")]);
    }

    #[test]
    fn test_backlight() {
        let log: Log = Rc::default();
        let mut lcd = driver(&log, false);
        lcd.set_backlight(true).unwrap();
        lcd.set_backlight(false).unwrap();
        assert_eq!(*log.borrow(), vec![Event::High("bl"), Event::Low("bl")]);
    }

    /// Records rows instead of talking to hardware.
    #[derive(Default)]
    struct RecordingPanel {
        rows: Vec<(u32, Vec<u8>)>,
        clears: usize,
    }

    impl RowDisplay for RecordingPanel {
        fn write_row(&mut self, row: u32, bytes: &[u8]) -> Result<(), DisplayError> {
            self.rows.push((row, bytes.to_vec()));
            Ok(())
        }

        fn clear(&mut self) -> Result<(), DisplayError> {
            self.clears += 1;
            Ok(())
        }
    }

    #[test]
    fn test_show_walks_every_row() {
        let mut lcd = Lcd::new(RecordingPanel::default());
        lcd.framebuffer_mut().set_pixel(0, 40, true);
        lcd.show().unwrap();

        let rows = &lcd.panel().rows;
        assert_eq!(rows.len(), 64);
        assert!(rows.iter().enumerate().all(|(i, (r, _))| *r == i as u32));
        assert_eq!(rows[40].1[0], 0x80);
        assert_eq!(rows[39].1, vec![0; ROW_BYTES]);
    }

    #[test]
    fn test_clear_display_zeroes_framebuffer() {
        let mut lcd = Lcd::new(RecordingPanel::default());
        lcd.framebuffer_mut().set_pixel(3, 3, true);
        lcd.clear_display().unwrap();
        assert!(lcd.framebuffer().as_bytes().iter().all(|&b| b == 0));
        assert_eq!(lcd.panel().clears, 1);
    }
}
