//! Geometry-agnostic 1-bit framebuffer.
//!
//! Row-major, `ceil(width / 8)` bytes per row, most significant bit is the left-most
//! pixel. A set bit is a lit pixel. The buffer is allocated once and cleared in place.

use embedded_graphics::{pixelcolor::BinaryColor, prelude::*};
use std::convert::Infallible;

pub struct Framebuffer {
    width: u32,
    height: u32,
    stride: usize,
    buf: Vec<u8>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width.div_ceil(8) as usize;
        Self {
            width,
            height,
            stride,
            buf: vec![0; stride * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// One row of packed pixels.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.buf[start..start + self.stride]
    }

    pub fn clear(&mut self) {
        self.buf.fill(0);
    }

    /// Set or clear one pixel; out of range coordinates are ignored.
    pub fn set_pixel(&mut self, x: i32, y: i32, on: bool) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return;
        }
        let index = y as usize * self.stride + x as usize / 8;
        let bit = 0x80 >> (x % 8);
        if on {
            self.buf[index] |= bit;
        } else {
            self.buf[index] &= !bit;
        }
    }

    pub fn pixel(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return false;
        }
        let index = y as usize * self.stride + x as usize / 8;
        self.buf[index] & (0x80 >> (x % 8)) != 0
    }

    /// Number of lit pixels inside the given rectangle.
    pub fn count_lit(&self, x: i32, y: i32, width: u32, height: u32) -> usize {
        (y..y + height as i32)
            .flat_map(|py| (x..x + width as i32).map(move |px| (px, py)))
            .filter(|&(px, py)| self.pixel(px, py))
            .count()
    }

    /// Render as text, `#` for lit pixels, for terminal debugging.
    pub fn to_ascii(&self) -> String {
        let mut out = String::with_capacity((self.width as usize + 1) * self.height as usize);
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                out.push(if self.pixel(x, y) { '#' } else { '.' });
            }
            out.push('\n');
        }
        out
    }
}

impl OriginDimensions for Framebuffer {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Framebuffer {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(Point { x, y }, color) in pixels {
            self.set_pixel(x, y, color.is_on());
        }
        Ok(())
    }
}
