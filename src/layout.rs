//! # Arrival Board Layout
//!
//! Lays the ranked arrivals out on the 128x64 panel:
//!
//! ```text
//! Patrick St          18:34
//! (208 ) Lotabeg          2
//! ( X1 ) Limerick         8
//! (220 ) University Hos...12
//! ```
//!
//! Each row is a filled, rounded badge with the route in inverse video, the destination
//! clipped to whatever fits before the right-aligned minutes, and a three-dot marker when
//! the destination had to be clipped.
//!
//! ## Geometry
//! All text uses a 5x8 font on a 6 pixel pitch. A badge is the text height plus a 1 px
//! top and 2 px bottom margin (the font is really 7 px tall for most glyphs, so this
//! centres it), and rows are spaced 2 px apart: 13 px per row, four rows below a 14 px
//! header.

use crate::Arrival;
use chrono::DateTime;
use embedded_graphics::{
    mono_font::{
        ascii::{FONT_5X8, FONT_6X10},
        MonoFont, MonoTextStyle,
    },
    pixelcolor::BinaryColor,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::{Baseline, Text},
};
use std::convert::Infallible;

pub const CHAR_HEIGHT: i32 = 8;
pub const CHAR_WIDTH: i32 = 5;
pub const CHAR_PITCH: i32 = CHAR_WIDTH + 1;

const TEXT_TOP_MARGIN: i32 = 1;
const TEXT_BOTTOM_MARGIN: i32 = TEXT_TOP_MARGIN + 1;
const TEXT_VERT_MARGIN: i32 = TEXT_TOP_MARGIN + TEXT_BOTTOM_MARGIN;
const TEXT_HORZ_MARGIN: i32 = 3;

/// Distance kept from the left and right panel edges
pub const HORZ_MARGIN: i32 = 1;
const LINE_SPACING: i32 = 2;

/// Vertical distance between schedule rows
pub const LINE_PITCH: i32 = CHAR_HEIGHT + TEXT_VERT_MARGIN + LINE_SPACING;

/// Where the first schedule row starts
pub const BOARD_TOP: i32 = 14;

/// Left edge of the header clock
pub const CLOCK_X: i32 = 91;

/// Badge width in characters when nothing says otherwise
pub const DEFAULT_DESIGNATION_CHARS: usize = 4;

/// 5x8 glyphs on a 6 px pitch
const BOARD_FONT: MonoFont<'static> = MonoFont {
    character_spacing: (CHAR_PITCH - CHAR_WIDTH) as u32,
    ..FONT_5X8
};

const TITLE_FONT: &MonoFont<'static> = &FONT_6X10;

/// Clip `text` to at most `max_chars` characters; the flag says whether it was clipped.
pub fn fit_text(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => (&text[..end], true),
        None => (text, false),
    }
}

/// Greedy word wrap to `width` characters; words longer than a line are split.
pub fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word = word;
        loop {
            let used = current.chars().count();
            let room = if used == 0 { width } else { width.saturating_sub(used + 1) };
            let word_chars = word.chars().count();

            if word_chars <= room {
                if used > 0 {
                    current.push(' ');
                }
                current.push_str(word);
                break;
            }
            if used > 0 {
                lines.push(std::mem::take(&mut current));
                continue;
            }
            let (head, _) = fit_text(word, width);
            lines.push(head.to_string());
            word = &word[head.len()..];
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// `HH:MM` for an epoch that has already been DST corrected.
pub fn clock_text(corrected_epoch: i64) -> String {
    DateTime::from_timestamp(corrected_epoch, 0)
        .map(|dt| dt.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

/// Positions computed while drawing one schedule row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowMetrics {
    /// First column right of the badge
    pub badge_right: i32,
    /// Left edge of the destination text
    pub destination_x: i32,
    /// Left edge of the minutes text
    pub minutes_x: i32,
    /// Destination characters that fit
    pub max_chars: usize,
    /// True if the destination was clipped and the dots drawn
    pub clipped: bool,
}

/// Draws the arrival board into any 1-bit draw target.
#[derive(Clone, Debug)]
pub struct BoardLayout {
    width: i32,
    designation_min_chars: usize,
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self::new(128, DEFAULT_DESIGNATION_CHARS)
    }
}

impl BoardLayout {
    pub fn new(width: u32, designation_min_chars: usize) -> Self {
        Self {
            width: width as i32,
            designation_min_chars,
        }
    }

    fn text<D>(&self, target: &mut D, text: &str, x: i32, y: i32, color: BinaryColor)
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        Text::with_baseline(text, Point::new(x, y), MonoTextStyle::new(&BOARD_FONT, color), Baseline::Top)
            .draw(target)
            .ok();
    }

    /// Filled rectangle with its four corner pixels knocked out.
    pub fn round_rect<D>(&self, target: &mut D, x: i32, y: i32, width: u32, height: u32, color: BinaryColor)
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        Rectangle::new(Point::new(x, y), Size::new(width, height))
            .into_styled(PrimitiveStyle::with_fill(color))
            .draw(target)
            .ok();

        let right = x + width as i32 - 1;
        let bottom = y + height as i32 - 1;
        let corners = [(x, y), (right, y), (x, bottom), (right, bottom)];
        target
            .draw_iter(
                corners
                    .into_iter()
                    .map(|(cx, cy)| Pixel(Point::new(cx, cy), color.invert())),
            )
            .ok();
    }

    /// Route badge at (`x`, `y`) with `text` centred inside. Returns its right edge.
    pub fn draw_badge<D>(&self, target: &mut D, text: &str, x: i32, y: i32) -> i32
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        let text_chars = text.chars().count() as i32;
        let char_count = text_chars.max(self.designation_min_chars as i32);

        // round half up; the padding is always a whole number of pitches
        let padding_chars = char_count - text_chars;
        let x_offset = (padding_chars * CHAR_PITCH + 1) / 2;

        let box_width = char_count * CHAR_PITCH - 1 + 2 * TEXT_HORZ_MARGIN;
        self.round_rect(
            target,
            x,
            y,
            box_width as u32,
            (CHAR_HEIGHT + TEXT_VERT_MARGIN) as u32,
            BinaryColor::On,
        );

        self.text(
            target,
            text,
            x + TEXT_HORZ_MARGIN + x_offset,
            y + TEXT_TOP_MARGIN + 1,
            BinaryColor::Off,
        );

        x + box_width
    }

    /// One arrival row: badge, destination (clipped if needed), right-aligned minutes.
    pub fn draw_schedule_line<D>(
        &self,
        target: &mut D,
        y: i32,
        route: &str,
        destination: &str,
        minutes: &str,
    ) -> RowMetrics
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        let badge_right = self.draw_badge(target, route, HORZ_MARGIN, y);

        let destination_x = badge_right + TEXT_HORZ_MARGIN + TEXT_TOP_MARGIN;
        let text_y = y + TEXT_TOP_MARGIN + 1;

        let minutes_x = self.width - CHAR_PITCH * minutes.chars().count() as i32 - HORZ_MARGIN;
        let max_chars = ((minutes_x - destination_x).div_euclid(CHAR_PITCH) - 1).max(0) as usize;

        let (shown, clipped) = fit_text(destination, max_chars);
        self.text(target, shown, destination_x, text_y, BinaryColor::On);

        if clipped {
            let dots_x = destination_x + max_chars as i32 * CHAR_PITCH;
            let dots_y = text_y + CHAR_HEIGHT - 2;
            target
                .draw_iter(
                    [1, 3, 5]
                        .into_iter()
                        .map(|dx| Pixel(Point::new(dots_x + dx, dots_y), BinaryColor::On)),
                )
                .ok();
        }

        self.text(target, minutes, minutes_x, text_y, BinaryColor::On);

        RowMetrics {
            badge_right,
            destination_x,
            minutes_x,
            max_chars,
            clipped,
        }
    }

    /// Draw one row per arrival starting at `y`. Nothing is drawn for missing rows.
    pub fn draw_schedule_lines<D>(&self, target: &mut D, y: i32, arrivals: &[Arrival]) -> Vec<RowMetrics>
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        arrivals
            .iter()
            .enumerate()
            .map(|(i, arrival)| {
                self.draw_schedule_line(
                    target,
                    y + i as i32 * LINE_PITCH,
                    &arrival.route,
                    &arrival.headsign,
                    &arrival.minutes().to_string(),
                )
            })
            .collect()
    }

    /// Stop name top-left, clock top-right.
    pub fn draw_header<D>(&self, target: &mut D, title: &str, corrected_epoch: i64)
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        let title_chars = (CLOCK_X / TITLE_FONT.character_size.width as i32) as usize;
        let (title, _) = fit_text(title, title_chars);
        Text::with_baseline(title, Point::zero(), MonoTextStyle::new(TITLE_FONT, BinaryColor::On), Baseline::Top)
            .draw(target)
            .ok();

        Text::with_baseline(
            &clock_text(corrected_epoch),
            Point::new(CLOCK_X, 1),
            MonoTextStyle::new(TITLE_FONT, BinaryColor::On),
            Baseline::Top,
        )
        .draw(target)
        .ok();
    }

    /// Full-screen message: `title` in the header font, `message` word-wrapped below it.
    /// Lines that do not fit on the panel are dropped.
    pub fn draw_message<D>(&self, target: &mut D, title: &str, message: &str)
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        Text::with_baseline(title, Point::zero(), MonoTextStyle::new(TITLE_FONT, BinaryColor::On), Baseline::Top)
            .draw(target)
            .ok();

        let line_chars = ((self.width - 2 * HORZ_MARGIN) / CHAR_PITCH) as usize;
        let rows = ((target.bounding_box().size.height as i32 - BOARD_TOP) / (CHAR_HEIGHT + 1)).max(0) as usize;
        for (i, line) in wrap_words(message, line_chars).iter().take(rows).enumerate() {
            self.text(
                target,
                line,
                HORZ_MARGIN,
                BOARD_TOP + i as i32 * (CHAR_HEIGHT + 1),
                BinaryColor::On,
            );
        }
    }

    /// Header plus schedule rows. The caller clears the target first.
    pub fn draw_board<D>(&self, target: &mut D, title: &str, corrected_epoch: i64, arrivals: &[Arrival])
    where
        D: DrawTarget<Color = BinaryColor, Error = Infallible>,
    {
        self.draw_header(target, title, corrected_epoch);
        self.draw_schedule_lines(target, BOARD_TOP, arrivals);
    }
}
