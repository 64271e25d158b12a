// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rectangles and packed colors.
//!
//! The dirty-rectangle bookkeeping uses an "inverted empty" convention: a
//! freshly reset dirty rect has `x0 = width, y0 = height, x1 = 0, y1 = 0`,
//! so the first union with a real write rect collapses to exactly that rect.

/// Half-open rectangle: pixels with `x0 <= x < x1`, `y0 <= y < y1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub const fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Full-extent rect for a `width` x `height` buffer.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Reset value for a dirty rect over a `width` x `height` buffer.
    pub const fn inverted_empty(width: u32, height: u32) -> Self {
        Self::new(width, height, 0, 0)
    }

    pub const fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub const fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    /// Zero-area rects (including inverted ones) are empty.
    pub const fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    /// Expand to the bounding box of `self` and `rect`.
    pub fn union(&mut self, rect: &Rect) {
        self.x0 = self.x0.min(rect.x0);
        self.y0 = self.y0.min(rect.y0);
        self.x1 = self.x1.max(rect.x1);
        self.y1 = self.y1.max(rect.y1);
    }

    /// True if `self` lies entirely inside `rect`.
    pub fn contained_in(&self, rect: &Rect) -> bool {
        self.x0 >= rect.x0 && self.y0 >= rect.y0 && self.x1 <= rect.x1 && self.y1 <= rect.y1
    }

    /// True if `self` fits within a `width` x `height` buffer.
    pub fn within_bounds(&self, width: u32, height: u32) -> bool {
        self.x1 <= width && self.y1 <= height && !self.is_empty()
    }
}

/// Smaller of two values, treating zero as "unset".
///
/// Used for presentation clipping: a zero clip dimension means "no clip".
#[inline]
pub fn min_nz(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

/// Packed 32-bit ARGB color, one pixel word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color(pub u32);

impl Color {
    pub const TRANSPARENT: Color = Color(0x0000_0000);
    pub const WHITE: Color = Color(0xffff_ffff);
}
