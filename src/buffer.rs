// SPDX-License-Identifier: MIT OR Apache-2.0

//! Physical pixel buffer: pixel store plus change-tracking bookkeeping.
//!
//! Each buffer carries a dirty rectangle (bounding box of all unflushed
//! writes), a monotonically increasing generation id (content version, used
//! to detect "nothing changed" without comparing pixels), flag bits, and the
//! identity record of the last render that produced it. All of that state
//! sits behind a per-buffer mutex so the render pipeline's read-modify-write
//! of flags never races the presentation worker reading them.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, SurfaceError};
use crate::format::{self, PixelFormat};
use crate::geometry::{Color, Rect};

/// Process-wide generation counter. Content versions are comparable across
/// buffers, which is what the render-identity check relies on.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Issue a fresh content version.
pub fn fresh_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Buffer flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u8);

impl BufferFlags {
    /// Unflushed writes exist.
    pub const DIRTY: BufferFlags = BufferFlags(1 << 0);
    /// Stale content outside the dirty rect must be cleared before the next
    /// write that reads around it.
    pub const NEEDS_CLEAR: BufferFlags = BufferFlags(1 << 1);
    /// Device-visible memory needs a cache flush before scan-out.
    pub const NEEDS_FLUSH: BufferFlags = BufferFlags(1 << 2);
    /// Temporarily pinned by an external consumer.
    pub const BLOCKED: BufferFlags = BufferFlags(1 << 3);

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }
}

/// Identity of the last render applied to a buffer: if the next request
/// matches, no pixel work is needed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRecord {
    /// Source content version, `None` for a sourceless fill.
    pub src_generation: Option<u64>,
    pub dest_rect: Rect,
    pub src_rect: Rect,
}

struct BufferState {
    pixels: Vec<u32>,
    dirty: Rect,
    generation: u64,
    prev_generation: u64,
    flags: BufferFlags,
    last_render: Option<RenderRecord>,
}

/// Mutable snapshot of a buffer's bookkeeping, for the scheduler and tests.
#[derive(Debug, Clone, Copy)]
pub struct BufferStatus {
    pub dirty: Rect,
    pub generation: u64,
    pub prev_generation: u64,
    pub flags: BufferFlags,
}

/// Physical pixel storage plus change tracking.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    state: Mutex<BufferState>,
    /// Count of pixel-mutating operations, for stats and write-free checks.
    writes: AtomicU64,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer. Dimensions and format are validated before
    /// any allocation; allocation failure is a recoverable resource error.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        format::validate_dimensions(width, height)?;

        let len = width as usize * height as usize;
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|e| SurfaceError::Resources(format!("pixel allocation failed: {e}")))?;
        pixels.resize(len, 0);

        Ok(Self {
            width,
            height,
            format,
            state: Mutex::new(BufferState {
                pixels,
                dirty: Rect::inverted_empty(width, height),
                generation: 0,
                prev_generation: 0,
                flags: BufferFlags::default(),
                last_render: None,
            }),
            writes: AtomicU64::new(0),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Reuse predicate: same geometry and format.
    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }

    /// Number of pixel-mutating operations applied so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> BufferStatus {
        let state = self.state.lock();
        BufferStatus {
            dirty: state.dirty,
            generation: state.generation,
            prev_generation: state.prev_generation,
            flags: state.flags,
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn last_render(&self) -> Option<RenderRecord> {
        self.state.lock().last_render
    }

    /// Mark stale content as needing a lazy clear (set when an idle buffer
    /// is recycled out of the cache for a new purpose).
    pub fn mark_needs_clear(&self) {
        self.state.lock().flags.insert(BufferFlags::NEEDS_CLEAR);
    }

    /// Pin or unpin the buffer for an external consumer.
    pub fn set_blocked(&self, blocked: bool) {
        let mut state = self.state.lock();
        if blocked {
            state.flags.insert(BufferFlags::BLOCKED);
        } else {
            state.flags.remove(BufferFlags::BLOCKED);
        }
    }

    /// Acknowledge a device-side cache flush.
    pub fn take_needs_flush(&self) -> bool {
        let mut state = self.state.lock();
        let needed = state.flags.contains(BufferFlags::NEEDS_FLUSH);
        state.flags.remove(BufferFlags::NEEDS_FLUSH);
        needed
    }

    /// Fill the dirty region with transparent black and reset change
    /// tracking. Only runs when there is something to clear.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.flags.contains(BufferFlags::DIRTY) {
            state.flags.remove(BufferFlags::NEEDS_CLEAR);
            return;
        }
        let dirty = state.dirty;
        Self::fill_rows(&mut state.pixels, self.width, &dirty, Color::TRANSPARENT);
        self.writes.fetch_add(1, Ordering::Relaxed);
        state.flags.remove(BufferFlags::DIRTY);
        state.flags.remove(BufferFlags::NEEDS_CLEAR);
        state.dirty = Rect::inverted_empty(self.width, self.height);
        trace!(width = self.width, height = self.height, "buffer cleared");
    }

    /// Clear lazily: only if stale content outside the upcoming write rect
    /// could otherwise leak through.
    pub fn clear_if_needed(&self, upcoming: &Rect) {
        let needs = {
            let state = self.state.lock();
            state.flags.contains(BufferFlags::NEEDS_CLEAR) && !state.dirty.contained_in(upcoming)
        };
        if needs {
            self.clear();
        }
    }

    /// Solid fill over `rect`, expanding the dirty rect.
    pub fn fill(&self, rect: &Rect, color: Color) {
        let mut state = self.state.lock();
        Self::fill_rows(&mut state.pixels, self.width, rect, color);
        self.writes.fetch_add(1, Ordering::Relaxed);
        state.flags.remove(BufferFlags::NEEDS_CLEAR);
        state.flags.insert(BufferFlags::DIRTY);
        state.flags.insert(BufferFlags::NEEDS_FLUSH);
        state.dirty.union(rect);
    }

    /// Copy `src_rect` of `src` into `dest_rect` of `self`, nearest-neighbor
    /// sampled when the rects differ in size. Expands the dirty rect.
    ///
    /// The source rows are snapshotted under the source lock before the
    /// destination lock is taken, so cross-blits between two buffers (or a
    /// self-blit) cannot deadlock.
    pub fn blit(&self, dest_rect: &Rect, src: &PixelBuffer, src_rect: &Rect) {
        let src_pixels: Vec<u32> = {
            let src_state = src.state.lock();
            Self::copy_rows_out(&src_state.pixels, src.width, src_rect)
        };
        let sw = src_rect.width() as usize;
        let sh = src_rect.height() as usize;
        if sw == 0 || sh == 0 {
            return;
        }

        let dw = dest_rect.width() as usize;
        let dh = dest_rect.height() as usize;
        let mut state = self.state.lock();
        for dy in 0..dh {
            let sy = dy * sh / dh;
            let dst_row = (dest_rect.y0 as usize + dy) * self.width as usize;
            for dx in 0..dw {
                let sx = dx * sw / dw;
                state.pixels[dst_row + dest_rect.x0 as usize + dx] = src_pixels[sy * sw + sx];
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        state.flags.remove(BufferFlags::NEEDS_CLEAR);
        state.flags.insert(BufferFlags::DIRTY);
        state.flags.insert(BufferFlags::NEEDS_FLUSH);
        state.dirty.union(dest_rect);
    }

    /// Copy caller pixels into `rect`. `pitch` is the caller row stride in
    /// pixels. Bumps the content generation.
    pub fn put_bits(&self, rect: &Rect, pixels: &[u32], pitch: usize) -> Result<()> {
        if !rect.within_bounds(self.width, self.height) {
            return Err(SurfaceError::InvalidParameter(format!(
                "destination rect {rect:?} outside {}x{} buffer",
                self.width, self.height
            )));
        }
        let rows = rect.height() as usize;
        let row_px = rect.width() as usize;
        if pitch < row_px || pixels.len() < (rows - 1) * pitch + row_px {
            return Err(SurfaceError::InvalidParameter(
                "source pixel slice too small for destination rect".into(),
            ));
        }

        self.clear_if_needed(rect);

        let mut state = self.state.lock();
        let width = self.width as usize;
        if rect.x0 == 0 && row_px == width && pitch == width {
            // Full-width rows: one straight copy.
            let start = rect.y0 as usize * width;
            state.pixels[start..start + rows * width].copy_from_slice(&pixels[..rows * width]);
        } else {
            for y in 0..rows {
                let dst = (rect.y0 as usize + y) * width + rect.x0 as usize;
                let src = y * pitch;
                state.pixels[dst..dst + row_px].copy_from_slice(&pixels[src..src + row_px]);
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        state.flags.remove(BufferFlags::NEEDS_CLEAR);
        state.flags.insert(BufferFlags::DIRTY);
        state.flags.insert(BufferFlags::NEEDS_FLUSH);
        state.dirty.union(rect);
        state.prev_generation = state.generation;
        state.generation = fresh_generation();
        // Direct writes invalidate the render-identity record.
        state.last_render = None;
        Ok(())
    }

    /// Duplicate only the previous buffer's dirty sub-rectangle into `self`,
    /// adopting its content version. This is the copy-on-write fork copy:
    /// never a full-frame duplication.
    pub fn copy_dirty_from(&self, prev: &PixelBuffer) {
        let (prev_dirty, prev_generation, rows) = {
            let prev_state = prev.state.lock();
            (
                prev_state.dirty,
                prev_state.generation,
                Self::copy_rows_out(&prev_state.pixels, prev.width, &prev_state.dirty),
            )
        };
        if prev_dirty.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        let row_px = prev_dirty.width() as usize;
        for y in 0..prev_dirty.height() as usize {
            let dst = (prev_dirty.y0 as usize + y) * self.width as usize + prev_dirty.x0 as usize;
            state.pixels[dst..dst + row_px].copy_from_slice(&rows[y * row_px..(y + 1) * row_px]);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        state.flags.insert(BufferFlags::DIRTY);
        state.flags.insert(BufferFlags::NEEDS_FLUSH);
        state.dirty.union(&prev_dirty);
        state.prev_generation = state.generation;
        state.generation = prev_generation;
    }

    /// Record the identity of the render that produced the current content.
    pub fn record_render(&self, record: RenderRecord, generation: u64) {
        let mut state = self.state.lock();
        state.last_render = Some(record);
        state.prev_generation = state.generation;
        state.generation = generation;
    }

    /// Read one pixel. Test and diagnostics helper.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let state = self.state.lock();
        Some(state.pixels[y as usize * self.width as usize + x as usize])
    }

    fn fill_rows(pixels: &mut [u32], width: u32, rect: &Rect, color: Color) {
        if rect.is_empty() {
            return;
        }
        for y in rect.y0..rect.y1 {
            let row = y as usize * width as usize;
            pixels[row + rect.x0 as usize..row + rect.x1 as usize].fill(color.0);
        }
    }

    fn copy_rows_out(pixels: &[u32], width: u32, rect: &Rect) -> Vec<u32> {
        if rect.is_empty() {
            return Vec::new();
        }
        let row_px = rect.width() as usize;
        let mut out = Vec::with_capacity(row_px * rect.height() as usize);
        for y in rect.y0..rect.y1 {
            let row = y as usize * width as usize;
            out.extend_from_slice(&pixels[row + rect.x0 as usize..row + rect.x1 as usize]);
        }
        out
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("generation", &status.generation)
            .field("dirty", &status.dirty)
            .finish()
    }
}
