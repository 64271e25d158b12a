// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logical surface: a stable, API-visible identity over a swappable
//! physical pixel buffer.
//!
//! The surface handle never changes across its lifetime, but the buffer it
//! points to is swapped whenever the copy-on-write pipeline forks. Consumers
//! must always dereference through the surface, never hold a raw buffer
//! reference across an operation that might fork it.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::buffer::{PixelBuffer, RenderRecord};
use crate::cache::CacheHandle;
use crate::format::PixelFormat;
use crate::handles::Handle;

/// Handle identifying a logical surface in the driver context.
pub type SurfaceId = Handle;

/// Display lifecycle of a surface: `Idle -> Queued -> Visible -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceStatus {
    #[default]
    Idle,
    Queued,
    Visible,
}

#[derive(Debug, Clone, Copy, Default)]
struct PresentState {
    status: SurfaceStatus,
    /// Timestamp of the first presentation after the latest queueing.
    presented_at: u64,
}

pub struct Surface {
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Current physical buffer; swapped atomically under this lock when the
    /// render pipeline forks.
    link: Mutex<LinkState>,
    present: Mutex<PresentState>,
    idle: Condvar,
}

struct LinkState {
    handle: Option<CacheHandle>,
    buffer: Option<Arc<PixelBuffer>>,
    /// Identity of the last render applied to this destination. Kept on the
    /// surface, not the buffer: an adopted buffer is shared with its source,
    /// whose own record describes a different destination.
    last_render: Option<RenderRecord>,
}

impl Surface {
    pub(crate) fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            link: Mutex::new(LinkState {
                handle: None,
                buffer: None,
                last_render: None,
            }),
            present: Mutex::new(PresentState::default()),
            idle: Condvar::new(),
        }
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

    /// Current buffer link, if any.
    pub fn buffer(&self) -> Option<(CacheHandle, Arc<PixelBuffer>)> {
        let link = self.link.lock();
        match (&link.handle, &link.buffer) {
            (Some(h), Some(b)) => Some((*h, Arc::clone(b))),
            _ => None,
        }
    }

    /// Swap in a new buffer link, returning the old handle so the caller can
    /// release it against the cache. The swap is atomic with respect to
    /// other readers of this surface.
    pub(crate) fn relink(
        &self,
        handle: CacheHandle,
        buffer: Arc<PixelBuffer>,
    ) -> Option<CacheHandle> {
        let mut link = self.link.lock();
        let old = link.handle.replace(handle);
        link.buffer = Some(buffer);
        old
    }

    /// Drop the buffer link, returning the old handle for release.
    pub(crate) fn unlink(&self) -> Option<CacheHandle> {
        let mut link = self.link.lock();
        link.buffer = None;
        link.last_render = None;
        link.handle.take()
    }

    /// Identity of the last render applied to this destination.
    pub fn last_render(&self) -> Option<RenderRecord> {
        self.link.lock().last_render
    }

    /// Record the render that produced the currently linked content.
    pub(crate) fn record_render(&self, record: RenderRecord) {
        self.link.lock().last_render = Some(record);
    }

    /// Forget the recorded render identity. Direct pixel writes make the
    /// record meaningless.
    pub(crate) fn invalidate_render_record(&self) {
        self.link.lock().last_render = None;
    }

    pub fn status(&self) -> (SurfaceStatus, u64) {
        let present = self.present.lock();
        (present.status, present.presented_at)
    }

    /// `Idle|Visible -> Queued`; clears the recorded presentation time.
    pub(crate) fn mark_queued(&self) {
        let mut present = self.present.lock();
        present.status = SurfaceStatus::Queued;
        present.presented_at = 0;
    }

    /// `Queued -> Visible` with the presentation timestamp.
    pub(crate) fn mark_visible(&self, when_ns: u64) {
        let mut present = self.present.lock();
        present.status = SurfaceStatus::Visible;
        present.presented_at = when_ns;
    }

    /// `-> Idle`, waking any `wait_idle` callers.
    pub(crate) fn mark_idle(&self) {
        let mut present = self.present.lock();
        present.status = SurfaceStatus::Idle;
        drop(present);
        self.idle.notify_all();
    }

    /// Block until the surface leaves the presentation pipeline, returning
    /// the timestamp of its most recent presentation (0 if never shown).
    pub fn wait_idle(&self) -> u64 {
        let mut present = self.present.lock();
        while present.status != SurfaceStatus::Idle {
            self.idle.wait(&mut present);
        }
        present.presented_at
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (status, presented_at) = self.status();
        f.debug_struct("Surface")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("status", &status)
            .field("presented_at", &presented_at)
            .finish()
    }
}
