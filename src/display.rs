// SPDX-License-Identifier: MIT OR Apache-2.0

//! Display device abstraction.
//!
//! The scan-out hardware sits behind a trait so the scheduler can drive a
//! real display layer or a recording fake in tests. Calls are blocking and
//! fallible; the presentation worker never holds a lock across them.

use std::sync::Arc;

use crate::buffer::PixelBuffer;
use crate::error::Result;
use crate::geometry::Rect;

/// One frame handed to the device for scan-out.
#[derive(Clone)]
pub struct FrameHandoff {
    /// The buffer to scan out. Its cache slot stays referenced for as long
    /// as the frame is visible, so the copy-on-write pipeline forks rather
    /// than mutating it.
    pub buffer: Arc<PixelBuffer>,
    /// Content version of the buffer at hand-off time.
    pub generation: u64,
    /// The region with actual content (the buffer's dirty rect).
    pub src_rect: Rect,
    /// On-screen placement after clipping.
    pub screen_rect: Rect,
}

impl std::fmt::Debug for FrameHandoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandoff")
            .field("generation", &self.generation)
            .field("src_rect", &self.src_rect)
            .field("screen_rect", &self.screen_rect)
            .finish()
    }
}

/// The display layer of the scan-out hardware.
pub trait DisplayDevice: Send {
    /// Point the display layer at a frame.
    fn set_layer(&mut self, frame: &FrameHandoff) -> Result<()>;

    /// Disable the display layer (nothing to show).
    fn close_layer(&mut self) -> Result<()>;

    /// Block until the next vertical blank.
    fn wait_vsync(&mut self) -> Result<()>;
}
