// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource-management core for a video display driver.
//!
//! This crate provides:
//! - a slot-based, reference-counted cache of pixel buffers with
//!   idle-buffer reuse
//! - a copy-on-write render pipeline with a render-identity fast path
//!   (repeating yesterday's composition costs zero pixel writes)
//! - a timed presentation queue that hands finished buffers to a
//!   [`DisplayDevice`] at their eligible time, never mutating a buffer that
//!   is being scanned out
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scanline::{DriverContext, PixelFormat, PresentationQueue};
//! # use scanline::{DisplayDevice, FrameHandoff, Result};
//! # struct NullDevice;
//! # impl DisplayDevice for NullDevice {
//! #     fn set_layer(&mut self, _: &FrameHandoff) -> Result<()> { Ok(()) }
//! #     fn close_layer(&mut self) -> Result<()> { Ok(()) }
//! #     fn wait_vsync(&mut self) -> Result<()> { Ok(()) }
//! # }
//!
//! # fn main() -> scanline::Result<()> {
//! let ctx = Arc::new(DriverContext::new());
//! let surface = ctx.create_surface(1920, 1080, PixelFormat::Bgra32)?;
//! scanline::render(&ctx, surface, None, None, None, &Default::default())?;
//!
//! let queue = PresentationQueue::new(Arc::clone(&ctx), Box::new(NullDevice))?;
//! queue.display(surface, 0, 0, queue.current_time())?;
//! ctx.block_until_idle(surface)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
pub mod clock;
pub mod context;
pub mod display;
pub mod error;
pub mod format;
pub mod geometry;
pub mod handles;
pub mod interop;
pub mod queue;
pub mod render;
pub mod surface;

pub use buffer::{BufferFlags, BufferStatus, PixelBuffer, RenderRecord};
pub use cache::{CacheHandle, CacheStats, SlotCache};
pub use context::DriverContext;
pub use display::{DisplayDevice, FrameHandoff};
pub use error::{Result, SurfaceError};
pub use format::{PixelFormat, MAX_DIMENSION};
pub use geometry::{Color, Rect};
pub use handles::{Handle, HandleTable};
pub use interop::ExternalMapping;
pub use queue::PresentationQueue;
pub use render::{put_bits, render, RenderOptions};
pub use surface::{Surface, SurfaceId, SurfaceStatus};
