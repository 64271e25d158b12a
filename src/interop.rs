// SPDX-License-Identifier: MIT OR Apache-2.0

//! External buffer mapping.
//!
//! GPU interop and similar consumers borrow a surface's physical buffer for
//! a while (texture import, dma-buf export). The borrow is expressed as an
//! RAII guard holding an extra cache reference: while a mapping is alive the
//! buffer's refcount is at least 2, so the render pipeline forks instead of
//! mutating the mapped memory. Dropping the guard releases the reference.

use std::sync::Arc;

use tracing::trace;

use crate::buffer::PixelBuffer;
use crate::cache::{CacheHandle, SlotCache};
use crate::context::DriverContext;
use crate::error::{Result, SurfaceError};
use crate::surface::SurfaceId;

/// RAII borrow of a surface's physical buffer by an external consumer.
pub struct ExternalMapping<'a> {
    cache: &'a SlotCache<Arc<PixelBuffer>>,
    handle: CacheHandle,
    buffer: Arc<PixelBuffer>,
}

impl<'a> ExternalMapping<'a> {
    /// Map the surface's current buffer. Fails if the surface has no buffer
    /// attached yet (nothing has been rendered or written to it).
    pub fn acquire(ctx: &'a DriverContext, id: SurfaceId) -> Result<Self> {
        let surface = ctx.surface(id)?;
        let (handle, buffer) = surface.buffer().ok_or_else(|| {
            SurfaceError::InvalidParameter(format!(
                "surface {} has no buffer to map",
                id.raw()
            ))
        })?;
        ctx.cache().retain(handle);
        buffer.set_blocked(true);
        trace!(surface = id.raw(), slot = handle.raw(), "external mapping acquired");
        Ok(Self {
            cache: ctx.cache(),
            handle,
            buffer,
        })
    }

    pub fn buffer(&self) -> &Arc<PixelBuffer> {
        &self.buffer
    }

    pub fn handle(&self) -> CacheHandle {
        self.handle
    }
}

impl Drop for ExternalMapping<'_> {
    fn drop(&mut self) {
        self.buffer.set_blocked(false);
        self.cache.release(self.handle);
        trace!(slot = self.handle.raw(), "external mapping released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferFlags;
    use crate::format::PixelFormat;
    use crate::geometry::Rect;
    use crate::render;

    #[test]
    fn test_mapping_bumps_and_restores_refcount() {
        let ctx = DriverContext::new();
        let id = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        render::put_bits(&ctx, id, None, &vec![0u32; 64], 8).unwrap();
        let (handle, _) = ctx.surface(id).unwrap().buffer().unwrap();
        assert_eq!(ctx.cache().refcount(handle), Some(1));

        {
            let mapping = ExternalMapping::acquire(&ctx, id).unwrap();
            assert_eq!(ctx.cache().refcount(handle), Some(2));
            assert!(mapping.buffer().status().flags.contains(BufferFlags::BLOCKED));
        }
        assert_eq!(ctx.cache().refcount(handle), Some(1));
        let (_, buf) = ctx.surface(id).unwrap().buffer().unwrap();
        assert!(!buf.status().flags.contains(BufferFlags::BLOCKED));
    }

    #[test]
    fn test_write_while_mapped_forks() {
        let ctx = DriverContext::new();
        let id = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        render::put_bits(&ctx, id, None, &vec![0u32; 64], 8).unwrap();
        let (mapped, _) = ctx.surface(id).unwrap().buffer().unwrap();

        let _mapping = ExternalMapping::acquire(&ctx, id).unwrap();
        render::put_bits(&ctx, id, Some(Rect::new(0, 0, 1, 1)), &[7], 1).unwrap();

        // The mapped buffer kept its content; the surface moved on.
        let (current, _) = ctx.surface(id).unwrap().buffer().unwrap();
        assert_ne!(current, mapped);
        assert_eq!(ctx.cache().get(mapped).unwrap().pixel(0, 0), Some(0));
    }

    #[test]
    fn test_mapping_unrendered_surface_fails() {
        let ctx = DriverContext::new();
        let id = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        assert!(ExternalMapping::acquire(&ctx, id).is_err());
    }
}
