// SPDX-License-Identifier: MIT OR Apache-2.0

//! Driver context: explicit, constructed core state.
//!
//! All cache and handle-table state lives here rather than in process-wide
//! statics, so a context can be created and torn down per device instance
//! (and per unit test) with no global side effects.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::PixelBuffer;
use crate::cache::{CacheHandle, CacheStats, SlotCache};
use crate::error::{Result, SurfaceError};
use crate::format::{self, PixelFormat};
use crate::handles::HandleTable;
use crate::surface::{Surface, SurfaceId, SurfaceStatus};

pub struct DriverContext {
    surfaces: HandleTable<Arc<Surface>>,
    cache: SlotCache<Arc<PixelBuffer>>,
}

impl DriverContext {
    pub fn new() -> Self {
        Self {
            surfaces: HandleTable::new(),
            cache: SlotCache::new(),
        }
    }

    /// Create a logical surface. The physical buffer is attached lazily on
    /// the first write or render.
    pub fn create_surface(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<SurfaceId> {
        format::validate_dimensions(width, height)?;
        let surface = Arc::new(Surface::new(width, height, format));
        let id = self.surfaces.create(surface);
        debug!(surface = id.raw(), width, height, "surface created");
        Ok(id)
    }

    /// Destroy a logical surface, releasing its buffer reference. The
    /// physical buffer is reclaimed once no other consumer holds it.
    pub fn destroy_surface(&self, id: SurfaceId) -> Result<()> {
        let surface = self
            .surfaces
            .destroy(id)
            .ok_or(SurfaceError::InvalidHandle(id.raw()))?;
        if let Some(handle) = surface.unlink() {
            self.cache.release(handle);
        }
        debug!(surface = id.raw(), "surface destroyed");
        Ok(())
    }

    /// Look up a surface by id.
    pub fn surface(&self, id: SurfaceId) -> Result<Arc<Surface>> {
        self.surfaces
            .get(id)
            .ok_or(SurfaceError::InvalidHandle(id.raw()))
    }

    /// Obtain an idle buffer with matching geometry from the cache, or
    /// allocate a fresh one. Reuse is checked first - it is the dominant
    /// cost-saving path.
    ///
    /// The returned slot has refcount 0; callers must immediately `retain`
    /// what they intend to keep.
    pub fn get_free_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(CacheHandle, Arc<PixelBuffer>)> {
        if let Some(handle) = self.cache.find(|b| b.matches(width, height, format)) {
            if let Some(buffer) = self.cache.get(handle) {
                debug!(slot = handle.raw(), "reusing idle buffer");
                // Recycled content is stale outside its old dirty rect.
                buffer.mark_needs_clear();
                return Ok((handle, buffer));
            }
        }

        let buffer = Arc::new(PixelBuffer::new(width, height, format)?);
        let handle = self.cache.create(Arc::clone(&buffer))?;
        debug!(slot = handle.raw(), width, height, "allocated new buffer");
        Ok((handle, buffer))
    }

    /// Block until `id` leaves the presentation pipeline; returns the
    /// timestamp of its most recent presentation.
    pub fn block_until_idle(&self, id: SurfaceId) -> Result<u64> {
        Ok(self.surface(id)?.wait_idle())
    }

    /// Current display status and first-presentation time of a surface.
    pub fn query_status(&self, id: SurfaceId) -> Result<(SurfaceStatus, u64)> {
        Ok(self.surface(id)?.status())
    }

    pub fn cache(&self) -> &SlotCache<Arc<PixelBuffer>> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl Default for DriverContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("surfaces", &self.surfaces.len())
            .field("cache", &self.cache_stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_surface_validates_size() {
        let ctx = DriverContext::new();
        assert!(ctx.create_surface(0, 64, PixelFormat::Bgra32).is_err());
        assert!(ctx.create_surface(64, 64, PixelFormat::Bgra32).is_ok());
    }

    #[test]
    fn test_destroy_stale_surface_fails_softly() {
        let ctx = DriverContext::new();
        let id = ctx.create_surface(64, 64, PixelFormat::Bgra32).unwrap();
        ctx.destroy_surface(id).unwrap();
        assert!(matches!(
            ctx.destroy_surface(id),
            Err(SurfaceError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_get_free_buffer_prefers_idle_match() {
        let ctx = DriverContext::new();
        let (h1, _b1) = ctx.get_free_buffer(64, 64, PixelFormat::Bgra32).unwrap();
        // Idle (refcount 0): the same slot is handed out again.
        let (h2, _b2) = ctx.get_free_buffer(64, 64, PixelFormat::Bgra32).unwrap();
        assert_eq!(h1, h2);

        // Busy slots are never reused.
        ctx.cache().retain(h1);
        let (h3, _b3) = ctx.get_free_buffer(64, 64, PixelFormat::Bgra32).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_get_free_buffer_mismatched_geometry_replaces_idle_slot() {
        let ctx = DriverContext::new();
        let (h1, _b1) = ctx.get_free_buffer(64, 64, PixelFormat::Bgra32).unwrap();
        // No idle match: a fresh buffer is allocated, physically reusing
        // the idle slot rather than growing the cache.
        let (h2, b2) = ctx.get_free_buffer(32, 32, PixelFormat::Bgra32).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(b2.width(), 32);
        assert_eq!(ctx.cache_stats().capacity, 1);
    }

    #[test]
    fn test_query_status_on_fresh_surface() {
        let ctx = DriverContext::new();
        let id = ctx.create_surface(64, 64, PixelFormat::Bgra32).unwrap();
        assert_eq!(
            ctx.query_status(id).unwrap(),
            (SurfaceStatus::Idle, 0)
        );
        assert_eq!(ctx.block_until_idle(id).unwrap(), 0);
    }
}
