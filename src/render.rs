// SPDX-License-Identifier: MIT OR Apache-2.0

//! Copy-on-write render pipeline.
//!
//! Every pixel-producing operation runs through the same discipline before
//! touching memory: if the destination's buffer is shared (refcount >= 2),
//! fork a fresh buffer and write there; if exclusively owned, mutate in
//! place. A buffer that some other consumer (the scan-out worker included)
//! still references is therefore never written.
//!
//! The single most important optimization lives here too: a render request
//! identical to the last one recorded for the destination (same source
//! content version, same rectangles) performs zero pixel writes and merely
//! re-links the destination to the most recently produced buffer.
//! Consecutive video frames repeat the same composition constantly, so this
//! path dominates in practice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{trace, warn};

use crate::buffer::{fresh_generation, PixelBuffer, RenderRecord};
use crate::cache::CacheHandle;
use crate::context::DriverContext;
use crate::error::{Result, SurfaceError};
use crate::geometry::{Color, Rect};
use crate::surface::{Surface, SurfaceId};

/// Optional color/blend modulation accompanying a render request.
///
/// Modulation is accepted but not applied: the hardware path never consumed
/// it, so requests carrying it render unmodulated, with a one-shot warning.
/// It is deliberately excluded from the render-identity comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderOptions {
    /// Per-corner color modulation, RGBA in [0, 1].
    pub color: Option<[f32; 4]>,
    /// Request source-over blending instead of a straight copy.
    pub blend: bool,
}

impl RenderOptions {
    fn is_modulated(&self) -> bool {
        self.blend || self.color.is_some_and(|c| c != [1.0, 1.0, 1.0, 1.0])
    }
}

static MODULATION_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_modulation_ignored() {
    if !MODULATION_WARNED.swap(true, Ordering::Relaxed) {
        warn!("color/blend modulation is not supported; rendering unmodulated");
    }
}

/// Sourceless renders fill with opaque white.
const FILL_COLOR: Color = Color::WHITE;

/// Render `src` into `dest` over the given rectangles.
///
/// `dest_rect` defaults to the full destination, `src_rect` to the full
/// source. An empty destination rectangle is a deliberate no-op.
pub fn render(
    ctx: &DriverContext,
    dest: SurfaceId,
    dest_rect: Option<Rect>,
    src: Option<SurfaceId>,
    src_rect: Option<Rect>,
    opts: &RenderOptions,
) -> Result<()> {
    let dest_surface = ctx.surface(dest)?;
    let src_surface = match src {
        Some(id) => Some(ctx.surface(id)?),
        None => None,
    };
    if opts.is_modulated() {
        warn_modulation_ignored();
    }

    let d_rect = dest_rect.unwrap_or(Rect::full(dest_surface.width(), dest_surface.height()));
    if d_rect.is_empty() {
        return Ok(());
    }
    if !d_rect.within_bounds(dest_surface.width(), dest_surface.height()) {
        return Err(SurfaceError::InvalidParameter(format!(
            "destination rect {d_rect:?} outside {}x{} surface",
            dest_surface.width(),
            dest_surface.height()
        )));
    }

    if let Some(src_surface) = &src_surface {
        // Format conversion is out of scope for the blit path.
        if src_surface.format() != dest_surface.format() {
            return Err(SurfaceError::InvalidFormat(format!(
                "cannot render {:?} source into {:?} destination",
                src_surface.format(),
                dest_surface.format()
            )));
        }
    }

    // A source surface with no buffer yet has no content: treat as absent.
    let source = src_surface.as_ref().and_then(|s| s.buffer());
    let s_rect = match (&source, src_rect) {
        (Some((_, buf)), Some(rect)) => {
            if !rect.within_bounds(buf.width(), buf.height()) {
                return Err(SurfaceError::InvalidParameter(format!(
                    "source rect {rect:?} outside {}x{} surface",
                    buf.width(),
                    buf.height()
                )));
            }
            rect
        }
        (Some((_, buf)), None) => Rect::full(buf.width(), buf.height()),
        (None, _) => Rect::default(),
    };
    let src_generation = source.as_ref().map(|(_, buf)| buf.generation());
    let requested = RenderRecord {
        src_generation,
        dest_rect: d_rect,
        src_rect: s_rect,
    };

    let Some((cur_handle, cur_buf)) = dest_surface.buffer() else {
        // First render onto an unlinked destination.
        return match source {
            Some((src_handle, src_buf)) => {
                // Adopt the source buffer outright; a later divergent render
                // forks it.
                ctx.cache().retain(src_handle);
                if let Some(old) = dest_surface.relink(src_handle, src_buf) {
                    ctx.cache().release(old);
                }
                dest_surface.record_render(requested);
                trace!(surface = dest.raw(), slot = src_handle.raw(), "adopted source buffer");
                Ok(())
            }
            None => {
                let (handle, buffer) = ctx.get_free_buffer(
                    dest_surface.width(),
                    dest_surface.height(),
                    dest_surface.format(),
                )?;
                buffer.clear_if_needed(&d_rect);
                buffer.fill(&d_rect, FILL_COLOR);
                buffer.record_render(requested, fresh_generation());
                ctx.cache().retain(handle);
                if let Some(old) = dest_surface.relink(handle, buffer) {
                    ctx.cache().release(old);
                }
                dest_surface.record_render(requested);
                ctx.cache().set_recent(handle);
                Ok(())
            }
        };
    };

    // Identity fast path: same source content, same rectangles as the last
    // render onto this destination. Zero pixel writes; at most a relink to
    // the most recently produced buffer.
    if dest_surface.last_render() == Some(requested) {
        relink_to_recent(ctx, &dest_surface, cur_handle, &requested);
        return Ok(());
    }

    let target = acquire_writable(ctx, &dest_surface, cur_handle, &cur_buf)?;
    target.buffer.clear_if_needed(&d_rect);
    match &source {
        Some((_, src_buf)) => target.buffer.blit(&d_rect, src_buf, &s_rect),
        None => target.buffer.fill(&d_rect, FILL_COLOR),
    }
    let generation = src_generation.unwrap_or_else(fresh_generation);
    target.buffer.record_render(requested, generation);
    let produced = target.commit(ctx, &dest_surface);
    dest_surface.record_render(requested);
    ctx.cache().set_recent(produced);
    Ok(())
}

/// Copy caller pixels into a surface.
///
/// `rect` defaults to the full surface; an all-zero rectangle is a
/// deliberate skip, not an error. Follows the same fork-or-in-place
/// decision as `render`.
pub fn put_bits(
    ctx: &DriverContext,
    dest: SurfaceId,
    rect: Option<Rect>,
    pixels: &[u32],
    pitch: usize,
) -> Result<()> {
    let surface = ctx.surface(dest)?;
    let rect = rect.unwrap_or(Rect::full(surface.width(), surface.height()));
    if rect == Rect::default() {
        return Ok(());
    }
    if !rect.within_bounds(surface.width(), surface.height()) {
        return Err(SurfaceError::InvalidParameter(format!(
            "destination rect {rect:?} outside {}x{} surface",
            surface.width(),
            surface.height()
        )));
    }

    let target = match surface.buffer() {
        Some((handle, buffer)) => acquire_writable(ctx, &surface, handle, &buffer)?,
        None => {
            let (handle, buffer) =
                ctx.get_free_buffer(surface.width(), surface.height(), surface.format())?;
            WriteTarget {
                handle,
                buffer,
                fresh: true,
            }
        }
    };
    target.buffer.put_bits(&rect, pixels, pitch)?;
    let produced = target.commit(ctx, &surface);
    surface.invalidate_render_record();
    ctx.cache().set_recent(produced);
    Ok(())
}

/// A buffer cleared for writing, either the surface's own (exclusive) or a
/// freshly forked one that still has to be linked in.
struct WriteTarget {
    handle: CacheHandle,
    buffer: Arc<PixelBuffer>,
    fresh: bool,
}

impl WriteTarget {
    /// Link a forked buffer into the surface, releasing the old one exactly
    /// once. In-place targets are already linked.
    fn commit(self, ctx: &DriverContext, surface: &Surface) -> CacheHandle {
        if self.fresh {
            ctx.cache().retain(self.handle);
            if let Some(old) = surface.relink(self.handle, self.buffer) {
                ctx.cache().release(old);
            }
        }
        self.handle
    }
}

/// Fork-or-in-place decision. A shared buffer (refcount >= 2) is forked:
/// the previous dirty sub-rectangle is duplicated into a different buffer
/// and all writes go there. Allocation failure propagates with the old link
/// untouched.
///
/// The refcount read and the in-place write are two separate steps. Callers
/// must serialize render and display submission for a given surface; a
/// `display` retaining this handle between the two steps would see the
/// in-place mutation.
fn acquire_writable(
    ctx: &DriverContext,
    surface: &Surface,
    handle: CacheHandle,
    buffer: &Arc<PixelBuffer>,
) -> Result<WriteTarget> {
    let shared = ctx.cache().refcount(handle).unwrap_or(0) >= 2;
    if !shared {
        return Ok(WriteTarget {
            handle,
            buffer: Arc::clone(buffer),
            fresh: false,
        });
    }

    let (fork_handle, fork_buf) =
        ctx.get_free_buffer(surface.width(), surface.height(), surface.format())?;
    // Settle any stale recycled content before adopting the old dirty
    // region, so a later lazy clear cannot wipe the copy.
    fork_buf.clear();
    fork_buf.copy_dirty_from(buffer);
    trace!(
        from = handle.raw(),
        to = fork_handle.raw(),
        "copy-on-write fork"
    );
    Ok(WriteTarget {
        handle: fork_handle,
        buffer: fork_buf,
        fresh: true,
    })
}

/// Re-link the destination to the most recently produced buffer, if that
/// buffer demonstrably carries the same content. Pixel-free by construction.
fn relink_to_recent(
    ctx: &DriverContext,
    surface: &Surface,
    current: CacheHandle,
    requested: &RenderRecord,
) {
    let Some(recent) = ctx.cache().recent() else {
        return;
    };
    if recent == current {
        return;
    }
    let Some(recent_buf) = ctx.cache().get(recent) else {
        return;
    };
    // Only adopt a sibling that recorded the exact same render.
    if !recent_buf.matches(surface.width(), surface.height(), surface.format())
        || recent_buf.last_render() != Some(*requested)
    {
        return;
    }
    ctx.cache().retain(recent);
    if let Some(old) = surface.relink(recent, recent_buf) {
        ctx.cache().release(old);
    }
    trace!(from = current.raw(), to = recent.raw(), "render identity relink");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn ctx_with_surface(w: u32, h: u32) -> (DriverContext, SurfaceId) {
        let ctx = DriverContext::new();
        let id = ctx.create_surface(w, h, PixelFormat::Bgra32).unwrap();
        (ctx, id)
    }

    fn checkerboard(w: u32, h: u32) -> Vec<u32> {
        (0..w * h)
            .map(|i| if (i / w + i % w) % 2 == 0 { 0xff00_00ff } else { 0xffff_ffff })
            .collect()
    }

    #[test]
    fn test_sourceless_render_fills_white() {
        let (ctx, id) = ctx_with_surface(8, 8);
        render(&ctx, id, None, None, None, &RenderOptions::default()).unwrap();

        let (_, buf) = ctx.surface(id).unwrap().buffer().unwrap();
        assert_eq!(buf.pixel(0, 0), Some(0xffff_ffff));
        assert_eq!(buf.pixel(7, 7), Some(0xffff_ffff));
    }

    #[test]
    fn test_first_render_adopts_source_buffer() {
        let (ctx, dst) = ctx_with_surface(8, 8);
        let src = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        put_bits(&ctx, src, None, &checkerboard(8, 8), 8).unwrap();

        render(&ctx, dst, None, Some(src), None, &RenderOptions::default()).unwrap();

        let (src_handle, _) = ctx.surface(src).unwrap().buffer().unwrap();
        let (dst_handle, _) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(src_handle, dst_handle);
        assert_eq!(ctx.cache().refcount(src_handle), Some(2));
    }

    #[test]
    fn test_identical_render_performs_no_pixel_writes() {
        let (ctx, dst) = ctx_with_surface(8, 8);
        let src = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        put_bits(&ctx, src, None, &checkerboard(8, 8), 8).unwrap();

        let rect = Rect::new(0, 0, 8, 8);
        render(&ctx, dst, Some(rect), Some(src), Some(rect), &RenderOptions::default()).unwrap();
        // Adoption shares the buffer; force a divergence so dst owns a
        // rendered buffer with a recorded identity.
        render(&ctx, dst, Some(Rect::new(0, 0, 4, 4)), Some(src), Some(rect), &RenderOptions::default()).unwrap();

        let (_, buf) = ctx.surface(dst).unwrap().buffer().unwrap();
        let writes_before = buf.write_count();
        render(&ctx, dst, Some(Rect::new(0, 0, 4, 4)), Some(src), Some(rect), &RenderOptions::default()).unwrap();
        let (_, buf_after) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(buf_after.write_count(), writes_before);
    }

    #[test]
    fn test_identical_repeat_after_adoption_is_write_free() {
        let (ctx, dst) = ctx_with_surface(8, 8);
        let src = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        put_bits(&ctx, src, None, &checkerboard(8, 8), 8).unwrap();

        render(&ctx, dst, None, Some(src), None, &RenderOptions::default()).unwrap();
        let (adopted, buf) = ctx.surface(dst).unwrap().buffer().unwrap();
        let writes = buf.write_count();

        // Identical repeat right after adoption: no fork, no blit, same
        // shared buffer.
        render(&ctx, dst, None, Some(src), None, &RenderOptions::default()).unwrap();
        let (after, buf_after) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(after, adopted);
        assert_eq!(buf_after.write_count(), writes);
        assert_eq!(ctx.cache().refcount(adopted), Some(2));
    }

    #[test]
    fn test_render_identity_is_per_destination() {
        let (ctx, dst_a) = ctx_with_surface(8, 8);
        let dst_b = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        let src = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        put_bits(&ctx, src, None, &checkerboard(8, 8), 8).unwrap();

        render(&ctx, dst_a, None, Some(src), None, &RenderOptions::default()).unwrap();
        render(&ctx, dst_b, Some(Rect::new(0, 0, 4, 4)), Some(src), None, &RenderOptions::default()).unwrap();

        // The second destination's render must not disturb the first one's
        // recorded identity.
        let (handle_a, buf_a) = ctx.surface(dst_a).unwrap().buffer().unwrap();
        let writes = buf_a.write_count();
        render(&ctx, dst_a, None, Some(src), None, &RenderOptions::default()).unwrap();
        let (after_a, buf_after) = ctx.surface(dst_a).unwrap().buffer().unwrap();
        assert_eq!(after_a, handle_a);
        assert_eq!(buf_after.write_count(), writes);
    }

    #[test]
    fn test_put_bits_resets_render_identity() {
        let (ctx, dst) = ctx_with_surface(4, 4);
        render(&ctx, dst, None, None, None, &RenderOptions::default()).unwrap();
        assert!(ctx.surface(dst).unwrap().last_render().is_some());

        put_bits(&ctx, dst, None, &vec![3u32; 16], 4).unwrap();
        assert!(ctx.surface(dst).unwrap().last_render().is_none());

        // The overwritten pixels are not silently kept by the fast path.
        render(&ctx, dst, None, None, None, &RenderOptions::default()).unwrap();
        let (_, buf) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(buf.pixel(0, 0), Some(0xffff_ffff));
    }

    #[test]
    fn test_shared_buffer_forces_fork() {
        let (ctx, dst) = ctx_with_surface(8, 8);
        let src = ctx.create_surface(8, 8, PixelFormat::Bgra32).unwrap();
        put_bits(&ctx, src, None, &checkerboard(8, 8), 8).unwrap();
        render(&ctx, dst, None, Some(src), None, &RenderOptions::default()).unwrap();

        let (shared, _) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(ctx.cache().refcount(shared), Some(2));

        // Divergent write while shared: the destination must move to a
        // different buffer and the old one must drop to a single owner.
        put_bits(&ctx, dst, Some(Rect::new(0, 0, 2, 2)), &[0u32; 4], 2).unwrap();
        let (forked, _) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_ne!(forked, shared);
        assert_eq!(ctx.cache().refcount(shared), Some(1));
        assert_eq!(ctx.cache().refcount(forked), Some(1));
    }

    #[test]
    fn test_fork_copies_previous_dirty_content() {
        let (ctx, dst) = ctx_with_surface(4, 4);
        let src = ctx.create_surface(4, 4, PixelFormat::Bgra32).unwrap();
        put_bits(&ctx, src, None, &vec![0xaaaa_aaaa; 16], 4).unwrap();
        render(&ctx, dst, None, Some(src), None, &RenderOptions::default()).unwrap();

        // Shared buffer, so this put_bits forks; the untouched pixels must
        // carry over from the old buffer.
        put_bits(&ctx, dst, Some(Rect::new(0, 0, 1, 1)), &[0xbbbb_bbbb], 1).unwrap();
        let (_, buf) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(buf.pixel(0, 0), Some(0xbbbb_bbbb));
        assert_eq!(buf.pixel(3, 3), Some(0xaaaa_aaaa));
    }

    #[test]
    fn test_exclusive_buffer_mutated_in_place() {
        let (ctx, dst) = ctx_with_surface(4, 4);
        put_bits(&ctx, dst, None, &vec![1u32; 16], 4).unwrap();
        let (h1, _) = ctx.surface(dst).unwrap().buffer().unwrap();

        put_bits(&ctx, dst, None, &vec![2u32; 16], 4).unwrap();
        let (h2, buf) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(h1, h2);
        assert_eq!(buf.pixel(0, 0), Some(2));
    }

    #[test]
    fn test_put_bits_zero_rect_is_noop() {
        let (ctx, dst) = ctx_with_surface(4, 4);
        put_bits(&ctx, dst, Some(Rect::default()), &[], 0).unwrap();
        assert!(ctx.surface(dst).unwrap().buffer().is_none());
    }

    #[test]
    fn test_put_bits_rejects_out_of_bounds_rect() {
        let (ctx, dst) = ctx_with_surface(4, 4);
        let err = put_bits(&ctx, dst, Some(Rect::new(0, 0, 8, 8)), &[0u32; 64], 8);
        assert!(matches!(err, Err(SurfaceError::InvalidParameter(_))));
        // Validation failed before any buffer was attached.
        assert!(ctx.surface(dst).unwrap().buffer().is_none());
    }

    #[test]
    fn test_render_invalid_source_handle() {
        let (ctx, dst) = ctx_with_surface(4, 4);
        let stale = ctx.create_surface(4, 4, PixelFormat::Bgra32).unwrap();
        ctx.destroy_surface(stale).unwrap();
        assert!(matches!(
            render(&ctx, dst, None, Some(stale), None, &RenderOptions::default()),
            Err(SurfaceError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_render_rejects_format_mismatch() {
        let ctx = DriverContext::new();
        let dst = ctx.create_surface(4, 4, PixelFormat::Bgra32).unwrap();
        let src = ctx.create_surface(4, 4, PixelFormat::Rgba32).unwrap();
        assert!(matches!(
            render(&ctx, dst, None, Some(src), None, &RenderOptions::default()),
            Err(SurfaceError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_modulated_render_still_draws() {
        let (ctx, dst) = ctx_with_surface(4, 4);
        let opts = RenderOptions {
            color: Some([0.5, 0.5, 0.5, 1.0]),
            blend: true,
        };
        render(&ctx, dst, None, None, None, &opts).unwrap();
        let (_, buf) = ctx.surface(dst).unwrap().buffer().unwrap();
        assert_eq!(buf.pixel(0, 0), Some(0xffff_ffff));
    }
}
