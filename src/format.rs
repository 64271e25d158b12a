// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pixel formats accepted by the surface store.

use crate::error::{Result, SurfaceError};

/// Largest supported surface dimension per axis.
pub const MAX_DIMENSION: u32 = 8192;

/// 32-bit RGBA orderings the display hardware scans out directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 8-bit B, G, R, A channel order.
    #[default]
    Bgra32,
    /// 8-bit R, G, B, A channel order.
    Rgba32,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Bgra32 | Self::Rgba32 => 4,
        }
    }
}

/// Reject out-of-range dimensions before any allocation happens.
pub fn validate_dimensions(width: u32, height: u32) -> Result<()> {
    if width < 1 || width > MAX_DIMENSION || height < 1 || height > MAX_DIMENSION {
        return Err(SurfaceError::InvalidSize { width, height });
    }
    Ok(())
}
