// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// Closed status set returned by every driver-core operation.
///
/// Ordering discipline: handle validity is checked first, then parameters,
/// then allocation. Resource failures are atomic - prior state is left
/// untouched. Display I/O failures are soft; the presentation worker logs
/// them and moves on.
#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("invalid handle: {0}")]
    InvalidHandle(u32),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid pixel format: {0}")]
    InvalidFormat(String),

    #[error("invalid size: {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("out of resources: {0}")]
    Resources(String),

    /// Kept for status-set completeness; no in-scope operation reports it
    /// (color/blend modulation is warned about and ignored instead).
    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("display device error: {0}")]
    Display(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SurfaceError>;
