// SPDX-License-Identifier: MIT OR Apache-2.0

//! Monotonic timebase for presentation timestamps.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the process timebase epoch.
///
/// Monotonically increasing. All `earliest_presentation_time` values and
/// recorded presentation timestamps share this epoch.
#[inline]
pub fn now_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Distance from now to a target timestamp, zero if the target has passed.
#[inline]
pub fn until(target_ns: u64) -> Duration {
    Duration::from_nanos(target_ns.saturating_sub(now_ns()))
}
