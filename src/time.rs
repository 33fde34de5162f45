//! Relative coarse time.
//!
//! Item expiry is expressed in 32-bit seconds relative to process start,
//! so the clock only needs coarse (tick-level) resolution. The base instant
//! is captured on first use.

use std::sync::OnceLock;

use clocksource::coarse::Instant;

static BASE: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed since the process first read the clock.
#[inline]
pub fn now() -> u32 {
    let base = *BASE.get_or_init(Instant::now);
    Instant::now().duration_since(base).as_secs() as u32
}
