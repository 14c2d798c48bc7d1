//! Nanosecond Timestamps
//!
//! All playback positions, record times, and cache block bounds are
//! integer nanoseconds. Floating point is never used for time: block
//! adjacency checks compare `end + 1ns == start` exactly, which a
//! float representation cannot guarantee.
//!
//! Arithmetic saturates instead of wrapping so that `start - 1ns` at
//! the epoch and `end + lookahead` near the horizon stay well defined.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A point in time as nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Time(u64);

impl Time {
    pub const MIN: Time = Time(0);
    pub const MAX: Time = Time(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Time(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Time(micros * 1_000)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Time(millis * 1_000_000)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Time(secs * 1_000_000_000)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Time(self.0.saturating_add(nanos))
    }

    pub const fn saturating_sub_nanos(self, nanos: u64) -> Self {
        Time(self.0.saturating_sub(nanos))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        self.saturating_add_nanos(duration_nanos(d))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        self.saturating_sub_nanos(duration_nanos(d))
    }

    /// Nanoseconds from `earlier` to `self`, saturating at zero.
    pub const fn nanos_since(self, earlier: Time) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}
