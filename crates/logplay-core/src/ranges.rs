//! Normalized Load-Progress Ranges
//!
//! Load progress is reported as fractions of the full log range so
//! consumers can render it without knowing absolute timestamps. An
//! empty cache reports `[{0,0}]`; a zero-duration log reports
//! `[{0,1}]` (a single instant is fully covered by any block that
//! contains it).

use serde::{Deserialize, Serialize};

/// A half-open-agnostic fraction range with `0 <= start <= end <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionRange {
    pub start: f64,
    pub end: f64,
}

impl FractionRange {
    pub fn new(start: f64, end: f64) -> Self {
        FractionRange { start, end }
    }
}

/// Merges contiguous runs of `true` flags into fraction ranges over
/// `flags.len()` equal slots. Used for bucket-granularity progress.
pub fn contiguous_fraction_ranges(flags: &[bool]) -> Vec<FractionRange> {
    let len = flags.len();
    if len == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &loaded) in flags.iter().enumerate() {
        match (loaded, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(s)) => {
                out.push(FractionRange::new(s as f64 / len as f64, i as f64 / len as f64));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = run_start {
        out.push(FractionRange::new(s as f64 / len as f64, 1.0));
    }
    out
}
