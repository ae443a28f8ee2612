//! Simulated time.
//!
//! Every timestamp and duration inside the engine is a [`SimTime`]: a count
//! of centiseconds held as Q32.32 fixed point. Unit-tagged values only exist
//! at the edges (model files, display) and are converted with
//! [`to_canonical`] / [`from_canonical`]. Both conversions scale the raw bits
//! by an integer factor, so a round trip through the same unit is exact.

use fixed::types::I32F32;
use serde::{Deserialize, Serialize};

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
pub type Fixed64 = I32F32;

/// A point in, or a span of, simulated time. Canonical unit: centiseconds.
pub type SimTime = Fixed64;

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// The units a duration may be expressed in outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Seconds,
    Centiseconds,
}

impl TimeUnit {
    /// How many canonical units (centiseconds) make one of this unit.
    pub const fn factor(self) -> i64 {
        match self {
            TimeUnit::Seconds => 100,
            TimeUnit::Centiseconds => 1,
        }
    }

    /// Short display suffix.
    pub const fn symbol(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "s",
            TimeUnit::Centiseconds => "cs",
        }
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Convert a unit-tagged value into canonical time. `None` on overflow.
#[must_use]
pub fn to_canonical(value: Fixed64, unit: TimeUnit) -> Option<SimTime> {
    value.checked_mul_int(unit.factor())
}

/// Convert canonical time back into the given unit.
pub fn from_canonical(duration: SimTime, unit: TimeUnit) -> Fixed64 {
    // The factor is never zero, so this cannot fail.
    duration / unit.factor()
}

/// Re-express a value from one unit in another. `None` on overflow.
#[must_use]
pub fn convert(value: Fixed64, from: TimeUnit, to: TimeUnit) -> Option<Fixed64> {
    to_canonical(value, from).map(|t| from_canonical(t, to))
}

/// Convert a float in `unit` into canonical time. Use at load time only.
///
/// The float is scaled before it is quantized, so `0.1` seconds becomes
/// exactly ten centiseconds. Non-finite or out-of-range values yield `None`.
#[must_use]
pub fn from_f64(value: f64, unit: TimeUnit) -> Option<SimTime> {
    if !value.is_finite() {
        return None;
    }
    SimTime::checked_from_num(value * unit.factor() as f64)
}

/// Canonical time expressed as a float in `unit`. Display and statistics only.
pub fn to_f64(duration: SimTime, unit: TimeUnit) -> f64 {
    duration.to_num::<f64>() / unit.factor() as f64
}

/// Shorthand for building durations in seconds (tests, fixtures).
pub fn seconds(value: f64) -> SimTime {
    from_f64(value, TimeUnit::Seconds).unwrap_or(SimTime::MAX)
}

/// Shorthand for building durations in centiseconds.
pub fn centiseconds(value: f64) -> SimTime {
    from_f64(value, TimeUnit::Centiseconds).unwrap_or(SimTime::MAX)
}

/// Human-readable rendering, e.g. `"1.50 s"`.
pub fn format_time(duration: SimTime, unit: TimeUnit) -> String {
    format!("{:.2} {}", to_f64(duration, unit), unit.symbol())
}
