//! Monotonic-clock time types.
//!
//! `TimeInterval` is a (seconds, nanoseconds) pair with `0 <= nanos < 1e9`
//! for all proper values. The infinity sentinels deliberately carry an
//! out-of-range nanosecond field so that no proper value ever compares equal
//! to them. Arithmetic saturates to the signed infinities on overflow.
//!
//! `Quantums` counts scheduler ticks. Conversion between the two lives in
//! the core clock module because it depends on the configured tick length.

pub const ONE_SECOND_IN_NANOS: i32 = 1_000_000_000;

/// Scheduler ticks. Monotonic, non-negative for all proper values.
pub type Quantums = i32;

/// Sentinel quantum value meaning "never".
pub const QUANTUMS_INFINITY: Quantums = i32::MAX;

/// Rounding mode for interval-to-quantum conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantumRounding {
    TowardsZero,
    AwayFromZero,
}

/// A time interval or absolute point on the monotonic timeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeInterval {
    pub secs: i32,
    pub nanos: i32,
}

impl TimeInterval {
    pub const ZERO: TimeInterval = TimeInterval { secs: 0, nanos: 0 };

    /// Larger than every proper interval.
    pub const INFINITY: TimeInterval = TimeInterval {
        secs: i32::MAX,
        nanos: ONE_SECOND_IN_NANOS,
    };

    /// Smaller than every proper interval.
    pub const NEG_INFINITY: TimeInterval = TimeInterval {
        secs: i32::MIN,
        nanos: ONE_SECOND_IN_NANOS,
    };

    #[inline]
    pub const fn new(secs: i32, nanos: i32) -> TimeInterval {
        TimeInterval { secs, nanos }
    }

    #[inline]
    pub const fn from_secs(secs: i32) -> TimeInterval {
        TimeInterval { secs, nanos: 0 }
    }

    #[inline]
    pub const fn from_millis(millis: i32) -> TimeInterval {
        TimeInterval {
            secs: millis / 1000,
            nanos: (millis % 1000) * 1_000_000,
        }
    }

    #[inline]
    pub const fn from_micros(micros: i32) -> TimeInterval {
        TimeInterval {
            secs: micros / 1_000_000,
            nanos: (micros % 1_000_000) * 1000,
        }
    }

    #[inline]
    pub const fn from_nanos(nanos: i64) -> TimeInterval {
        TimeInterval {
            secs: (nanos / ONE_SECOND_IN_NANOS as i64) as i32,
            nanos: (nanos % ONE_SECOND_IN_NANOS as i64) as i32,
        }
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.secs < 0 || self.nanos < 0
    }

    #[inline]
    pub fn is_infinite(&self) -> bool {
        *self == TimeInterval::INFINITY || *self == TimeInterval::NEG_INFINITY
    }

    /// Total nanoseconds as a wide integer. Only meaningful for proper values.
    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.secs as i64 * ONE_SECOND_IN_NANOS as i64 + self.nanos as i64
    }

    /// Saturating addition. Overflow yields the infinity whose sign matches
    /// the operands.
    pub fn add(self, other: TimeInterval) -> TimeInterval {
        let mut secs = self.secs.wrapping_add(other.secs);
        let mut nanos = self.nanos + other.nanos;
        if nanos >= ONE_SECOND_IN_NANOS {
            secs = secs.wrapping_add(1);
            nanos -= ONE_SECOND_IN_NANOS;
        }

        if (self.secs >= 0 && other.secs >= 0 && secs < 0)
            || (self.secs < 0 && other.secs < 0 && secs >= 0)
        {
            return if self.is_negative() && other.is_negative() {
                TimeInterval::NEG_INFINITY
            } else {
                TimeInterval::INFINITY
            };
        }

        TimeInterval { secs, nanos }
    }

    /// Saturating subtraction, `self - other`.
    pub fn sub(self, other: TimeInterval) -> TimeInterval {
        let mut ti;

        if self > other {
            ti = TimeInterval {
                secs: self.secs.wrapping_sub(other.secs),
                nanos: self.nanos - other.nanos,
            };
            if ti.nanos < 0 {
                ti.nanos += ONE_SECOND_IN_NANOS;
                ti.secs = ti.secs.wrapping_sub(1);
            }
        } else {
            // Swap the operands and negate the result.
            ti = TimeInterval {
                secs: other.secs.wrapping_sub(self.secs),
                nanos: other.nanos - self.nanos,
            };
            if ti.nanos < 0 {
                ti.nanos += ONE_SECOND_IN_NANOS;
                ti.secs = ti.secs.wrapping_sub(1);
            }
            if ti.secs != 0 {
                ti.secs = -ti.secs;
            } else {
                ti.nanos = -ti.nanos;
            }
        }

        if (self.secs < 0 && other.secs >= 0 && ti.secs >= 0)
            || (self.secs >= 0 && other.secs < 0 && ti.secs < 0)
        {
            return if self.is_negative() && other.is_negative() {
                TimeInterval::NEG_INFINITY
            } else {
                TimeInterval::INFINITY
            };
        }

        ti
    }
}
