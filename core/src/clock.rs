//! Monotonic clock.
//!
//! A free-running quantum counter incremented by the periodic quantum timer
//! interrupt, paired with a wall-clock (seconds, nanoseconds) advanced by a
//! fixed `ns_per_quantum` each tick.
//!
//! Sampling the wall-clock outside the interrupt uses a two-read loop around
//! the quantum counter so that a tick landing mid-read cannot produce a torn
//! snapshot. The intra-quantum nanosecond fraction comes from a registered
//! provider backed by the timer hardware; before one is registered it reads
//! as zero, which only coarsens the clock to quantum granularity.
//!
//! Before `clock_init` is called the tick length defaults to 10 ms.

use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};

use vireo_abi::time::{
    ONE_SECOND_IN_NANOS, QUANTUMS_INFINITY, QuantumRounding, Quantums, TimeInterval,
};

/// Default quantum length until the platform supplies the real one.
pub const DEFAULT_NS_PER_QUANTUM: u32 = 10_000_000;

/// Longest delay that may be satisfied by busy-waiting. Anything longer has
/// to go through the scheduler.
const MAX_BUSY_DELAY_NANOS: i32 = 1_000_000;

static CURRENT_QUANTUM: AtomicI32 = AtomicI32::new(0);
static CURRENT_SECS: AtomicI32 = AtomicI32::new(0);
static CURRENT_NANOS: AtomicI32 = AtomicI32::new(0);
static NS_PER_QUANTUM: AtomicU32 = AtomicU32::new(DEFAULT_NS_PER_QUANTUM);

/// Provider of nanoseconds elapsed inside the current quantum, read from the
/// timer hardware. Null until the platform registers one.
static ELAPSED_NS_PROVIDER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Configure the quantum length. Called once during platform bring-up,
/// before the quantum timer interrupt is enabled.
pub fn clock_init(ns_per_quantum: u32) {
    NS_PER_QUANTUM.store(ns_per_quantum, Ordering::Relaxed);
    CURRENT_QUANTUM.store(0, Ordering::Relaxed);
    CURRENT_SECS.store(0, Ordering::Relaxed);
    CURRENT_NANOS.store(0, Ordering::Relaxed);
}

/// Register the timer-hardware callback that reports how many nanoseconds of
/// the current quantum have already elapsed.
pub fn clock_register_elapsed_ns_provider(provider: fn() -> i32) {
    ELAPSED_NS_PROVIDER.store(provider as *mut (), Ordering::Release);
}

fn elapsed_intra_quantum_ns() -> i32 {
    let raw = ELAPSED_NS_PROVIDER.load(Ordering::Acquire);
    if raw.is_null() {
        return 0;
    }
    // SAFETY: only ever stored from a valid `fn() -> i32`.
    let provider: fn() -> i32 = unsafe { core::mem::transmute(raw) };
    provider()
}

/// Advance the clock by one quantum. Called from the quantum timer
/// interrupt, before the scheduler's end-of-quantum handling.
pub fn clock_on_tick() {
    CURRENT_QUANTUM.fetch_add(1, Ordering::Release);

    let mut nanos =
        CURRENT_NANOS.load(Ordering::Relaxed) + NS_PER_QUANTUM.load(Ordering::Relaxed) as i32;
    if nanos >= ONE_SECOND_IN_NANOS {
        CURRENT_SECS.fetch_add(1, Ordering::Relaxed);
        nanos -= ONE_SECOND_IN_NANOS;
    }
    CURRENT_NANOS.store(nanos, Ordering::Release);
}

/// Current time in scheduler quantums.
#[inline]
pub fn clock_current_quantums() -> Quantums {
    CURRENT_QUANTUM.load(Ordering::Acquire)
}

/// Current wall-clock time.
///
/// Interrupt-safe: retries until the quantum counter is stable across the
/// whole read.
pub fn clock_current_time() -> TimeInterval {
    loop {
        let check_quantum = CURRENT_QUANTUM.load(Ordering::Acquire);
        let mut secs = CURRENT_SECS.load(Ordering::Relaxed);
        let mut nanos = CURRENT_NANOS.load(Ordering::Relaxed);

        nanos += elapsed_intra_quantum_ns();
        if nanos >= ONE_SECOND_IN_NANOS {
            secs += 1;
            nanos -= ONE_SECOND_IN_NANOS;
        }

        if CURRENT_QUANTUM.load(Ordering::Acquire) == check_quantum {
            return TimeInterval::new(secs, nanos);
        }
    }
}

/// Convert a time interval to quantums with the given rounding mode.
pub fn quantums_from_interval(ti: TimeInterval, rounding: QuantumRounding) -> Quantums {
    if ti == TimeInterval::INFINITY {
        return QUANTUMS_INFINITY;
    }

    let ns_per_quantum = NS_PER_QUANTUM.load(Ordering::Relaxed) as i64;
    let nanos = ti.as_nanos();
    let quants = nanos / ns_per_quantum;

    let quants = match rounding {
        QuantumRounding::TowardsZero => quants,
        QuantumRounding::AwayFromZero => {
            if quants * ns_per_quantum < nanos {
                quants + 1
            } else {
                quants
            }
        }
    };

    if quants >= QUANTUMS_INFINITY as i64 {
        QUANTUMS_INFINITY
    } else {
        quants as Quantums
    }
}

/// Convert quantums back to a time interval.
pub fn interval_from_quantums(quants: Quantums) -> TimeInterval {
    if quants == QUANTUMS_INFINITY {
        return TimeInterval::INFINITY;
    }

    let ns = quants as i64 * NS_PER_QUANTUM.load(Ordering::Relaxed) as i64;
    TimeInterval::from_nanos(ns)
}

/// Number of quantums in a quarter second, rounded away from zero.
pub fn quantums_per_quarter_second() -> Quantums {
    quantums_from_interval(
        TimeInterval::from_millis(250),
        QuantumRounding::AwayFromZero,
    )
}

/// Busy-wait until `deadline` if the remaining delay is short enough.
///
/// Returns true if the delay was performed here. Returns false if the delay
/// is too long to burn CPU on, in which case the caller should park through
/// the scheduler instead.
pub fn clock_delay_until(deadline: TimeInterval) -> bool {
    let start = clock_current_time();
    let delta = deadline.sub(start);

    if delta.secs > 0 || (delta.secs == 0 && delta.nanos > MAX_BUSY_DELAY_NANOS) {
        return false;
    }

    loop {
        if clock_current_time() >= deadline {
            return true;
        }
        core::hint::spin_loop();
    }
}
