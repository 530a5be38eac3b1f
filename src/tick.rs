//! The millisecond system tick.
//!
//! The platform increments the counter from a periodic interrupt (or an RTOS
//! tick hook); everything else in this crate only ever reads it. On targets
//! without atomic read-modify-write instructions a 32-bit counter cannot be
//! updated and read atomically with respect to an interrupt, so the reader
//! uses a flag-based retry loop: the writer clears a flag the reader sets,
//! and the reader repeats until it observes an uninterrupted cycle.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};

/// Monotonic millisecond counter. Wraps at 2³².
///
/// [`Tick::inc`] is the only method intended to run in interrupt context;
/// all orderings are relaxed because the retry loop in [`Tick::now`], not
/// the memory ordering, provides the torn-read recovery.
#[derive(Debug, Default)]
pub struct Tick {
    sys_time: AtomicU32,
    irq_flag: AtomicBool,
}

impl Tick {
    pub const fn new() -> Self {
        Self {
            sys_time: AtomicU32::new(0),
            irq_flag: AtomicBool::new(false),
        }
    }

    /// Advance the counter by `period_ms` milliseconds.
    ///
    /// Call this at a regular cadence, typically from a 1 ms timer
    /// interrupt.
    pub fn inc(&self, period_ms: u32) {
        self.irq_flag.store(false, Relaxed);
        let t = self.sys_time.load(Relaxed).wrapping_add(period_ms);
        self.sys_time.store(t, Relaxed);
    }

    /// Milliseconds elapsed since start up.
    pub fn now(&self) -> u32 {
        loop {
            self.irq_flag.store(true, Relaxed);
            let result = self.sys_time.load(Relaxed);
            // A concurrent `inc` cleared the flag; the value read may be
            // torn, read again.
            if self.irq_flag.load(Relaxed) {
                return result;
            }
        }
    }

    /// Milliseconds elapsed since `prev_tick` (a previous [`Tick::now`]
    /// value), accounting for counter wraparound.
    pub fn elapsed(&self, prev_tick: u32) -> u32 {
        self.now().wrapping_sub(prev_tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let tick = Tick::new();
        assert_eq!(tick.now(), 0);
        assert_eq!(tick.elapsed(0), 0);
    }

    #[test]
    fn accumulates_increments() {
        let tick = Tick::new();
        tick.inc(1);
        tick.inc(1);
        tick.inc(5);
        assert_eq!(tick.now(), 7);
        assert_eq!(tick.elapsed(2), 5);
    }

    #[test]
    fn elapsed_handles_wraparound() {
        let tick = Tick::new();
        tick.inc(u32::MAX - 4); // just below the wrap point
        let before = tick.now();
        tick.inc(10); // wraps
        assert_eq!(tick.elapsed(before), 10);
    }
}
