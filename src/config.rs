//! Compile-time tunables.
//!
//! These mirror the build-time configuration of a typical firmware image:
//! change them here (or via a local patch) and rebuild. None of them are
//! meant to vary at runtime.

/// Size in bytes of the default work memory managed by [`crate::Heap`].
///
/// The allocator's control structure is carved out of this region, so the
/// usable heap is smaller; see [`crate::Tlsf::SIZE`].
pub const MEM_SIZE: usize = 1024;

/// Number of slots in the scoped temporary-buffer pool.
pub const MEM_BUF_MAX_NUM: usize = 16;

/// log2 of the number of second-level size subdivisions. Values of 4 or 5
/// are typical; larger values cost more control-structure memory.
pub const SL_INDEX_COUNT_LOG2: u32 = 5;

/// Length in milliseconds of the window over which the timer handler's idle
/// percentage is measured.
pub const IDLE_MEAS_PERIOD: u32 = 500;

/// Period in milliseconds assigned to timers created with
/// [`crate::Timers::create_basic`].
pub const DEF_PERIOD: u32 = 500;

/// Returned by [`crate::Timers::handler`] when no timer is scheduled to run.
pub const NO_TIMER_READY: u32 = 0xFFFF_FFFF;
