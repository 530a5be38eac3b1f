//! A tiny cooperative runtime for bare-metal targets, built from two tightly
//! coupled services that share a single fixed memory region:
//!
//!  - **A TLSF (Two-Level Segregated Fit) dynamic memory allocator¹.**
//!    Allocation, deallocation and aligned allocation complete in constant
//!    time with low fragmentation, making the heap usable from latency
//!    sensitive code. The control structure lives *inside* the managed
//!    region, so a single `static` buffer is all the memory the runtime
//!    ever touches.
//!
//!  - **A cooperative timer scheduler.** Periodic callbacks are multiplexed
//!    onto a millisecond monotonic tick. Callbacks may freely create and
//!    delete timers — including the one currently executing — and the
//!    dispatch loop recovers by restarting its pass.
//!
//!  - **This crate supports `#![no_std]`.** It is written for single-core
//!    MCU firmware; the only concurrency it tolerates is the tick counter
//!    being incremented from an interrupt (see [`Tick`]).
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004.</sub>
//!
//! # Examples
//!
//! ```rust
//! use core::mem::MaybeUninit;
//! use tickos::{Heap, Tick, Timers};
//!
//! // The work memory. `u32` elements keep the region word aligned.
//! let pool = Box::leak(Box::new([MaybeUninit::<u32>::uninit(); 256]));
//!
//! let mut heap = Heap::init(pool).unwrap();
//! let tick = Tick::new();
//! let mut timers = Timers::new();
//!
//! fn beat(_ctx: &mut tickos::TimerCtx<'_>) {
//!     // runs every 100 ms
//! }
//! let _beat = timers.create(&mut heap, &tick, Some(beat), 100, core::ptr::null_mut());
//!
//! // Platform glue: `tick.inc(1)` from a 1 ms interrupt, and the superloop
//! // calls the handler, sleeping for the returned number of milliseconds.
//! tick.inc(1);
//! let _delay_ms = timers.handler(&mut heap, &tick);
//! ```
//!
//! # Concurrency model
//!
//! Single-threaded cooperative. Every API here assumes the caller has
//! exclusive access; nothing blocks or suspends. The sole exception is
//! [`Tick::inc`], which may run in interrupt context concurrently with
//! [`Tick::now`] — the reader recovers from torn reads with a flag-based
//! retry loop instead of requiring atomic read-modify-write support.
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod heap;
pub mod ll;
pub mod tick;
pub mod timer;
pub mod tlsf;
mod utils;

pub use self::{
    heap::{Heap, MemMonitor},
    ll::LinkedList,
    tick::Tick,
    timer::{Timer, TimerCb, TimerCtx, Timers},
    tlsf::Tlsf,
};

/// Result of a runtime self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Res {
    /// The checked object is corrupted or an operation failed.
    Inv = 0,
    /// The checked object is consistent.
    Ok = 1,
}
