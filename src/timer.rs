//! The cooperative timer scheduler.
//!
//! Timers live in a linked list of heap-allocated nodes and are dispatched
//! by [`Timers::handler`], which external code calls from its superloop.
//! Callbacks run synchronously and receive a [`TimerCtx`] giving them full
//! access to the scheduler, so they can create and delete timers — including
//! the one currently executing. The dispatch loop detects such mutations and
//! restarts its pass instead of following a prefetched pointer into freed
//! memory.
//!
//! Timers fire in list order. New timers are inserted at the head, so a
//! timer created from a callback can fire within the same handler pass.

use core::ptr::NonNull;

use crate::{config, heap::Heap, ll::LinkedList, tick::Tick};

/// A timer callback. State travels through the timer's `user_data`.
pub type TimerCb = fn(&mut TimerCtx<'_>);

/// A periodic timer.
///
/// `repeat_count` controls the lifetime: `-1` fires forever, `n > 0` fires
/// `n` more times, and `0` marks the timer dead — the scheduler deletes it
/// on its next visit.
pub struct Timer {
    period: u32,
    last_run: u32,
    cb: Option<TimerCb>,
    user_data: *mut (),
    repeat_count: i32,
    paused: bool,
}

impl Timer {
    /// How often the timer runs, in milliseconds.
    pub fn period(&self) -> u32 {
        self.period
    }

    /// Tick timestamp of the last firing (or of creation).
    pub fn last_run(&self) -> u32 {
        self.last_run
    }

    pub fn repeat_count(&self) -> i32 {
        self.repeat_count
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn user_data(&self) -> *mut () {
        self.user_data
    }
}

/// What a callback sees while it executes: the scheduler, the heap and the
/// tick it may need, plus the identity of the firing timer.
pub struct TimerCtx<'a> {
    pub timers: &'a mut Timers,
    pub heap: &'a mut Heap,
    pub tick: &'a Tick,
    timer: NonNull<Timer>,
    deleted_self: bool,
}

impl TimerCtx<'_> {
    /// The currently executing timer.
    pub fn timer(&self) -> NonNull<Timer> {
        self.timer
    }

    pub fn user_data(&self) -> *mut () {
        // Safety: the scheduler guarantees the timer is live while its
        //         callback runs.
        unsafe { (*self.timer.as_ptr()).user_data }
    }

    /// Delete the currently executing timer. Further calls are no-ops.
    pub fn delete_self(&mut self) {
        if self.deleted_self {
            return;
        }
        self.deleted_self = true;
        // Safety: the timer is live and linked until this first deletion.
        unsafe {
            let timer = self.timer;
            self.timers.delete(&mut *self.heap, timer);
        }
    }
}

/// The scheduler state: the timer list plus dispatch bookkeeping.
pub struct Timers {
    ll: LinkedList,
    run: bool,
    idle_last: u8,
    timer_deleted: bool,
    timer_created: bool,
    act: Option<NonNull<Timer>>,
    already_running: bool,
    busy_time: u32,
    idle_period_start: u32,
    run_in_period_last: u32,
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers {
    /// An empty scheduler with timer handling enabled.
    pub const fn new() -> Self {
        Self {
            ll: LinkedList::new(core::mem::size_of::<Timer>() as u32),
            run: true,
            idle_last: 0,
            timer_deleted: false,
            timer_created: false,
            act: None,
            already_running: false,
            busy_time: 0,
            idle_period_start: 0,
            run_in_period_last: 0,
        }
    }

    /// Dispatch all due timers and return the number of milliseconds until
    /// the handler should run again ([`config::NO_TIMER_READY`] when no
    /// timer is scheduled).
    ///
    /// A reentrant invocation — a callback calling back into the handler —
    /// returns 1 immediately, as does a disabled scheduler (see
    /// [`Timers::enable`]).
    pub fn handler(&mut self, heap: &mut Heap, tick: &Tick) -> u32 {
        if self.already_running {
            return 1;
        }
        self.already_running = true;

        if !self.run {
            self.already_running = false;
            return 1;
        }

        let handler_start = tick.now();

        // Run every timer from the list. A callback creating or deleting
        // timers invalidates the walk (even the prefetched `next` may be
        // gone), so the pass restarts until one completes undisturbed.
        loop {
            self.timer_deleted = false;
            self.timer_created = false;
            let mut mutated = false;

            self.act = self.ll.head().map(NonNull::cast);
            while let Some(timer) = self.act {
                // The timer might delete itself; fetch the successor first.
                // Safety: `timer` is a node of the timer list.
                let next = unsafe { self.ll.next(timer.cast()) }.map(NonNull::cast);

                if self.timer_exec(heap, tick, timer) && (self.timer_created || self.timer_deleted)
                {
                    mutated = true;
                    break;
                }

                self.act = next;
            }

            if !mutated {
                break;
            }
        }
        self.act = None;

        let mut time_till_next = config::NO_TIMER_READY;
        let mut node = self.ll.head();
        while let Some(n) = node {
            let timer = n.cast::<Timer>();
            // Safety: every node in the list is a live timer.
            unsafe {
                if !(*timer.as_ptr()).paused {
                    let delay = self.time_remaining(tick, timer);
                    if delay < time_till_next {
                        time_till_next = delay;
                    }
                }
                node = self.ll.next(n);
            }
        }

        self.busy_time = self.busy_time.wrapping_add(tick.elapsed(handler_start));
        let idle_period_time = tick.elapsed(self.idle_period_start);
        if idle_period_time >= config::IDLE_MEAS_PERIOD {
            let busy_pct = ((self.busy_time as u64 * 100) / idle_period_time as u64) as u32;
            self.idle_last = if busy_pct > 100 {
                0
            } else {
                (100 - busy_pct) as u8
            };
            self.busy_time = 0;
            self.idle_period_start = tick.now();
        }

        self.already_running = false;
        time_till_next
    }

    /// Rate-limited [`Timers::handler`]: runs it at most once per `ms`
    /// milliseconds, returning 1 in between. Simplifies porting to
    /// superloops and OS threads alike.
    pub fn handler_run_in_period(&mut self, heap: &mut Heap, tick: &Tick, ms: u32) -> u32 {
        let curr_tick = tick.now();
        if curr_tick.wrapping_sub(self.run_in_period_last) >= ms {
            self.run_in_period_last = curr_tick;
            self.handler(heap, tick)
        } else {
            1
        }
    }

    /// Create a timer firing every `period` milliseconds, repeating forever
    /// until deleted or reconfigured. The new timer goes to the head of the
    /// list. Returns `None` when the heap is exhausted.
    pub fn create(
        &mut self,
        heap: &mut Heap,
        tick: &Tick,
        cb: Option<TimerCb>,
        period: u32,
        user_data: *mut (),
    ) -> Option<NonNull<Timer>> {
        let node = self.ll.insert_head(heap)?;
        let timer = node.cast::<Timer>();

        // Safety: the node payload is `size_of::<Timer>()` bytes of fresh,
        //         suitably aligned storage.
        unsafe {
            timer.as_ptr().write(Timer {
                period,
                last_run: tick.now(),
                cb,
                user_data,
                repeat_count: -1,
                paused: false,
            });
        }

        self.timer_created = true;
        Some(timer)
    }

    /// Create an idle timer with [`config::DEF_PERIOD`] and no callback; set
    /// at least a callback and a period before relying on it.
    pub fn create_basic(&mut self, heap: &mut Heap, tick: &Tick) -> Option<NonNull<Timer>> {
        self.create(heap, tick, None, config::DEF_PERIOD, core::ptr::null_mut())
    }

    /// Delete a timer and release its memory.
    ///
    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler; it is dangling
    /// afterwards.
    pub unsafe fn delete(&mut self, heap: &mut Heap, timer: NonNull<Timer>) {
        self.ll.remove(timer.cast());
        self.timer_deleted = true;

        LinkedList::free_node(heap, timer.cast());
    }

    /// Suspend firing without touching the timer's schedule.
    ///
    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler.
    pub unsafe fn pause(&mut self, timer: NonNull<Timer>) {
        (*timer.as_ptr()).paused = true;
    }

    /// Undo [`Timers::pause`].
    ///
    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler.
    pub unsafe fn resume(&mut self, timer: NonNull<Timer>) {
        (*timer.as_ptr()).paused = false;
    }

    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler.
    pub unsafe fn set_callback(&mut self, timer: NonNull<Timer>, cb: Option<TimerCb>) {
        (*timer.as_ptr()).cb = cb;
    }

    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler.
    pub unsafe fn set_period(&mut self, timer: NonNull<Timer>, period: u32) {
        (*timer.as_ptr()).period = period;
    }

    /// `-1` repeats forever, `0` stops the timer (it is deleted on the
    /// scheduler's next visit), `n > 0` fires `n` more times.
    ///
    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler.
    pub unsafe fn set_repeat_count(&mut self, timer: NonNull<Timer>, repeat_count: i32) {
        (*timer.as_ptr()).repeat_count = repeat_count;
    }

    /// Make the timer due immediately, skipping the rest of its period.
    ///
    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler.
    pub unsafe fn ready(&mut self, tick: &Tick, timer: NonNull<Timer>) {
        let period = (*timer.as_ptr()).period;
        (*timer.as_ptr()).last_run = tick.now().wrapping_sub(period).wrapping_sub(1);
    }

    /// Restart the timer's period from now.
    ///
    /// # Safety
    ///
    /// `timer` must be a live timer of this scheduler.
    pub unsafe fn reset(&mut self, tick: &Tick, timer: NonNull<Timer>) {
        (*timer.as_ptr()).last_run = tick.now();
    }

    /// Enable or suspend the whole scheduler.
    pub fn enable(&mut self, en: bool) {
        self.run = en;
    }

    /// Idle percentage of the last measurement window
    /// ([`config::IDLE_MEAS_PERIOD`]).
    pub fn idle(&self) -> u8 {
        self.idle_last
    }

    /// Iterate the timer list: `None` yields the head, a previous return
    /// value yields its successor.
    ///
    /// # Safety
    ///
    /// A `Some` argument must be a live timer of this scheduler.
    pub unsafe fn next_timer(&self, timer: Option<NonNull<Timer>>) -> Option<NonNull<Timer>> {
        match timer {
            None => self.ll.head().map(NonNull::cast),
            Some(t) => self.ll.next(t.cast()).map(NonNull::cast),
        }
    }

    /// Execute `timer` if it is due. Returns whether it was executed.
    fn timer_exec(&mut self, heap: &mut Heap, tick: &Tick, timer: NonNull<Timer>) -> bool {
        // Safety: the handler only passes live, linked timers.
        unsafe {
            if (*timer.as_ptr()).paused {
                return false;
            }

            let mut executed = false;
            if self.time_remaining(tick, timer) == 0 {
                // Decrement the repeat count before running the callback: if
                // the callback deletes timers, the count is already burned
                // and a stopped timer gets collected on the next round.
                let original_repeat_count = (*timer.as_ptr()).repeat_count;
                if original_repeat_count > 0 {
                    (*timer.as_ptr()).repeat_count -= 1;
                }
                (*timer.as_ptr()).last_run = tick.now();

                let cb = (*timer.as_ptr()).cb;
                if let Some(cb) = cb {
                    if original_repeat_count != 0 {
                        let mut ctx = TimerCtx {
                            timers: &mut *self,
                            heap: &mut *heap,
                            tick,
                            timer,
                            deleted_self: false,
                        };
                        cb(&mut ctx);
                    }
                }
                executed = true;
            }

            // The timer may have deleted itself; only touch it again when
            // no deletion happened at all.
            if !self.timer_deleted && (*timer.as_ptr()).repeat_count == 0 {
                self.delete(heap, timer);
            }

            executed
        }
    }

    /// Milliseconds until `timer` is due; 0 when it must run now.
    unsafe fn time_remaining(&self, tick: &Tick, timer: NonNull<Timer>) -> u32 {
        let elapsed = tick.elapsed((*timer.as_ptr()).last_run);
        let period = (*timer.as_ptr()).period;
        if elapsed >= period {
            0
        } else {
            period - elapsed
        }
    }
}
