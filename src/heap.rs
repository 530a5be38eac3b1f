//! The heap facade: a TLSF instance over a caller-provided work memory,
//! plus usage accounting, a scoped temporary-buffer pool and word-optimized
//! `memcpy`/`memset` routines.
//!
//! Zero-byte allocations return the address of an immortal sentinel word
//! instead of `None`, so "allocate nothing" round-trips through `free`
//! without touching the pool. The sentinel holds a known constant;
//! [`Heap::test`] verifies it to catch stray writes through a zero-sized
//! allocation, and also runs the allocator's own consistency checks.

use core::{cell::UnsafeCell, mem, mem::MaybeUninit, ptr::NonNull};

use crate::{config, tlsf::Tlsf, Res};

const ALIGN_MASK: usize = 0x3;

const ZERO_MEM_SENTINEL: u32 = 0xa1b2_c3d4;

#[repr(transparent)]
struct ZeroMem(UnsafeCell<u32>);

// Safety: the cell is only ever accessed from the single thread driving the
//         runtime; the type exists so writes through an escaped zero-sized
//         allocation stay defined and detectable.
unsafe impl Sync for ZeroMem {}

/// Handed out for 0-byte allocations.
static ZERO_MEM: ZeroMem = ZeroMem(UnsafeCell::new(ZERO_MEM_SENTINEL));

fn zero_mem() -> NonNull<u8> {
    // Safety: the address of a static is never null.
    unsafe { NonNull::new_unchecked(ZERO_MEM.0.get().cast()) }
}

/// A snapshot of heap usage, filled by [`Heap::monitor`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemMonitor {
    /// Total size of the work memory, control structures included.
    pub total_size: u32,
    pub free_cnt: u32,
    /// Bytes currently free.
    pub free_size: u32,
    pub free_biggest_size: u32,
    pub used_cnt: u32,
    /// High-water mark of allocated bytes.
    pub max_used: u32,
    /// Percentage of the work memory in use.
    pub used_pct: u8,
    /// 0 when the biggest free block is the only one; grows as the free
    /// space shatters.
    pub frag_pct: u8,
}

#[derive(Clone, Copy)]
struct MemBuf {
    p: *mut u8,
    size: u32,
    used: bool,
}

impl MemBuf {
    const EMPTY: MemBuf = MemBuf {
        p: core::ptr::null_mut(),
        size: 0,
        used: false,
    };
}

/// The runtime heap.
///
/// Initialized once over a static work memory; all services of this crate
/// allocate from it. Not thread safe — see the crate-level concurrency
/// notes.
pub struct Heap {
    tlsf: Tlsf,
    mem: NonNull<u8>,
    size: usize,
    cur_used: u32,
    max_used: u32,
    bufs: [MemBuf; config::MEM_BUF_MAX_NUM],
}

// Safety: the heap logically owns its work memory; the raw pointers it
//         holds never alias anything outside that region.
unsafe impl Send for Heap {}

impl Heap {
    /// Create a heap over `pool`. The slice element type keeps the region
    /// word aligned; [`config::MEM_SIZE`] / 4 elements is the default size.
    ///
    /// Returns `None` when the region is too small to hold the allocator's
    /// control structures plus at least one block.
    pub fn init(pool: &'static mut [MaybeUninit<u32>]) -> Option<Heap> {
        let size = mem::size_of_val(pool);
        let mem = NonNull::new(pool.as_mut_ptr().cast::<u8>())?;

        // Safety: the region is exclusively borrowed for 'static and is
        //         only used through the allocator from here on.
        let tlsf = unsafe { Tlsf::create_with_pool(mem, size)? };

        Some(Heap {
            tlsf,
            mem,
            size,
            cur_used: 0,
            max_used: 0,
            bufs: [MemBuf::EMPTY; config::MEM_BUF_MAX_NUM],
        })
    }

    /// Drop every allocation and start over with an empty heap.
    pub fn reset(&mut self) {
        // Safety: same region the heap was initialized over.
        if let Some(tlsf) = unsafe { Tlsf::create_with_pool(self.mem, self.size) } {
            self.tlsf = tlsf;
        }
        self.cur_used = 0;
        self.max_used = 0;
        self.bufs = [MemBuf::EMPTY; config::MEM_BUF_MAX_NUM];
    }

    /// Allocate `size` bytes. A zero `size` yields the immortal zero-byte
    /// sentinel; `None` means the heap is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return Some(zero_mem());
        }

        match self.tlsf.allocate(size) {
            Some(p) => {
                self.account_alloc(p);
                Some(p)
            }
            None => {
                self.log_oom(size);
                None
            }
        }
    }

    /// Allocate `size` bytes at a multiple of `align` (a power of two).
    pub fn alloc_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return Some(zero_mem());
        }

        match self.tlsf.allocate_aligned(align, size) {
            Some(p) => {
                self.account_alloc(p);
                Some(p)
            }
            None => {
                self.log_oom(size);
                None
            }
        }
    }

    /// Free an allocation. `None` and the zero-byte sentinel are no-ops.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must have been returned by this heap and not freed
    /// since.
    pub unsafe fn free(&mut self, data: Option<NonNull<u8>>) {
        let p = match data {
            None => return,
            Some(p) => p,
        };
        if p == zero_mem() {
            return;
        }

        let size = self.tlsf.deallocate(p) as u32;
        self.cur_used = self.cur_used.saturating_sub(size);
    }

    /// Resize an allocation, keeping its contents. A zero `new_size` frees
    /// `data` and yields the zero-byte sentinel; reallocating the sentinel
    /// (or `None`) is a plain allocation. On failure the original
    /// allocation is left untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must have been returned by this heap and not freed
    /// since.
    pub unsafe fn realloc(
        &mut self,
        data: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.free(data);
            return Some(zero_mem());
        }

        let p = match data {
            None => return self.alloc(new_size),
            Some(p) if p == zero_mem() => return self.alloc(new_size),
            Some(p) => p,
        };

        let old = Tlsf::block_size_of(p) as u32;
        match self.tlsf.reallocate(Some(p), new_size) {
            Some(new_p) => {
                let new = Tlsf::block_size_of(new_p) as u32;
                self.cur_used = self.cur_used.saturating_sub(old).saturating_add(new);
                self.max_used = self.max_used.max(self.cur_used);
                Some(new_p)
            }
            None => {
                self.log_oom(new_size);
                None
            }
        }
    }

    /// Bytes currently allocated (internal block sizes).
    pub fn used(&self) -> u32 {
        self.cur_used
    }

    /// High-water mark of [`Heap::used`].
    pub fn max_used(&self) -> u32 {
        self.max_used
    }

    /// Verify the zero-byte sentinel and the allocator's internal
    /// consistency. [`Res::Inv`] indicates programmer error — a double
    /// free or a buffer overrun — after which the heap is not reliable.
    pub fn test(&self) -> Res {
        // Safety: single-threaded access per the crate contract.
        if unsafe { *ZERO_MEM.0.get() } != ZERO_MEM_SENTINEL {
            return Res::Inv;
        }
        if !self.tlsf.check() {
            return Res::Inv;
        }
        // Safety: `pool()` is this allocator's own pool.
        if !unsafe { self.tlsf.check_pool(self.tlsf.pool()) } {
            return Res::Inv;
        }
        Res::Ok
    }

    /// Walk the pool and report usage and fragmentation.
    pub fn monitor(&self) -> MemMonitor {
        let mut mon = MemMonitor::default();

        // Safety: `pool()` is this allocator's own pool.
        unsafe {
            self.tlsf.walk_pool(self.tlsf.pool(), |_, size, used| {
                if used {
                    mon.used_cnt += 1;
                } else {
                    mon.free_cnt += 1;
                    mon.free_size += size as u32;
                    if size as u32 > mon.free_biggest_size {
                        mon.free_biggest_size = size as u32;
                    }
                }
            });
        }

        mon.total_size = self.size as u32;
        mon.used_pct = (100 - (100 * mon.free_size) / mon.total_size) as u8;
        if mon.free_size > 0 {
            mon.frag_pct = 100 - (mon.free_biggest_size * 100 / mon.free_size) as u8;
        } else {
            // No fragmentation when all the memory is taken.
            mon.frag_pct = 0;
        }
        mon.max_used = self.max_used;
        mon
    }

    /// Borrow a temporary buffer of at least `size` bytes.
    ///
    /// An unused slot whose capacity matches exactly is preferred, then the
    /// tightest sufficient one; otherwise an unused slot is grown. Returns
    /// `None` when `size` is zero, all slots are in use, or the heap cannot
    /// back the request.
    pub fn buf_get(&mut self, size: u32) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let mut guess: Option<usize> = None;
        for i in 0..config::MEM_BUF_MAX_NUM {
            if self.bufs[i].used || self.bufs[i].size < size {
                continue;
            }
            if self.bufs[i].size == size {
                self.bufs[i].used = true;
                return NonNull::new(self.bufs[i].p);
            }
            match guess {
                None => guess = Some(i),
                Some(g) if self.bufs[i].size < self.bufs[g].size => guess = Some(i),
                _ => {}
            }
        }

        if let Some(g) = guess {
            self.bufs[g].used = true;
            return NonNull::new(self.bufs[g].p);
        }

        // No sufficient slot; grow the first unused one.
        for i in 0..config::MEM_BUF_MAX_NUM {
            if self.bufs[i].used {
                continue;
            }
            let old = NonNull::new(self.bufs[i].p);
            // Safety: `old` is this slot's live buffer (or None).
            let p = unsafe { self.realloc(old, size as usize)? };
            self.bufs[i] = MemBuf {
                p: p.as_ptr(),
                size,
                used: true,
            };
            return Some(p);
        }

        None
    }

    /// Return a buffer obtained from [`Heap::buf_get`]. The backing memory
    /// stays cached in its slot.
    pub fn buf_release(&mut self, p: NonNull<u8>) {
        for buf in self.bufs.iter_mut() {
            if buf.p == p.as_ptr() {
                buf.used = false;
                return;
            }
        }
    }

    /// Free the backing memory of every buffer slot, borrowed or not.
    pub fn buf_free_all(&mut self) {
        for i in 0..config::MEM_BUF_MAX_NUM {
            if let Some(p) = NonNull::new(self.bufs[i].p) {
                // Safety: the slot's buffer is a live heap allocation.
                unsafe { self.free(Some(p)) };
                self.bufs[i] = MemBuf::EMPTY;
            }
        }
    }

    fn account_alloc(&mut self, p: NonNull<u8>) {
        // Safety: `p` was just returned by the allocator.
        let size = unsafe { Tlsf::block_size_of(p) } as u32;
        self.cur_used += size;
        self.max_used = self.max_used.max(self.cur_used);
    }

    fn log_oom(&self, size: usize) {
        let mon = self.monitor();
        log::warn!(
            "couldn't allocate {} bytes (used {}%, frag {}%, biggest free {} bytes)",
            size,
            mon.used_pct,
            mon.frag_pct,
            mon.free_biggest_size
        );
    }
}

/// `memcpy` optimized for 4-byte operation: byte copy while the pointers
/// disagree on word phase, otherwise aligned 32-byte unrolled word chunks
/// with byte heads and tails.
///
/// # Safety
///
/// `dst` and `src` must be valid for `len` bytes and must not overlap.
pub unsafe fn memcpy(dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
    let mut d8 = dst;
    let mut s8 = src;
    let mut len = len;

    let d_align = dst as usize & ALIGN_MASK;
    let s_align = src as usize & ALIGN_MASK;

    // Different word phases never line up; stay on bytes.
    if s_align != d_align {
        while len > 32 {
            for _ in 0..32 {
                *d8 = *s8;
                d8 = d8.add(1);
                s8 = s8.add(1);
            }
            len -= 32;
        }
        while len > 0 {
            *d8 = *s8;
            d8 = d8.add(1);
            s8 = s8.add(1);
            len -= 1;
        }
        return dst;
    }

    // Align the destination to a word boundary.
    if d_align != 0 {
        let mut head = ALIGN_MASK + 1 - d_align;
        while head > 0 && len > 0 {
            *d8 = *s8;
            d8 = d8.add(1);
            s8 = s8.add(1);
            head -= 1;
            len -= 1;
        }
    }

    let mut d32 = d8 as *mut u32;
    let mut s32 = s8 as *const u32;
    while len > 32 {
        for _ in 0..8 {
            *d32 = *s32;
            d32 = d32.add(1);
            s32 = s32.add(1);
        }
        len -= 32;
    }
    while len > 4 {
        *d32 = *s32;
        d32 = d32.add(1);
        s32 = s32.add(1);
        len -= 4;
    }

    d8 = d32 as *mut u8;
    s8 = s32 as *const u8;
    while len > 0 {
        *d8 = *s8;
        d8 = d8.add(1);
        s8 = s8.add(1);
        len -= 1;
    }

    dst
}

/// Byte-by-byte `memcpy` for copies small enough that the word machinery
/// of [`memcpy`] costs more than it saves.
///
/// # Safety
///
/// `dst` and `src` must be valid for `len` bytes and must not overlap.
#[inline]
pub unsafe fn memcpy_small(dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
    let mut d8 = dst;
    let mut s8 = src;
    let mut len = len;
    while len > 0 {
        *d8 = *s8;
        d8 = d8.add(1);
        s8 = s8.add(1);
        len -= 1;
    }
    dst
}

/// `memset` optimized for 4-byte operation.
///
/// # Safety
///
/// `dst` must be valid for `len` bytes.
pub unsafe fn memset(dst: *mut u8, v: u8, len: usize) {
    let mut d8 = dst;
    let mut len = len;

    // Align the destination to a word boundary.
    let d_align = dst as usize & ALIGN_MASK;
    if d_align != 0 {
        let mut head = ALIGN_MASK + 1 - d_align;
        while head > 0 && len > 0 {
            *d8 = v;
            d8 = d8.add(1);
            head -= 1;
            len -= 1;
        }
    }

    let v32 =
        (v as u32) | ((v as u32) << 8) | ((v as u32) << 16) | ((v as u32) << 24);

    let mut d32 = d8 as *mut u32;
    while len > 32 {
        for _ in 0..8 {
            *d32 = v32;
            d32 = d32.add(1);
        }
        len -= 32;
    }
    while len > 4 {
        *d32 = v32;
        d32 = d32.add(1);
        len -= 4;
    }

    d8 = d32 as *mut u8;
    while len > 0 {
        *d8 = v;
        d8 = d8.add(1);
        len -= 1;
    }
}

/// `memset(dst, 0x00, len)`.
///
/// # Safety
///
/// `dst` must be valid for `len` bytes.
#[inline]
pub unsafe fn memset_00(dst: *mut u8, len: usize) {
    memset(dst, 0x00, len);
}

/// `memset(dst, 0xFF, len)`.
///
/// # Safety
///
/// `dst` must be valid for `len` bytes.
#[inline]
pub unsafe fn memset_ff(dst: *mut u8, len: usize) {
    memset(dst, 0xFF, len);
}
