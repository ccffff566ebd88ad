//! # Buddy Memory Allocator
//!
//! A fixed-capacity, pool-based allocator that serves requests from a single
//! contiguous memory mapping by recursively halving power-of-two blocks and
//! coalescing freed blocks with their buddies (Knuth's binary buddy system).
//!
//! A pool is single-threaded: wrap it in a mutex at the call boundary if it
//! must be shared across threads. There is no defragmentation, no best-fit
//! policy, and memory is never returned to the OS before the pool itself is
//! dropped.
#![cfg_attr(not(test), no_std)]

mod buddy_error;
mod config;

pub use buddy_error::BuddyError;
pub use config::BuddyPoolConfig;

use core::{array, ptr};
use errno::*;
use memmap2::MmapMut;

/// The order used when a pool is created with a requested size of zero.
/// The number of bytes managed is `2^DEFAULT_K`.
pub const DEFAULT_K: usize = 30;

/// The smallest order a pool will ever split a block down to.
pub const MIN_K: usize = 20;

/// Exclusive upper bound on order; the largest admissible order is
/// `MAX_K - 1`. Sizes the sentinel `avail` array.
pub const MAX_K: usize = 48;

const BLOCK_AVAIL: u8 = 1; // Block is available to allocate
const BLOCK_RESERVED: u8 = 0; // Block has been handed to user
const BLOCK_UNUSED: u8 = 3; // Block belongs to the sentinel array, never a real block

/// The error code for ENOMEM as defined in the POSIX standard.
const ENOMEM: Errno = Errno(12);

/// The in-band bookkeeping prefix of every block, free or reserved.
struct Avail {
    tag: u8,          // BLOCK_AVAIL, BLOCK_RESERVED, or BLOCK_UNUSED
    kval: usize,      // order of this block
    next: *mut Avail, // next block in this order's free list
    prev: *mut Avail, // prev block in this order's free list
}

impl Avail {
    /// A fresh, unlinked sentinel-shaped header.
    fn new() -> Avail {
        Avail {
            tag: BLOCK_UNUSED,
            kval: 0,
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }
}

/// A buddy memory pool: one backing region plus one free-list array.
pub struct BuddyPool {
    kval_m: usize,         // order of the entire pool
    config: BuddyPoolConfig,
    base: MmapMut,         // backing region
    avail: [Avail; MAX_K], // avail[k] is the sentinel head of the order-k free list
}

impl BuddyPool {
    /// Create and initialize a pool of (at least) `size` bytes, rounded up
    /// to a power of two and clamped to `[MIN_K, MAX_K - 1]`.
    ///
    /// A `size` of zero requests the compiled-in [`DEFAULT_K`] order. Uses
    /// an anonymous memory mapping as the backing region, so it is portable
    /// to any target `memmap2` supports.
    ///
    /// Pools from different calls to `new` must never be intermingled:
    /// freeing a pointer returned by one pool's `malloc` into another pool
    /// is undefined behavior.
    pub fn new(size: usize) -> Result<BuddyPool, BuddyError> {
        Self::with_config(size, BuddyPoolConfig::default())
    }

    /// Like [`BuddyPool::new`], but with caller-supplied order bounds
    /// instead of the compiled-in [`MIN_K`]/[`MAX_K`]/[`DEFAULT_K`].
    pub fn with_config(size: usize, config: BuddyPoolConfig) -> Result<BuddyPool, BuddyError> {
        let config = config.normalized();

        let mut kval = if size == 0 {
            config.default_k
        } else {
            btok(size)
        };
        if kval < config.min_k {
            kval = config.min_k;
        }
        if kval >= config.max_k {
            kval = config.max_k - 1;
        }

        let kval_m = kval;
        let numbytes = (1u64 << kval) as usize;

        let base = MmapMut::map_anon(numbytes).or_else(|_| {
            set_errno(ENOMEM);
            Err(BuddyError::NoMemory)
        })?;

        log::debug!("buddy pool created: kval_m={kval_m} ({numbytes} bytes)");

        let mut pool = BuddyPool {
            kval_m,
            config,
            base,
            avail: array::from_fn::<_, MAX_K, _>(|_| Avail::new()),
        };
        pool.init();
        Ok(pool)
    }

    /// Thread the sentinel array and the single initial full-pool block
    /// into place. Called automatically by [`BuddyPool::new`].
    fn init(&mut self) {
        for i in 0..=self.kval_m {
            self.avail[i].next = &mut self.avail[i] as *mut Avail;
            self.avail[i].prev = &mut self.avail[i] as *mut Avail;
            self.avail[i].kval = i;
            self.avail[i].tag = BLOCK_UNUSED;
        }

        let base_ptr = self.base.as_ptr() as *mut Avail;
        self.avail[self.kval_m].next = base_ptr;
        self.avail[self.kval_m].prev = base_ptr;

        let m = unsafe { &mut *base_ptr };
        m.tag = BLOCK_AVAIL;
        m.kval = self.kval_m;
        m.next = &mut self.avail[self.kval_m] as *mut Avail;
        m.prev = &mut self.avail[self.kval_m] as *mut Avail;
    }

    /// The pool's maximum order; the entire pool is one block of this order.
    pub fn kval_m(&self) -> usize {
        self.kval_m
    }

    /// Locate `avail`'s buddy: the sibling block produced had it been split
    /// from (or that it would merge into) a block one order larger. Computed
    /// as a single XOR on the offset from the pool base, per the buddy
    /// invariant.
    fn buddy_calc(&self, avail: &Avail) -> *mut Avail {
        let mut addr = (avail as *const Avail).addr();
        addr -= self.base.as_ptr().addr();
        let mask = (1u64 << avail.kval) as usize;
        unsafe { self.base.as_ptr().offset((addr ^ mask) as isize) as *mut Avail }
    }

    /// Allocate `size` usable bytes, returning a pointer past the block's
    /// header. The returned memory is uninitialized.
    pub fn malloc(&mut self, size: usize) -> Result<*mut u8, BuddyError> {
        if size == 0 {
            set_errno(ENOMEM);
            return Err(BuddyError::NoMemory);
        }
        let avail_size = size_of::<Avail>();
        let mut kval = btok(size + avail_size);
        if kval > self.kval_m {
            set_errno(ENOMEM);
            return Err(BuddyError::NoMemory);
        }
        if kval < self.config.min_k {
            kval = self.config.min_k;
        }
        let ptr = unsafe { (self.malloc_kval(kval)? as *mut u8).offset(avail_size as isize) };
        log::trace!("malloc({size}) -> order {kval}, {ptr:p}");
        Ok(ptr)
    }

    /// Allocate a block of exactly order `kval`, splitting a larger free
    /// block if none of that order is available.
    unsafe fn malloc_kval(&mut self, kval: usize) -> Result<*mut Avail, BuddyError> {
        if kval > self.kval_m {
            set_errno(ENOMEM);
            return Err(BuddyError::NoMemory);
        }
        if self.avail[kval].next as *const Avail != &self.avail[kval] {
            let block = self.avail[kval].next;
            self.remove_from_avail(&mut *block);
            return Ok(block);
        }
        // No block of this order is free; split one from the next order up.
        let larger_block = self.malloc_kval(kval + 1)?;
        Ok(self.split(&mut *larger_block))
    }

    /// Split a free block in half, keeping the lower-address half (returned,
    /// tagged reserved) and splicing the upper-address half into its order's
    /// free list.
    fn split<'a>(&mut self, avail: &'a mut Avail) -> &'a mut Avail {
        let kval = avail.kval;
        avail.kval -= 1;
        avail.tag = BLOCK_RESERVED;
        let buddy = self.buddy_calc(avail);
        unsafe {
            ptr::write(buddy, Avail::new());
            let buddy = &mut *buddy;
            buddy.kval = kval - 1;
            buddy.tag = BLOCK_AVAIL;
            self.add_to_avail(buddy);
        }
        avail
    }

    /// Return a block previously returned by `malloc`/`realloc` to the pool.
    ///
    /// A null pointer is a no-op. Any other foreign, already-freed, or
    /// mid-block pointer is undefined behavior; the allocator does not
    /// detect it.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            let avail = (ptr.offset(-(size_of::<Avail>() as isize)) as *mut Avail)
                .as_mut()
                .unwrap();
            log::trace!("free({ptr:p}) order {}", avail.kval);
            self.free_avail(avail);
        }
    }

    /// Coalesce `avail` with its buddy as long as the buddy is free and of
    /// matching order, then splice the (possibly merged) result into its
    /// order's free list.
    unsafe fn free_avail(&mut self, avail: &mut Avail) {
        let mut avail = avail;
        let mut buddy_o = self.get_avail_buddy(avail);
        while let Some(buddy) = buddy_o {
            let buddy = buddy as *mut Avail;
            self.remove_from_avail(&mut *buddy);
            log::trace!("coalescing order {} blocks", avail.kval);
            if (avail as *mut Avail) < buddy {
                avail.kval += 1;
            } else {
                (*buddy).kval += 1;
                avail = &mut *buddy;
            }
            buddy_o = self.get_avail_buddy(avail);
        }
        self.add_to_avail(avail);
    }

    /// Splice a block onto the head of its order's free list and tag it
    /// available. Always four unconditional writes: the sentinel makes an
    /// "is the list empty?" branch unnecessary.
    fn add_to_avail(&mut self, avail: &mut Avail) {
        let kval = avail.kval;
        avail.prev = self.avail[kval].prev;
        avail.next = &mut self.avail[kval];
        unsafe {
            (*self.avail[kval].prev).next = avail;
        }
        self.avail[kval].prev = avail;
        avail.tag = BLOCK_AVAIL;
    }

    /// Unlink a block from its free list and tag it reserved.
    fn remove_from_avail(&mut self, avail: &mut Avail) {
        unsafe {
            (*avail.next).prev = avail.prev;
            (*avail.prev).next = avail.next;
        }
        avail.tag = BLOCK_RESERVED;
        avail.next = ptr::null_mut();
        avail.prev = ptr::null_mut();
    }

    /// The block's buddy, if it is currently free and of the same order as
    /// `avail` (i.e. a coalescing candidate). `None` at the root order,
    /// since the whole-pool block has no buddy.
    fn get_avail_buddy(&self, avail: &Avail) -> Option<&mut Avail> {
        if avail.kval == self.kval_m {
            return None;
        }
        let buddy = unsafe { self.buddy_calc(avail).as_mut().unwrap() };
        if buddy.tag != BLOCK_AVAIL {
            return None;
        }
        if buddy.kval != avail.kval {
            return None;
        }
        Some(buddy)
    }

    /// Resize a previously allocated block, preserving its contents up to
    /// the lesser of the old and new sizes.
    ///
    /// `ptr == null` behaves like `malloc(size)`. `size == 0` with a
    /// non-null `ptr` behaves like `free(ptr)`, returning the (now-dangling)
    /// original pointer per the classic C `realloc` contract. Shrinking
    /// splits the existing block in place; growing allocates fresh, copies,
    /// and frees the old block — no in-place grow-by-absorbing-the-buddy is
    /// attempted.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> Result<*mut u8, BuddyError> {
        if ptr.is_null() {
            return self.malloc(size);
        }
        let mut target_kval = btok(size + size_of::<Avail>());
        if target_kval > self.kval_m {
            set_errno(ENOMEM);
            return Err(BuddyError::NoMemory);
        }
        if target_kval < self.config.min_k {
            target_kval = self.config.min_k;
        }

        let mut old_avail = unsafe {
            (ptr.offset(-(size_of::<Avail>() as isize)) as *mut Avail)
                .as_mut()
                .ok_or(BuddyError::CorruptedMemoryPool)?
        };
        if size == 0 {
            self.free(ptr);
            return Ok(ptr);
        }
        let old_kval = old_avail.kval;
        if target_kval == old_kval {
            return Ok(ptr);
        }
        while target_kval < old_avail.kval {
            old_avail = self.split(old_avail);
        }
        let mut ptr = ptr;
        if target_kval > old_avail.kval {
            unsafe {
                let new_avail = self.malloc_kval(target_kval)?;
                let new_block = (new_avail as *mut u8).offset(size_of::<Avail>() as isize);
                let old_size = (1usize << old_avail.kval) - size_of::<Avail>();
                new_block.copy_from_nonoverlapping(ptr, old_size);
                self.free(ptr);
                ptr = new_block;
            }
        }
        log::trace!("realloc({size}) -> order {target_kval}, {ptr:p}");
        Ok(ptr)
    }
}

impl Drop for BuddyPool {
    /// Release the backing region. Using the pool after this point is
    /// undefined behavior.
    fn drop(&mut self) {
        if self.base.flush().is_err() {
            log::warn!("buddy pool kval_m={} failed to flush backing region", self.kval_m);
        }
    }
}

/// Convert a byte count to the smallest order `k` with `2^k >= bytes`.
///
/// `btok(0) == 0`, `btok(1) == 0`, `btok(2) == 1`, and `btok` is monotone
/// non-decreasing and idempotent on powers of two.
pub const fn btok(mut bytes: usize) -> usize {
    if bytes == 0 {
        return 0;
    }
    let mut k: usize = 0;
    bytes -= 1;
    while bytes > 0 {
        bytes >>= 1;
        k += 1;
    }
    k
}
