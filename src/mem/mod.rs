use crate::back::{Error, ErrorKind};
use fnv::FnvHashMap;
use std::cell::RefCell;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

const MIB: u64 = 1024 * 1024;

/// Requests below 1MiB are rounded to this granularity.
const SMALL_ROUND: u64 = 256;
/// Requests of 1MiB and above are rounded to this granularity.
const LARGE_ROUND: u64 = 2 * MIB;

/// Point-in-time device memory usage, in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Bytes held by live blocks.
    pub allocated: u64,
    /// Bytes obtained from the device, live or cached.
    pub reserved: u64,
}

impl MemorySnapshot {
    /// Signed change in allocated bytes from `self` to `later`.
    pub fn diff(&self, later: &MemorySnapshot) -> i64 {
        later.allocated as i64 - self.allocated as i64
    }
}

pub fn mib(bytes: u64) -> f64 {
    bytes as f64 / MIB as f64
}

impl Display for MemorySnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "  allocated: {} bytes ({:.2} MiB)",
            self.allocated,
            mib(self.allocated)
        )?;
        write!(
            f,
            "  reserved:  {} bytes ({:.2} MiB)",
            self.reserved,
            mib(self.reserved)
        )
    }
}

/// Pool block size for a request, `None` when rounding up overflows.
pub fn round_size(bytes: u64) -> Option<u64> {
    let bytes = bytes.max(1);
    let step = if bytes < MIB { SMALL_ROUND } else { LARGE_ROUND };
    Some(bytes.checked_add(step - 1)? / step * step)
}

/// Raw device memory the pool hands out and caches.
pub trait RawBlock {
    /// Give the memory back to the device.
    fn release(self);
}

struct PoolState<R> {
    allocated: u64,
    reserved: u64,
    peak_allocated: u64,
    limit: Option<u64>,
    /// Freed blocks kept for reuse, keyed by rounded size.
    cached: FnvHashMap<u64, Vec<R>>,
}

impl<R: RawBlock> PoolState<R> {
    fn fits(&self, size: u64) -> bool {
        match self.limit {
            Some(limit) => self
                .reserved
                .checked_add(size)
                .map_or(false, |total| total <= limit),
            None => true,
        }
    }

    fn cached_bytes(&self) -> u64 {
        self.reserved - self.allocated
    }

    fn take_cached(&mut self, size: u64) -> Option<R> {
        let bin = self.cached.get_mut(&size)?;
        let raw = bin.pop();
        if bin.is_empty() {
            self.cached.remove(&size);
        }
        raw
    }

    fn release_cached(&mut self) -> u64 {
        let mut freed = 0;
        for (size, bin) in self.cached.drain() {
            for raw in bin {
                raw.release();
                freed += size;
            }
        }
        self.reserved -= freed;
        freed
    }

    fn mark_allocated(&mut self, size: u64) {
        self.allocated += size;
        self.peak_allocated = self.peak_allocated.max(self.allocated);
    }
}

/// Caching allocator over some device's raw blocks.
///
/// Released blocks stay reserved and are reused for requests of the same rounded size,
/// until [`MemoryPool::empty_cache`] hands them back to the device.
pub struct MemoryPool<R: RawBlock> {
    state: Rc<RefCell<PoolState<R>>>,
}

impl<R: RawBlock> MemoryPool<R> {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            state: Rc::new(RefCell::new(PoolState {
                allocated: 0,
                reserved: 0,
                peak_allocated: 0,
                limit,
                cached: Default::default(),
            })),
        }
    }

    /// Allocate at least `bytes`. `create` is called with the rounded size when
    /// no cached block can be reused.
    pub fn alloc<F>(&self, bytes: u64, mut create: F) -> Result<Block<R>, Error>
    where
        F: FnMut(u64) -> Result<R, Error>,
    {
        let mut st = self.state.borrow_mut();
        let size = match round_size(bytes) {
            Some(size) => size,
            None => {
                return Err(ErrorKind::OutOfMemory {
                    requested: bytes,
                    reserved: st.reserved,
                    limit: st.limit.unwrap_or(u64::MAX),
                }
                .into())
            }
        };

        if let Some(raw) = st.take_cached(size) {
            log::debug!("Reusing cached block of {size} bytes");
            st.mark_allocated(size);
            return Ok(self.block(raw, size));
        }

        if !st.fits(size) {
            let freed = st.release_cached();
            log::debug!("Released {freed} cached bytes to fit {size}");
        }
        if !st.fits(size) {
            return Err(ErrorKind::OutOfMemory {
                requested: bytes,
                reserved: st.reserved,
                limit: st.limit.unwrap_or_default(),
            }
            .into());
        }

        let raw = match create(size) {
            Ok(raw) => raw,
            Err(e) if e.is_out_of_memory() && st.cached_bytes() > 0 => {
                let freed = st.release_cached();
                log::debug!("Device out of memory, retrying after releasing {freed} cached bytes");
                create(size)?
            }
            Err(e) => return Err(e),
        };

        log::debug!("Reserved new block of {size} bytes (requested {bytes})");
        st.reserved += size;
        st.mark_allocated(size);
        Ok(self.block(raw, size))
    }

    fn block(&self, raw: R, size: u64) -> Block<R> {
        Block {
            raw: Some(raw),
            size,
            pool: self.state.clone(),
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let st = self.state.borrow();
        MemorySnapshot {
            allocated: st.allocated,
            reserved: st.reserved,
        }
    }

    pub fn peak_allocated(&self) -> u64 {
        self.state.borrow().peak_allocated
    }

    /// Return every cached block to the device. Returns the number of bytes released.
    pub fn empty_cache(&self) -> u64 {
        self.state.borrow_mut().release_cached()
    }
}

impl<R: RawBlock> Debug for MemoryPool<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("MemoryPool")
            .field("allocated", &st.allocated)
            .field("reserved", &st.reserved)
            .field("limit", &st.limit)
            .finish()
    }
}

/// A live allocation. Dropping it returns the raw block to the pool's cache.
pub struct Block<R: RawBlock> {
    raw: Option<R>,
    size: u64,
    pool: Rc<RefCell<PoolState<R>>>,
}

impl<R: RawBlock> Block<R> {
    /// Rounded size accounted for this block.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: RawBlock> Deref for Block<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        // Only taken in drop
        self.raw.as_ref().unwrap()
    }
}

impl<R: RawBlock> DerefMut for Block<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.raw.as_mut().unwrap()
    }
}

impl<R: RawBlock> Debug for Block<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block").field("size", &self.size).finish()
    }
}

impl<R: RawBlock> Drop for Block<R> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            let mut st = self.pool.borrow_mut();
            st.allocated -= self.size;
            st.cached.entry(self.size).or_default().push(raw);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl RawBlock for Counted {
        fn release(self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted(released: &Arc<AtomicUsize>) -> impl FnMut(u64) -> Result<Counted, Error> + '_ {
        |_| Ok(Counted(released.clone()))
    }

    #[test]
    fn test_round_size() {
        assert_eq!(round_size(0), Some(256));
        assert_eq!(round_size(1), Some(256));
        assert_eq!(round_size(256), Some(256));
        assert_eq!(round_size(257), Some(512));
        assert_eq!(round_size(MIB), Some(MIB));
        assert_eq!(round_size(MIB + 1), Some(2 * MIB));
        assert_eq!(round_size(400_000_000), Some(191 * LARGE_ROUND));
        assert_eq!(round_size(u64::MAX - 3), None);
    }

    #[test]
    fn test_unroundable_request_fails() {
        let released = Arc::new(AtomicUsize::new(0));
        let pool = MemoryPool::new(None);
        let mut created = false;

        let err = pool
            .alloc(u64::MAX - 3, |_| {
                created = true;
                Ok(Counted(released.clone()))
            })
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(!created);
        assert_eq!(pool.snapshot(), MemorySnapshot::default());
    }

    #[test]
    fn test_free_keeps_memory_reserved() {
        let released = Arc::new(AtomicUsize::new(0));
        let pool = MemoryPool::new(None);

        let b = pool.alloc(1000, counted(&released)).unwrap();
        assert_eq!(b.size(), 1024);
        assert_eq!(
            pool.snapshot(),
            MemorySnapshot {
                allocated: 1024,
                reserved: 1024
            }
        );

        drop(b);
        assert_eq!(
            pool.snapshot(),
            MemorySnapshot {
                allocated: 0,
                reserved: 1024
            }
        );
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert_eq!(pool.empty_cache(), 1024);
        assert_eq!(pool.snapshot(), MemorySnapshot::default());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(pool.peak_allocated(), 1024);
    }

    #[test]
    fn test_cached_block_is_reused() {
        let released = Arc::new(AtomicUsize::new(0));
        let pool = MemoryPool::new(None);
        let mut created = 0;

        for _ in 0..3 {
            let b = pool
                .alloc(5000, |_| {
                    created += 1;
                    Ok(Counted(released.clone()))
                })
                .unwrap();
            drop(b);
        }

        assert_eq!(created, 1);
        assert_eq!(pool.snapshot().reserved, round_size(5000).unwrap());
    }

    #[test]
    fn test_limit_releases_cache_before_failing() {
        let released = Arc::new(AtomicUsize::new(0));
        let pool = MemoryPool::new(Some(4096));

        drop(pool.alloc(2048, counted(&released)).unwrap());
        // 2048 cached + 3072 does not fit, cache gets flushed
        let b = pool.alloc(3072, counted(&released)).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(pool.snapshot().reserved, 3072);

        let err = pool.alloc(2048, counted(&released)).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(pool.snapshot().allocated, b.size());
    }

    #[test]
    fn test_device_oom_retries_once_after_flush() {
        let released = Arc::new(AtomicUsize::new(0));
        let pool = MemoryPool::new(None);
        drop(pool.alloc(512, counted(&released)).unwrap());

        let mut attempts = 0;
        let b = pool
            .alloc(1024, |size| {
                attempts += 1;
                if attempts == 1 {
                    Err(ErrorKind::DeviceOutOfMemory { requested: size }.into())
                } else {
                    Ok(Counted(released.clone()))
                }
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(
            pool.snapshot(),
            MemorySnapshot {
                allocated: 1024,
                reserved: 1024
            }
        );
        drop(b);
    }

    #[test]
    fn test_snapshot_diff_and_display() {
        let before = MemorySnapshot {
            allocated: 3 * MIB,
            reserved: 4 * MIB,
        };
        let after = MemorySnapshot {
            allocated: MIB,
            reserved: 4 * MIB,
        };
        assert_eq!(before.diff(&after), -2 * MIB as i64);
        assert_eq!(after.diff(&before), 2 * MIB as i64);
        assert_eq!(
            before.to_string(),
            "  allocated: 3145728 bytes (3.00 MiB)\n  reserved:  4194304 bytes (4.00 MiB)"
        );
    }
}
