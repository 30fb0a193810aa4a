//! Hierarchical copy-on-write bitmap block allocator.
//!
//! A three-level packed bitmap (L0 leaf / L1 middle / L2 top) tracks
//! allocation of fixed-size granules over a byte range. L0 additionally
//! carries a 2-bit copy-on-write refcount ladder (`FULL -> SHARE_ONCE ->
//! SHARE_TWICE`); L1/L2 only ever see "free" vs. "not free".
//!
//! Every public operation takes the allocator's single lock for its full
//! duration — there is no lock-free fast path.

mod bits;
mod error;
mod extent;
mod l0;
mod l1;
mod l2;
mod stats;

use std::collections::BTreeMap;

use log::{debug, error, warn};
use spin::Mutex;

pub use error::{Error, Result};
pub use extent::{ExtentVec, Interval};
pub use stats::Stats;

use l0::Leaf;
use l1::Middle;
use l2::Top;

/// Every group of 256 L0 granules below this many bytes is padding: real
/// capacity never reaches a multiple of `g2 = 65536 * alloc_unit` except
/// by coincidence, so the tail is rounded up and permanently marked
/// allocated.
const L2_GRANULE_SPAN: u64 = 65536;

/// Parameters for [`BitmapAllocator::init`].
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// Total byte range managed by the allocator.
    pub capacity: u64,
    /// Size in bytes of one allocation granule.
    pub alloc_unit: u64,
    /// Whether the managed range starts out entirely free (`true`) or
    /// entirely allocated, awaiting explicit `mark_free` calls to seed it
    /// (`false`) — mirrors BlueFS's "reconstruct from journal" bootstrap.
    pub initial_free: bool,
}

struct Inner {
    leaf: Leaf,
    middle: Middle,
    top: Top,
    alloc_unit: u64,
    granules: usize,
    stats: Stats,
}

impl Inner {
    fn init(config: AllocatorConfig) -> Result<Self> {
        if config.alloc_unit == 0 || !config.alloc_unit.is_power_of_two() {
            return Err(Error::InvalidArgument("alloc_unit must be a nonzero power of two"));
        }
        if config.capacity == 0 {
            return Err(Error::InvalidArgument("capacity must be nonzero"));
        }

        let granules = config.capacity.div_ceil(config.alloc_unit) as usize;
        let aligned_granules = (granules as u64).div_ceil(L2_GRANULE_SPAN) as usize * L2_GRANULE_SPAN as usize;

        let mut leaf = Leaf::new(aligned_granules, config.initial_free);
        let mut middle = Middle::new(aligned_granules / bits::ENTRIES_PER_SLOTSET, config.alloc_unit, config.initial_free);
        let mut top = Top::new(middle.entry_count(), config.initial_free);

        if aligned_granules > granules {
            // Padding past real capacity is permanently allocated: it
            // never appears in `available()` or any allocation result.
            leaf.mark_alloc(granules, aligned_granules);
            let slotset_lo = (granules / bits::ENTRIES_PER_SLOTSET) * bits::ENTRIES_PER_SLOTSET;
            middle.mark_l1_on_l0(&leaf, slotset_lo, aligned_granules);
            let group_lo = slotset_lo / bits::ENTRIES_PER_SLOTSET / 256;
            for group in group_lo..top.group_count() {
                top.refresh_group(&middle, group);
            }
        }

        debug!(
            "bitmap allocator init: capacity={} alloc_unit={} granules={granules} aligned_granules={aligned_granules}",
            config.capacity, config.alloc_unit
        );

        Ok(Self {
            leaf,
            middle,
            top,
            alloc_unit: config.alloc_unit,
            granules,
            stats: Stats::default(),
        })
    }

    fn validate_range(&self, offset: u64, length: u64) -> Result<()> {
        if offset % self.alloc_unit != 0 || length % self.alloc_unit != 0 {
            return Err(Error::InvalidArgument("offset/length must be alloc_unit-aligned"));
        }
        if offset + length > self.granules as u64 * self.alloc_unit {
            return Err(Error::InvalidArgument("range exceeds managed capacity"));
        }
        Ok(())
    }

    fn allocate(&mut self, length: u64, min_length: u64, max_length: u64, hint: u64) -> Result<ExtentVec> {
        if length == 0 || min_length == 0 || !min_length.is_power_of_two() {
            return Err(Error::InvalidArgument("min_length must be a nonzero power of two"));
        }
        if min_length > length {
            return Err(Error::InvalidArgument("min_length must not exceed length"));
        }
        if length % self.alloc_unit != 0 || min_length % self.alloc_unit != 0 {
            return Err(Error::InvalidArgument("length/min_length must be alloc_unit-aligned"));
        }
        if length % min_length != 0 {
            return Err(Error::InvalidArgument("length must be a multiple of min_length"));
        }
        let g2 = L2_GRANULE_SPAN * self.alloc_unit;
        if min_length > g2 {
            return Err(Error::InvalidArgument("min_length must not exceed the L2 granule span"));
        }
        // A zero max_length means "unbounded" elsewhere in the l0/l1/l2
        // allocate path; cap both that sentinel and any oversized request
        // at 2^31 bytes rather than rejecting them.
        const MAX_LENGTH_CAP: u64 = 1 << 31;
        let max_length = if max_length == 0 || max_length > MAX_LENGTH_CAP { MAX_LENGTH_CAP } else { max_length };

        let (res, allocated) = self.top.allocate(&mut self.middle, &mut self.leaf, length, min_length, max_length, hint);
        self.stats.l2_allocs += 1;
        self.stats.alloc_fragments += res.len() as u64;

        if allocated == 0 {
            warn!("allocate: exhausted, requested {length} bytes");
            return Err(Error::Exhausted);
        }
        if allocated < length {
            warn!("allocate: short allocation, requested {length}, got {allocated}");
        }
        Ok(res)
    }

    fn release(&mut self, extents: &[Interval]) -> Result<()> {
        for iv in extents {
            self.validate_range(iv.offset, iv.length)?;
        }
        self.top.free(&mut self.middle, &mut self.leaf, extents, self.alloc_unit);
        Ok(())
    }

    fn mark_allocated(&mut self, offset: u64, length: u64) -> Result<()> {
        self.validate_range(offset, length)?;
        let lo = (offset / self.alloc_unit) as usize;
        let hi = ((offset + length) / self.alloc_unit) as usize;
        self.middle.mark_alloc_l0_l1(&mut self.leaf, lo, hi);
        let group_lo = lo / bits::ENTRIES_PER_SLOTSET / 256;
        let group_hi = (hi.div_ceil(bits::ENTRIES_PER_SLOTSET).div_ceil(256)).max(group_lo + 1);
        for group in group_lo..group_hi.min(self.top.group_count()) {
            self.top.refresh_group(&self.middle, group);
        }
        Ok(())
    }

    fn mark_free(&mut self, offset: u64, length: u64) -> Result<()> {
        self.validate_range(offset, length)?;
        self.release(&[Interval::new(offset, length)])
    }

    fn copy_mark(&mut self, offset: u64) -> Result<()> {
        self.validate_range(offset, self.alloc_unit)?;
        let idx = (offset / self.alloc_unit) as usize;
        let mut discard = ExtentVec::new();
        if !self.leaf.allocate_copy(idx, self.alloc_unit, &mut discard) {
            error!("copy_mark: granule at {offset} is free or already at max refcount");
            return Err(Error::InvalidArgument("copy_mark requires an already-allocated, non-maxed granule"));
        }
        Ok(())
    }

    fn available(&self) -> u64 {
        self.middle.debug_free(&self.leaf, 0, self.middle.entry_count()) * self.alloc_unit
    }

    fn debug_free_l0(&self, offset: u64, length: u64) -> u64 {
        let lo = (offset / self.alloc_unit) as usize;
        let hi = ((offset + length) / self.alloc_unit) as usize;
        self.leaf.count_free(lo, hi) as u64
    }

    fn debug_free_l1(&self, offset: u64, length: u64) -> u64 {
        let l1_granularity = self.middle.l1_granularity();
        let lo = (offset / l1_granularity) as usize;
        let hi = (offset + length).div_ceil(l1_granularity) as usize;
        self.middle.debug_free(&self.leaf, lo, hi.min(self.middle.entry_count()))
    }
}

/// A hierarchical, copy-on-write-aware bitmap block allocator, safe to
/// share across threads behind a single internal lock.
pub struct BitmapAllocator {
    inner: Mutex<Inner>,
}

impl BitmapAllocator {
    /// Builds a fresh allocator over `config.capacity` bytes.
    pub fn init(config: AllocatorConfig) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Inner::init(config)?),
        })
    }

    /// Allocates up to `length` bytes as a possibly-fragmented
    /// [`ExtentVec`], with no single extent shorter than `min_length`
    /// (except possibly the last) or longer than `max_length`. `length`
    /// must be a multiple of `min_length`, and `min_length` must not
    /// exceed the L2 granule span. `max_length` of `0`, or anything past
    /// `2^31` bytes, is capped to `2^31`. `hint` is a byte offset used
    /// only to pick a starting search position for locality; it does not
    /// constrain the result.
    pub fn allocate(&self, length: u64, min_length: u64, max_length: u64, hint: u64) -> Result<ExtentVec> {
        self.inner.lock().allocate(length, min_length, max_length, hint)
    }

    /// Returns every granule in `extents` to the free pool.
    pub fn release(&self, extents: &[Interval]) -> Result<()> {
        self.inner.lock().release(extents)
    }

    /// Unconditionally claims `[offset, offset + length)`, bypassing the
    /// search machinery — used to seed the allocator with externally
    /// known allocations (e.g. replaying a journal).
    pub fn mark_allocated(&self, offset: u64, length: u64) -> Result<()> {
        self.inner.lock().mark_allocated(offset, length)
    }

    /// Unconditionally frees `[offset, offset + length)`.
    pub fn mark_free(&self, offset: u64, length: u64) -> Result<()> {
        self.inner.lock().mark_free(offset, length)
    }

    /// Advances the copy-on-write refcount ladder (`FULL -> SHARE_ONCE ->
    /// SHARE_TWICE`) for the single granule at `offset`. Fails if the
    /// granule is free or already at `SHARE_TWICE`; on failure no state is
    /// touched.
    pub fn copy_mark(&self, offset: u64) -> Result<()> {
        self.inner.lock().copy_mark(offset)
    }

    /// Total free bytes, counted FREE-entry-aware rather than by popcount.
    pub fn available(&self) -> u64 {
        self.inner.lock().available()
    }

    /// Ratio of PARTIAL to (PARTIAL + FREE) L1 entries: `0.0` means no
    /// fragmentation, `1.0` means every free byte sits in a PARTIAL slotset.
    pub fn fragmentation(&self) -> f64 {
        self.inner.lock().middle.fragmentation()
    }

    /// The configured granule size.
    pub fn alloc_unit(&self) -> u64 {
        self.inner.lock().alloc_unit
    }

    /// Free granules in `[offset, offset + length)`, diving to L0.
    pub fn debug_free_l0(&self, offset: u64, length: u64) -> u64 {
        self.inner.lock().debug_free_l0(offset, length)
    }

    /// Free granules in `[offset, offset + length)`, counted from L1
    /// summaries (diving to L0 only for PARTIAL entries).
    pub fn debug_free_l1(&self, offset: u64, length: u64) -> u64 {
        self.inner.lock().debug_free_l1(offset, length)
    }

    /// A snapshot of activity counters plus a free-run-length histogram.
    pub fn collect_stats(&self) -> (Stats, BTreeMap<u32, u64>) {
        let inner = self.inner.lock();
        (inner.stats, stats::collect_free_run_histogram(&inner.leaf))
    }

    /// Releases the allocator. Present for symmetry with the teacher's
    /// `Allocator` lifecycle; there is no external resource to tear down.
    pub fn shutdown(self) {
        debug!("bitmap allocator shutdown");
    }
}

#[cfg(test)]
pub(crate) fn logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_allocator() -> BitmapAllocator {
        BitmapAllocator::init(AllocatorConfig {
            capacity: 4096 * 1024,
            alloc_unit: 4096,
            initial_free: true,
        })
        .unwrap()
    }

    #[test]
    fn init_reports_full_capacity_available() {
        logging();
        let a = small_allocator();
        assert_eq!(a.available(), 4096 * 1024);
    }

    #[test]
    fn allocate_and_release_round_trip() {
        logging();
        let a = small_allocator();
        let res = a.allocate(4096 * 16, 4096, 0, 0).unwrap();
        let allocated: u64 = res.iter().map(|iv| iv.length).sum();
        assert_eq!(allocated, 4096 * 16);
        assert_eq!(a.available(), 4096 * 1024 - 4096 * 16);
        a.release(&res).unwrap();
        assert_eq!(a.available(), 4096 * 1024);
    }

    #[test]
    fn mark_allocated_then_mark_free_round_trip() {
        logging();
        let a = small_allocator();
        a.mark_allocated(0, 4096 * 8).unwrap();
        assert_eq!(a.available(), 4096 * 1024 - 4096 * 8);
        a.mark_free(0, 4096 * 8).unwrap();
        assert_eq!(a.available(), 4096 * 1024);
    }

    #[test]
    fn copy_mark_advances_ladder_and_survives_one_release() {
        logging();
        let a = small_allocator();
        let res = a.allocate(4096, 4096, 0, 0).unwrap();
        let offset = res[0].offset;
        a.copy_mark(offset).unwrap();
        // Shared twice now (original alloc + one copy_mark); releasing
        // once must not free the granule yet since copy_mark never
        // updates L1/L2, so `available` should not reflect it as free
        // until the granule returns to FULL via enough frees.
        // (copy_mark's own release path is a Non-goal here: dropping a
        // share is expressed via the allocator's own accounting, not by
        // calling `release` again on the same bytes.)
        assert_eq!(a.available(), 4096 * 1024 - 4096);
    }

    #[test]
    fn copy_mark_refuses_on_free_granule() {
        logging();
        let a = small_allocator();
        assert!(a.copy_mark(0).is_err());
    }

    #[test]
    fn allocate_rejects_misaligned_min_length() {
        logging();
        let a = small_allocator();
        assert_eq!(
            a.allocate(4096, 3000, 0, 0).unwrap_err(),
            Error::InvalidArgument("min_length must be a nonzero power of two")
        );
    }

    #[test]
    fn allocate_rejects_length_not_multiple_of_min_length() {
        logging();
        let a = small_allocator();
        assert_eq!(
            a.allocate(4096 * 3, 4096 * 2, 0, 0).unwrap_err(),
            Error::InvalidArgument("length must be a multiple of min_length")
        );
    }

    #[test]
    fn exhausted_allocation_returns_error() {
        logging();
        let a = small_allocator();
        let total = a.available();
        a.allocate(total, 4096, 0, 0).unwrap();
        assert_eq!(a.allocate(4096, 4096, 0, 0).unwrap_err(), Error::Exhausted);
    }

    #[test]
    fn fragmentation_rises_after_partial_allocation() {
        logging();
        let a = small_allocator();
        assert_eq!(a.fragmentation(), 0.0);
        a.allocate(4096, 4096, 0, 0).unwrap();
        assert!(a.fragmentation() > 0.0);
    }
}
