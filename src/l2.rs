//! L2 top layer: a 1-bit-per-group "not all FULL" bitmap over the L1
//! middle layer, plus the two-pass wrap-around hint scan that drives the
//! public allocate operation.
//!
//! Each L2 bit summarizes one *group* of 256 L1 entries (8 L1 slots):
//! `1` means the group has at least one non-FULL L1 entry and is worth
//! descending into; `0` means skip it outright.

use log::debug;

use crate::bits;
use crate::extent::{ExtentVec, Interval};
use crate::l0::Leaf;
use crate::l1::Middle;

const L1_ENTRIES_PER_GROUP: usize = 256;
const BITS_PER_SLOT: usize = 64;

#[derive(Debug)]
pub struct Top {
    bits: Vec<u64>,
    group_count: usize,
    last_pos: usize,
}

impl Top {
    pub fn new(l1_entry_count: usize, mark_as_free: bool) -> Self {
        let group_count = l1_entry_count.div_ceil(L1_ENTRIES_PER_GROUP);
        let slot_count = group_count.div_ceil(BITS_PER_SLOT);
        let fill = if mark_as_free { u64::MAX } else { 0 };
        Self {
            bits: vec![fill; slot_count],
            group_count,
            last_pos: 0,
        }
    }

    pub fn group_count(&self) -> usize {
        self.group_count
    }

    fn get_bit(&self, group: usize) -> bool {
        let slot = self.bits[group / BITS_PER_SLOT];
        (slot >> (group % BITS_PER_SLOT)) & 1 != 0
    }

    fn set_bit(&mut self, group: usize, value: bool) {
        let slot = &mut self.bits[group / BITS_PER_SLOT];
        if value {
            *slot |= 1 << (group % BITS_PER_SLOT);
        } else {
            *slot &= !(1 << (group % BITS_PER_SLOT));
        }
    }

    fn group_range(&self, middle: &Middle, group: usize) -> (usize, usize) {
        let lo = group * L1_ENTRIES_PER_GROUP;
        let hi = (lo + L1_ENTRIES_PER_GROUP).min(middle.entry_count());
        (lo, hi)
    }

    pub fn refresh_group(&mut self, middle: &Middle, group: usize) {
        let (lo, hi) = self.group_range(middle, group);
        let not_full = !middle.is_empty(lo, hi);
        self.set_bit(group, not_full);
    }

    /// Two-pass wrap-around scan for the next group with the "not all
    /// FULL" bit set, starting at `self.last_pos`: first `[last_pos,
    /// group_count)`, then `[0, last_pos)` on a second pass.
    fn next_candidate(&self, after: usize) -> Option<usize> {
        let scan = |lo: usize, hi: usize| -> Option<usize> {
            if lo >= hi {
                return None;
            }
            let mut slot_idx = lo / BITS_PER_SLOT;
            let mut bit = lo % BITS_PER_SLOT;
            while slot_idx * BITS_PER_SLOT < hi {
                let word = self.bits[slot_idx];
                let found = bits::next_set_bit(word, bit);
                let candidate = slot_idx * BITS_PER_SLOT + found;
                if found < BITS_PER_SLOT && candidate < hi {
                    return Some(candidate);
                }
                slot_idx += 1;
                bit = 0;
            }
            None
        };
        scan(after, self.group_count).or_else(|| scan(0, after))
    }

    /// Drives allocation of up to `length` bytes across the whole L1
    /// range, honoring `hint` (a byte offset used only to pick the first
    /// group to examine) and `max_length`. Returns the extents allocated;
    /// `allocated < length` means the request was only partially filled.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &mut self,
        middle: &mut Middle,
        leaf: &mut Leaf,
        length: u64,
        min_length: u64,
        max_length: u64,
        hint: u64,
    ) -> (ExtentVec, u64) {
        let mut res = ExtentVec::new();
        let mut allocated = 0u64;
        let granule_group_bytes = middle.l1_granularity() * L1_ENTRIES_PER_GROUP as u64;
        let start_group = if hint == 0 {
            self.last_pos
        } else if granule_group_bytes == 0 {
            0
        } else {
            ((hint / granule_group_bytes) as usize).min(self.group_count.saturating_sub(1))
        };

        let mut pos = start_group;
        let mut visited = 0usize;
        while allocated < length && visited < self.group_count {
            let Some(group) = self.next_candidate(pos) else {
                break;
            };
            visited += 1;
            pos = (group + 1) % self.group_count.max(1);

            let (lo, hi) = self.group_range(middle, group);
            let empty = middle.allocate_l1(leaf, length, min_length, max_length, lo, hi, &mut allocated, &mut res);
            self.set_bit(group, !empty);
            self.last_pos = pos;

            if allocated >= length {
                break;
            }
        }
        debug!("l2 allocate: requested {length}, allocated {allocated}, groups visited {visited}");
        (res, allocated)
    }

    /// Marks every extent in `extents` free at L0/L1 and refreshes the
    /// L2 bits for every group touched.
    pub fn free(&mut self, middle: &mut Middle, leaf: &mut Leaf, extents: &[Interval], l0_granularity: u64) {
        for iv in extents {
            if iv.is_empty() {
                continue;
            }
            let lo = (iv.offset / l0_granularity) as usize;
            let hi = (iv.end() / l0_granularity) as usize;
            middle.mark_free_l0_l1(leaf, lo, hi);

            let l1_granularity = middle.l1_granularity();
            let l1_lo = (iv.offset / l1_granularity) as usize;
            let l1_hi = iv.end().div_ceil(l1_granularity) as usize;
            let group_lo = l1_lo / L1_ENTRIES_PER_GROUP;
            let group_hi = l1_hi.div_ceil(L1_ENTRIES_PER_GROUP).max(group_lo + 1);
            for group in group_lo..group_hi.min(self.group_count) {
                self.refresh_group(middle, group);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh(l1_entries: usize, l0_granularity: u64) -> (Top, Middle, Leaf) {
        let leaf = Leaf::new(l1_entries * bits::ENTRIES_PER_SLOTSET, true);
        let middle = Middle::new(l1_entries, l0_granularity, true);
        let top = Top::new(l1_entries, true);
        (top, middle, leaf)
    }

    #[test]
    fn allocate_then_free_restores_bit() {
        let (mut top, mut middle, mut leaf) = fresh(256, 4096);
        let (res, allocated) = top.allocate(&mut middle, &mut leaf, 4096 * 256, 4096, 0, 0);
        assert_eq!(allocated, 4096 * 256);
        assert!(!res.is_empty());
        top.free(&mut middle, &mut leaf, &res, 4096);
        assert!(top.get_bit(0));
    }

    #[test]
    fn allocate_partial_leaves_group_marked() {
        let (mut top, mut middle, mut leaf) = fresh(256, 4096);
        let (res, allocated) = top.allocate(&mut middle, &mut leaf, 4096, 4096, 0, 0);
        assert_eq!(allocated, 4096);
        assert_eq!(res, vec![Interval::new(0, 4096)]);
        assert!(top.get_bit(0));
    }

    #[test]
    fn exhausted_allocation_returns_partial_result() {
        let (mut top, mut middle, mut leaf) = fresh(256, 4096);
        let total = 4096 * 256 * 256;
        let (_res, allocated) = top.allocate(&mut middle, &mut leaf, total, 4096, 0, 0);
        assert_eq!(allocated, total);
        let (_res2, allocated2) = top.allocate(&mut middle, &mut leaf, 4096, 4096, 0, 0);
        assert_eq!(allocated2, 0);
    }
}
