//! The soup: a fixed-length circular byte array plus the free-block index,
//! owner spans, and memory protection checks.
//!
//! Each byte's low 5 bits are an opcode; the upper bits are ignored on read
//! and zeroed on write. All addressing is modular over the soup size. Free
//! blocks are kept sorted, disjoint, and never adjacent (adjacent frees
//! merge immediately), so their union plus all live cell regions always
//! tiles the soup exactly.

use rand::Rng;
use rand::rngs::SmallRng;

use crate::cell::Region;
use crate::{CellId, modular_distance};

/// Protection bit: permission required to execute at an address.
pub const ACCESS_EXECUTE: u8 = 1;
/// Protection bit: permission required to write an address.
pub const ACCESS_WRITE: u8 = 2;
/// Protection bit: permission required to read an address.
pub const ACCESS_READ: u8 = 4;

/// Opcodes occupy the low 5 bits of each soup byte.
pub(crate) const OPCODE_MASK: u8 = 0x1f;

/// The three protection masks, one per ownership class. A set bit *denies*
/// the corresponding access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectionMasks {
    /// Applied when the address lies in free memory.
    pub free: u8,
    /// Applied when the address lies in one of the acting cell's own regions.
    pub mine: u8,
    /// Applied when the address lies in another cell's region.
    pub prot: u8,
}

impl ProtectionMasks {
    /// True when no mask denies anything, letting checks short-circuit.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.free == 0 && self.mine == 0 && self.prot == 0
    }
}

/// Allocation policies for daughter memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// First block (in address order) large enough.
    FirstFit,
    /// Smallest sufficient block, preferring blocks within the oversize
    /// tolerance to favor exact reuse.
    BetterFit,
    /// Uniformly random among sufficient blocks.
    Random,
    /// Sufficient block whose start is closest to the mother's start.
    NearParent,
    /// Sufficient block whose start is closest to a hint address.
    NearAddress,
}

impl AllocPolicy {
    /// Maps the numeric `mal_mode` option onto a policy.
    #[must_use]
    pub fn from_mode(mode: u8) -> Self {
        match mode {
            0 => Self::FirstFit,
            2 => Self::Random,
            3 => Self::NearParent,
            4 => Self::NearAddress,
            _ => Self::BetterFit,
        }
    }
}

/// Shared memory plus its allocation and ownership bookkeeping.
#[derive(Debug)]
pub struct Soup {
    size: usize,
    data: Vec<u8>,
    /// Sorted by start; disjoint; never adjacent.
    free: Vec<Region>,
    /// Sorted by start; one span per live region (mother or daughter).
    owners: Vec<(Region, CellId)>,
}

impl Soup {
    /// A soup of `size` zeroed bytes, entirely free.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            data: vec![0; size],
            free: vec![Region::new(0, size)],
            owners: Vec::new(),
        }
    }

    /// Soup length in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Read the opcode stored at `addr` (modular).
    #[inline]
    #[must_use]
    pub fn read(&self, addr: usize) -> u8 {
        self.data[addr % self.size] & OPCODE_MASK
    }

    /// Write an opcode at `addr` (modular); upper bits are dropped.
    #[inline]
    pub fn write(&mut self, addr: usize, value: u8) {
        let idx = addr % self.size;
        self.data[idx] = value & OPCODE_MASK;
    }

    /// Copy a region out of the soup, wrapping at the end.
    #[must_use]
    pub fn read_region(&self, region: Region) -> Vec<u8> {
        (0..region.len)
            .map(|i| self.read(region.start + i))
            .collect()
    }

    /// Write a byte sequence starting at `start`, wrapping at the end.
    pub fn write_block(&mut self, start: usize, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.write(start + i, byte);
        }
    }

    /// Fill a region with uniformly random opcodes (dead-soup decay).
    pub fn randomize_region(&mut self, region: Region, rng: &mut SmallRng) {
        for i in 0..region.len {
            let value = rng.random_range(0..32u8);
            self.write(region.start + i, value);
        }
    }

    // --- free-block index ---

    /// The current free blocks, sorted by address.
    #[must_use]
    pub fn free_blocks(&self) -> &[Region] {
        &self.free
    }

    /// Total free bytes.
    #[must_use]
    pub fn total_free(&self) -> usize {
        self.free.iter().map(|block| block.len).sum()
    }

    /// Allocate `len` bytes under `policy`. `hint` is the reference address
    /// for the near policies; `mal_tol` is the better-fit oversize
    /// tolerance. Returns `None` when no sufficient block exists.
    pub fn allocate(
        &mut self,
        len: usize,
        policy: AllocPolicy,
        hint: Option<usize>,
        mal_tol: usize,
        rng: &mut SmallRng,
    ) -> Option<Region> {
        if len == 0 {
            return None;
        }
        let index = match policy {
            AllocPolicy::FirstFit => self.free.iter().position(|block| block.len >= len),
            AllocPolicy::BetterFit => self.better_fit(len, mal_tol),
            AllocPolicy::Random => {
                let adequate: Vec<usize> = (0..self.free.len())
                    .filter(|&i| self.free[i].len >= len)
                    .collect();
                if adequate.is_empty() {
                    None
                } else {
                    Some(adequate[rng.random_range(0..adequate.len())])
                }
            }
            AllocPolicy::NearParent | AllocPolicy::NearAddress => {
                let hint = hint?;
                (0..self.free.len())
                    .filter(|&i| self.free[i].len >= len)
                    .min_by_key(|&i| modular_distance(self.free[i].start, hint, self.size))
            }
        }?;

        let block = self.free[index];
        if block.len == len {
            self.free.remove(index);
        } else {
            self.free[index] = Region::new(block.start + len, block.len - len);
        }
        Some(Region::new(block.start, len))
    }

    /// Smallest sufficient block, preferring blocks no more than `mal_tol`
    /// bytes oversized; falls back to the global smallest fit.
    fn better_fit(&self, len: usize, mal_tol: usize) -> Option<usize> {
        let within = (0..self.free.len())
            .filter(|&i| self.free[i].len >= len && self.free[i].len <= len + mal_tol)
            .min_by_key(|&i| self.free[i].len);
        within.or_else(|| {
            (0..self.free.len())
                .filter(|&i| self.free[i].len >= len)
                .min_by_key(|&i| self.free[i].len)
        })
    }

    /// Claim a specific region (used during inoculation). Fails unless the
    /// region lies entirely inside one free block.
    pub fn allocate_at(&mut self, region: Region) -> bool {
        let Some(index) = self.free.iter().position(|block| {
            block.start <= region.start && block.end() >= region.end()
        }) else {
            return false;
        };
        let block = self.free.remove(index);
        let mut insert_at = index;
        if block.start < region.start {
            self.free
                .insert(insert_at, Region::new(block.start, region.start - block.start));
            insert_at += 1;
        }
        if block.end() > region.end() {
            self.free
                .insert(insert_at, Region::new(region.end(), block.end() - region.end()));
        }
        true
    }

    /// Return a region to the free index, merging with adjacent blocks.
    pub fn deallocate(&mut self, region: Region) {
        if region.len == 0 {
            return;
        }
        let index = self
            .free
            .partition_point(|block| block.start < region.start);
        self.free.insert(index, region);

        if index + 1 < self.free.len() && self.free[index].end() == self.free[index + 1].start {
            self.free[index].len += self.free[index + 1].len;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].end() == self.free[index].start {
            self.free[index - 1].len += self.free[index].len;
            self.free.remove(index);
        }
        debug_assert!(self.free_index_is_coherent());
    }

    /// Resize an allocated region in place. Growth requires free space
    /// immediately past the region's tail; shrinking frees the tail. The
    /// owner span, if registered, follows the new bounds. Returns the new
    /// region, or `None` when growth cannot be satisfied.
    pub fn try_resize(&mut self, region: Region, new_len: usize) -> Option<Region> {
        if new_len == 0 {
            return None;
        }
        let resized = if new_len == region.len {
            region
        } else if new_len < region.len {
            self.deallocate(Region::new(region.start + new_len, region.len - new_len));
            Region::new(region.start, new_len)
        } else {
            let extra = new_len - region.len;
            let index = self
                .free
                .iter()
                .position(|block| block.start == region.end() && block.len >= extra)?;
            let block = self.free[index];
            if block.len == extra {
                self.free.remove(index);
            } else {
                self.free[index] = Region::new(block.start + extra, block.len - extra);
            }
            Region::new(region.start, new_len)
        };
        if let Some(entry) = self.owners.iter_mut().find(|(span, _)| *span == region) {
            entry.0 = resized;
        }
        Some(resized)
    }

    /// Sanity predicate used by tests: sorted, disjoint, never adjacent.
    #[must_use]
    pub fn free_index_is_coherent(&self) -> bool {
        self.free
            .windows(2)
            .all(|pair| pair[0].end() < pair[1].start)
            && self.free.iter().all(|block| block.len > 0)
    }

    // --- ownership ---

    /// Register `cell` as the owner of `region`.
    pub fn add_owner(&mut self, region: Region, cell: CellId) {
        let index = self
            .owners
            .partition_point(|(span, _)| span.start < region.start);
        self.owners.insert(index, (region, cell));
    }

    /// Drop the span registered for exactly `region`, if any.
    pub fn remove_owner(&mut self, region: Region) {
        self.owners.retain(|(span, _)| *span != region);
    }

    /// Reassign an exact span to a different cell (daughter hand-off).
    pub fn transfer_owner(&mut self, region: Region, cell: CellId) {
        if let Some(entry) = self.owners.iter_mut().find(|(span, _)| *span == region) {
            entry.1 = cell;
        }
    }

    /// The cell owning `addr`, if the address is allocated.
    #[must_use]
    pub fn owner_at(&self, addr: usize) -> Option<CellId> {
        let addr = addr % self.size;
        let index = self.owners.partition_point(|(span, _)| span.start <= addr);
        if index == 0 {
            return None;
        }
        let (span, cell) = self.owners[index - 1];
        (addr < span.end()).then_some(cell)
    }

    /// Check an access against the protection masks. Returns `false` on a
    /// violation (the caller raises the CPU error flag).
    #[must_use]
    pub fn check_access(
        &self,
        addr: usize,
        cell: CellId,
        masks: ProtectionMasks,
        access: u8,
    ) -> bool {
        if masks.is_disabled() {
            return true;
        }
        let mask = match self.owner_at(addr) {
            None => masks.free,
            Some(owner) if owner == cell => masks.mine,
            Some(_) => masks.prot,
        };
        mask & access == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    fn soup_with_free(blocks: &[(usize, usize)], size: usize) -> Soup {
        let mut soup = Soup::new(size);
        soup.free.clear();
        for &(start, len) in blocks {
            soup.free.push(Region::new(start, len));
        }
        soup
    }

    #[test]
    fn modular_read_write() {
        let mut soup = Soup::new(100);
        soup.write(105, 31);
        assert_eq!(soup.read(5), 31);
        assert_eq!(soup.read(205), 31);
        // Upper bits are zeroed on write.
        soup.write(0, 0xff);
        assert_eq!(soup.read(0), 0x1f);
    }

    #[test]
    fn first_fit_takes_first_sufficient_block() {
        let mut soup = soup_with_free(&[(0, 10), (20, 50), (100, 30)], 200);
        let region = soup
            .allocate(25, AllocPolicy::FirstFit, None, 0, &mut rng())
            .expect("allocation");
        assert_eq!(region, Region::new(20, 25));
        assert_eq!(soup.free_blocks()[1], Region::new(45, 25));
    }

    #[test]
    fn better_fit_prefers_within_tolerance() {
        // Request 40 with no tolerance: the exact 40-byte block wins.
        let mut soup = soup_with_free(&[(0, 40), (50, 80), (140, 50)], 400);
        let region = soup
            .allocate(40, AllocPolicy::BetterFit, None, 0, &mut rng())
            .expect("allocation");
        assert_eq!(region.start, 0);

        // Request 40 with tolerance 15: the 45-byte block is the smallest
        // inside the window even though 80 and 50 also fit.
        let mut soup = soup_with_free(&[(0, 80), (90, 45), (140, 50)], 400);
        let region = soup
            .allocate(40, AllocPolicy::BetterFit, None, 15, &mut rng())
            .expect("allocation");
        assert_eq!(region.start, 90);
    }

    #[test]
    fn better_fit_falls_back_outside_tolerance() {
        let mut soup = soup_with_free(&[(0, 80), (100, 90)], 400);
        let region = soup
            .allocate(40, AllocPolicy::BetterFit, None, 10, &mut rng())
            .expect("allocation");
        assert_eq!(region.start, 0, "smallest sufficient block wins");
    }

    #[test]
    fn near_policy_minimizes_modular_distance() {
        let mut soup = soup_with_free(&[(10, 30), (180, 30)], 200);
        let region = soup
            .allocate(20, AllocPolicy::NearAddress, Some(5), 0, &mut rng())
            .expect("allocation");
        // 180 is 25 away from 5 modulo 200; 10 is 5 away.
        assert_eq!(region.start, 10);
    }

    #[test]
    fn free_merges_adjacent_blocks() {
        let mut soup = Soup::new(100);
        let a = soup
            .allocate(30, AllocPolicy::FirstFit, None, 0, &mut rng())
            .unwrap();
        let b = soup
            .allocate(30, AllocPolicy::FirstFit, None, 0, &mut rng())
            .unwrap();
        assert_eq!(soup.free_blocks().len(), 1);
        soup.deallocate(a);
        assert_eq!(soup.free_blocks().len(), 2);
        soup.deallocate(b);
        // a, b, and the tail all coalesce back into one block.
        assert_eq!(soup.free_blocks(), &[Region::new(0, 100)]);
        assert!(soup.free_index_is_coherent());
    }

    #[test]
    fn allocate_at_splits_the_containing_block() {
        let mut soup = Soup::new(100);
        assert!(soup.allocate_at(Region::new(40, 20)));
        assert_eq!(
            soup.free_blocks(),
            &[Region::new(0, 40), Region::new(60, 40)]
        );
        assert!(!soup.allocate_at(Region::new(50, 20)), "already taken");
    }

    #[test]
    fn resize_grows_into_the_tail_and_shrinks_back() {
        let mut soup = Soup::new(100);
        let region = soup
            .allocate(20, AllocPolicy::FirstFit, None, 0, &mut rng())
            .unwrap();
        let grown = soup.try_resize(region, 35).expect("grow");
        assert_eq!(grown, Region::new(0, 35));
        assert_eq!(soup.free_blocks(), &[Region::new(35, 65)]);

        let shrunk = soup.try_resize(grown, 10).expect("shrink");
        assert_eq!(shrunk, Region::new(0, 10));
        assert_eq!(soup.free_blocks(), &[Region::new(10, 90)]);

        // Growth past the available tail fails without side effects.
        let blocked = soup.try_resize(shrunk, 200);
        assert!(blocked.is_none());
        assert_eq!(soup.free_blocks(), &[Region::new(10, 90)]);
    }

    #[test]
    fn owner_lookup_and_protection() {
        let mut soup = Soup::new(100);
        let mut cells = slotmap::SlotMap::<CellId, ()>::with_key();
        let me = cells.insert(());
        let other = cells.insert(());
        soup.add_owner(Region::new(10, 20), me);
        soup.add_owner(Region::new(50, 20), other);

        assert_eq!(soup.owner_at(15), Some(me));
        assert_eq!(soup.owner_at(55), Some(other));
        assert_eq!(soup.owner_at(40), None);

        // Write-protect other creatures' memory.
        let masks = ProtectionMasks {
            free: 0,
            mine: 0,
            prot: ACCESS_WRITE,
        };
        assert!(soup.check_access(15, me, masks, ACCESS_WRITE));
        assert!(soup.check_access(40, me, masks, ACCESS_WRITE));
        assert!(!soup.check_access(55, me, masks, ACCESS_WRITE));
        assert!(soup.check_access(55, me, masks, ACCESS_READ));

        soup.remove_owner(Region::new(50, 20));
        assert_eq!(soup.owner_at(55), None);
    }

    #[test]
    fn transfer_owner_reassigns_a_span() {
        let mut soup = Soup::new(100);
        let mut cells = slotmap::SlotMap::<CellId, ()>::with_key();
        let mother = cells.insert(());
        let daughter = cells.insert(());
        soup.add_owner(Region::new(0, 30), mother);
        soup.transfer_owner(Region::new(0, 30), daughter);
        assert_eq!(soup.owner_at(10), Some(daughter));
    }
}
