//! Round-robin scheduler: a FIFO queue of live cell ids plus the slice-size
//! computation.

use std::collections::VecDeque;

use rand::Rng;
use rand::rngs::SmallRng;

use crate::{CellId, TierraConfig};

/// Rotating queue of live cells. The head is the cell that runs next; after
/// its slice it rotates to the tail.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: VecDeque<CellId>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scheduled cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The cell that runs next.
    #[must_use]
    pub fn front(&self) -> Option<CellId> {
        self.queue.front().copied()
    }

    /// Enqueue a newborn at the tail.
    pub fn push(&mut self, id: CellId) {
        self.queue.push_back(id);
    }

    /// Drop a cell from the queue (on death).
    pub fn remove(&mut self, id: CellId) {
        if let Some(index) = self.queue.iter().position(|&queued| queued == id) {
            self.queue.remove(index);
        }
    }

    /// Rotate the head to the tail after its slice.
    pub fn rotate(&mut self) {
        if let Some(id) = self.queue.pop_front() {
            self.queue.push_back(id);
        }
    }

    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.queue.contains(&id)
    }

    /// Queue position of a cell, head first.
    #[must_use]
    pub fn position(&self, id: CellId) -> Option<usize> {
        self.queue.iter().position(|&queued| queued == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = CellId> + '_ {
        self.queue.iter().copied()
    }
}

/// Compute the slice granted to a cell for one turn.
///
/// With `siz_dep_slice` set the base scales as
/// `slice_size * (cell_len / mean_len) ^ slice_pow`; slice style 2 then
/// replaces the result with `fix_frac * base + uniform(0, ran_frac * base)`.
/// The slice is never below one instruction.
#[must_use]
pub fn compute_slice(
    config: &TierraConfig,
    cell_len: usize,
    mean_len: usize,
    rng: &mut SmallRng,
) -> u32 {
    let base = if config.siz_dep_slice == 0 {
        f64::from(config.slice_size)
    } else {
        let ratio = cell_len as f64 / mean_len.max(1) as f64;
        f64::from(config.slice_size) * ratio.powf(config.slice_pow)
    };
    let sized = if config.slice_style == 2 {
        config.slic_fix_frac * base + rng.random::<f64>() * config.slic_ran_frac * base
    } else {
        base
    };
    (sized.round() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<CellId> {
        let mut slots: SlotMap<CellId, ()> = SlotMap::with_key();
        (0..n).map(|_| slots.insert(())).collect()
    }

    #[test]
    fn rotation_is_round_robin() {
        let ids = ids(3);
        let mut scheduler = Scheduler::new();
        for &id in &ids {
            scheduler.push(id);
        }
        assert_eq!(scheduler.front(), Some(ids[0]));
        scheduler.rotate();
        assert_eq!(scheduler.front(), Some(ids[1]));
        scheduler.rotate();
        scheduler.rotate();
        assert_eq!(scheduler.front(), Some(ids[0]));
    }

    #[test]
    fn removal_keeps_order() {
        let ids = ids(3);
        let mut scheduler = Scheduler::new();
        for &id in &ids {
            scheduler.push(id);
        }
        scheduler.remove(ids[1]);
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.position(ids[2]), Some(1));
        assert!(!scheduler.contains(ids[1]));
    }

    #[test]
    fn fixed_slice_ignores_size() {
        let config = TierraConfig {
            slice_style: 0,
            slice_size: 25,
            siz_dep_slice: 0,
            ..TierraConfig::default()
        };
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(compute_slice(&config, 40, 80, &mut rng), 25);
        assert_eq!(compute_slice(&config, 160, 80, &mut rng), 25);
    }

    #[test]
    fn size_dependent_slice_scales_with_ratio() {
        let config = TierraConfig {
            slice_style: 0,
            slice_size: 20,
            siz_dep_slice: 1,
            slice_pow: 1.0,
            ..TierraConfig::default()
        };
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(compute_slice(&config, 160, 80, &mut rng), 40);
        assert_eq!(compute_slice(&config, 40, 80, &mut rng), 10);
    }

    #[test]
    fn style_two_stays_within_the_random_band() {
        let config = TierraConfig {
            slice_style: 2,
            slice_size: 25,
            siz_dep_slice: 0,
            slic_fix_frac: 0.5,
            slic_ran_frac: 1.0,
            ..TierraConfig::default()
        };
        let mut rng = SmallRng::seed_from_u64(9);
        for _ in 0..200 {
            let slice = compute_slice(&config, 80, 80, &mut rng);
            assert!((12..=38).contains(&slice), "slice {slice} out of band");
        }
    }
}
