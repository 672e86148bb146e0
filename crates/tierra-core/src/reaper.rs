//! The reaper queue: live cells ordered by reapability, most reapable at
//! the head.
//!
//! Insertion order is birth order, so age drifts cells toward the head.
//! Error events and the lazy-tolerance check promote cells faster. The
//! queue only orders candidates; the simulation performs the actual kill
//! and cleanup.

use rand::Rng;
use rand::rngs::SmallRng;
use slotmap::SlotMap;

use crate::cell::Cell;
use crate::{CellId, modular_distance};

/// Ordered kill queue. Index 0 is the next to die under allocation
/// pressure.
#[derive(Debug, Default)]
pub struct Reaper {
    queue: Vec<CellId>,
}

impl Reaper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueue a newborn at the tail, the safest position.
    pub fn push(&mut self, id: CellId) {
        self.queue.push(id);
    }

    /// Drop a cell from the queue (on death).
    pub fn remove(&mut self, id: CellId) {
        self.queue.retain(|&queued| queued != id);
    }

    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.queue.contains(&id)
    }

    /// Queue position of a cell; 0 is the head.
    #[must_use]
    pub fn position(&self, id: CellId) -> Option<usize> {
        self.queue.iter().position(|&queued| queued == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = CellId> + '_ {
        self.queue.iter().copied()
    }

    /// Move a cell one position toward the head (lazy-tolerance pressure).
    pub fn promote(&mut self, id: CellId) {
        if let Some(index) = self.position(id)
            && index > 0
        {
            self.queue.swap(index - 1, index);
        }
    }

    /// Error-driven promotion: a cell that just raised its error flag passes
    /// its predecessor when its cumulative error count is at least as high.
    pub fn note_error(&mut self, id: CellId, cells: &SlotMap<CellId, Cell>) {
        let Some(index) = self.position(id) else {
            return;
        };
        if index == 0 {
            return;
        }
        let ahead = self.queue[index - 1];
        let own_errors = cells.get(id).map_or(0, |cell| cell.demo.errors);
        let ahead_errors = cells.get(ahead).map_or(0, |cell| cell.demo.errors);
        if own_errors >= ahead_errors {
            self.queue.swap(index - 1, index);
        }
    }

    /// Pick an allocation-failure victim from the head window of the queue.
    /// `reap_rnd_prop` bounds the window; 0 degenerates to exactly the
    /// head. The currently executing cell is never chosen.
    #[must_use]
    pub fn select_victim(
        &self,
        reap_rnd_prop: f64,
        exclude: Option<CellId>,
        rng: &mut SmallRng,
    ) -> Option<CellId> {
        if self.queue.is_empty() {
            return None;
        }
        let window = ((self.queue.len() as f64 * reap_rnd_prop) as usize).max(1);
        let mut index = if window < 2 {
            0
        } else {
            rng.random_range(0..window)
        };
        if Some(self.queue[index]) == exclude {
            index = (index + 1) % window.min(self.queue.len());
            if Some(self.queue[index]) == exclude {
                return None;
            }
        }
        Some(self.queue[index])
    }

    /// Near-address victim selection: the oldest cell whose mother region
    /// starts within `max_dist` (modular) of `addr`.
    #[must_use]
    pub fn select_near(
        &self,
        addr: usize,
        max_dist: usize,
        soup_size: usize,
        exclude: Option<CellId>,
        cells: &SlotMap<CellId, Cell>,
    ) -> Option<CellId> {
        self.queue.iter().copied().find(|&candidate| {
            if Some(candidate) == exclude {
                return false;
            }
            cells.get(candidate).is_some_and(|cell| {
                modular_distance(cell.mother.start, addr, soup_size) <= max_dist
            })
        })
    }
}
