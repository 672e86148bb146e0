//! Stochastic variation: cosmic rays, copy mutation, execution flaws, and
//! the genetic operators applied to daughter genomes on divide.
//!
//! Rates derive from "generations per event" settings and the current mean
//! cell size: `rate = 1 / (gen_per_x * mean_cell_size)` per instruction; a
//! setting of 0 disables the channel.

use rand::Rng;
use rand::rngs::SmallRng;

use crate::cell::Region;
use crate::events::{GeneticOp, MutationKind, SimEvent};
use crate::simulation::Simulation;
use crate::{CellId, TierraConfig};

/// Derived per-instruction mutation rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationEngine {
    rate_cosmic: f64,
    rate_flaw: f64,
    pub(crate) rate_copy: f64,
}

impl MutationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute rates from the configuration and the population's current
    /// mean cell size.
    pub fn update_rates(&mut self, config: &TierraConfig, mean_cell_size: usize) {
        let mean = mean_cell_size.max(1) as f64;
        let derive = |gen_per: u32| {
            if gen_per == 0 {
                0.0
            } else {
                1.0 / (f64::from(gen_per) * mean)
            }
        };
        self.rate_cosmic = derive(config.gen_per_bkg_mut);
        self.rate_flaw = derive(config.gen_per_flaw);
        self.rate_copy = derive(config.gen_per_mov_mut);
    }

    /// Per-instruction cosmic ray probability.
    #[must_use]
    pub fn rate_cosmic(&self) -> f64 {
        self.rate_cosmic
    }

    /// Per-instruction execution flaw probability.
    #[must_use]
    pub fn rate_flaw(&self) -> f64 {
        self.rate_flaw
    }

    /// Per-`movii` copy mutation probability.
    #[must_use]
    pub fn rate_copy(&self) -> f64 {
        self.rate_copy
    }

    /// Draw the flaw offset for one register write: usually 0, rarely ±1.
    pub(crate) fn flaw(&self, rng: &mut SmallRng) -> i32 {
        if self.rate_flaw <= 0.0 || rng.random::<f64>() >= self.rate_flaw {
            return 0;
        }
        if rng.random::<bool>() { 1 } else { -1 }
    }
}

/// Perturb a single opcode: with probability `mut_bit_prop` flip one of the
/// low 5 bits, otherwise replace it with a uniformly random opcode.
pub(crate) fn mutate_opcode(value: u8, mut_bit_prop: f64, rng: &mut SmallRng) -> u8 {
    if rng.random::<f64>() < mut_bit_prop {
        value ^ (1 << rng.random_range(0..5u8))
    } else {
        rng.random_range(0..32u8)
    }
}

/// Flip a random soup byte, bypassing memory protection.
pub(crate) fn cosmic_ray(sim: &mut Simulation) {
    let addr = sim.rng.random_range(0..sim.soup.size());
    let value = sim.soup.read(addr);
    let mutated = mutate_opcode(value, sim.config.mut_bit_prop, &mut sim.rng);
    sim.soup.write(addr, mutated);
    sim.events.emit(SimEvent::Mutation {
        kind: MutationKind::Cosmic,
        cell: None,
    });
}

/// One independent trigger draw per divide for an operator class.
fn fires(rng: &mut SmallRng, gen_per: u32) -> bool {
    gen_per > 0 && rng.random::<f64>() < 1.0 / f64::from(gen_per)
}

/// Apply the genetic operators to the daughter genome in place, in the
/// historical order: point mutations, crossovers, insertion, deletion, then
/// the segment-level variants. Operators that change the genome length
/// resize the daughter region; when growth cannot be satisfied the operator
/// is aborted and the genome left untouched.
pub(crate) fn apply_genetic_operators(sim: &mut Simulation, id: CellId) {
    if sim.cells[id].daughter.is_none() {
        return;
    }
    point_mutation(sim, id);
    crossover_same_size(sim, id);
    crossover(sim, id);
    insertion(sim, id);
    deletion(sim, id);
    segment_crossover(sim, id);
    segment_insertion(sim, id);
    segment_deletion(sim, id);
}

fn record(sim: &mut Simulation, id: CellId, op: GeneticOp) {
    sim.cells[id].demo.mutations += 1;
    sim.events.emit(SimEvent::Mutation {
        kind: MutationKind::Genetic(op),
        cell: Some(id),
    });
}

/// Pick a random living cell other than `exclude`, optionally restricted to
/// a mother-region length.
fn random_mate(sim: &mut Simulation, exclude: CellId, want_len: Option<usize>) -> Option<CellId> {
    let candidates: Vec<CellId> = sim
        .cells
        .iter()
        .filter(|(cell_id, cell)| {
            *cell_id != exclude && want_len.is_none_or(|len| cell.mother.len == len)
        })
        .map(|(cell_id, _)| cell_id)
        .collect();
    if candidates.is_empty() {
        None
    } else {
        Some(candidates[sim.rng.random_range(0..candidates.len())])
    }
}

/// Replace the daughter genome with `buf`, resizing the region when the
/// length changed. Aborts silently if the region cannot grow.
fn commit(sim: &mut Simulation, id: CellId, old: Region, buf: &[u8], op: GeneticOp) {
    let Some(region) = sim.soup.try_resize(old, buf.len()) else {
        return;
    };
    sim.soup.write_block(region.start, buf);
    let cell = &mut sim.cells[id];
    cell.daughter = Some(region);
    cell.demo.mov_count = cell.demo.mov_count.min(region.len as u32);
    record(sim, id, op);
}

fn point_mutation(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_div_mut) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    let addr = daughter.start + sim.rng.random_range(0..daughter.len);
    let value = sim.soup.read(addr);
    let mutated = mutate_opcode(value, sim.config.mut_bit_prop, &mut sim.rng);
    sim.soup.write(addr, mutated);
    record(sim, id, GeneticOp::PointMutation);
}

/// Exchange a tail with a randomly chosen genome of the same size.
fn crossover_same_size(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_cro_ins_sam_siz) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    if daughter.len < 2 {
        return;
    }
    let Some(mate) = random_mate(sim, id, Some(daughter.len)) else {
        return;
    };
    let mate_region = sim.cells[mate].mother;
    let cross = sim.rng.random_range(1..daughter.len);
    for i in cross..daughter.len {
        let value = sim.soup.read(mate_region.start + i);
        sim.soup.write(daughter.start + i, value);
    }
    record(sim, id, GeneticOp::CrossoverSameSize);
}

/// Size-changing crossover: keep a head of the daughter and graft a tail
/// from a random living genome.
fn crossover(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_cro_ins) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    if daughter.len < 2 {
        return;
    }
    let Some(mate) = random_mate(sim, id, None) else {
        return;
    };
    let mate_region = sim.cells[mate].mother;
    if mate_region.len < 2 {
        return;
    }
    let cross_d = sim.rng.random_range(1..daughter.len);
    let cross_m = sim.rng.random_range(1..mate_region.len);
    let tail_len = mate_region.len - cross_m;
    if cross_d + tail_len < sim.config.min_cell_size {
        return;
    }
    let mut buf = sim.soup.read_region(Region::new(daughter.start, cross_d));
    buf.extend(
        sim.soup
            .read_region(Region::new(mate_region.start + cross_m, tail_len)),
    );
    commit(sim, id, daughter, &buf, GeneticOp::Crossover);
}

/// Insert one random instruction, growing the genome by a byte.
fn insertion(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_ins_ins) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    let mut buf = sim.soup.read_region(daughter);
    let pos = sim.rng.random_range(0..=buf.len());
    let value = sim.rng.random_range(0..32u8);
    buf.insert(pos, value);
    commit(sim, id, daughter, &buf, GeneticOp::Insertion);
}

/// Delete one random instruction, shrinking the genome by a byte.
fn deletion(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_del_ins) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    if daughter.len <= sim.config.min_cell_size {
        return;
    }
    let mut buf = sim.soup.read_region(daughter);
    let pos = sim.rng.random_range(0..buf.len());
    buf.remove(pos);
    commit(sim, id, daughter, &buf, GeneticOp::Deletion);
}

/// Maximal runs of non-nop instructions, as `(offset, len)` pairs. Segments
/// are bounded by the nop templates around them.
fn segments(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        if buf[i] <= 1 {
            i += 1;
            continue;
        }
        let start = i;
        while i < buf.len() && buf[i] > 1 {
            i += 1;
        }
        found.push((start, i - start));
    }
    found
}

/// Replace a random daughter segment with a random segment from a mate.
fn segment_crossover(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_cro_seg) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    let Some(mate) = random_mate(sim, id, None) else {
        return;
    };
    let mate_genome = sim.soup.read_region(sim.cells[mate].mother);
    let buf = sim.soup.read_region(daughter);
    let own_segments = segments(&buf);
    let mate_segments = segments(&mate_genome);
    if own_segments.is_empty() || mate_segments.is_empty() {
        return;
    }
    let (d_off, d_len) = own_segments[sim.rng.random_range(0..own_segments.len())];
    let (m_off, m_len) = mate_segments[sim.rng.random_range(0..mate_segments.len())];
    let mut patched = Vec::with_capacity(buf.len() - d_len + m_len);
    patched.extend_from_slice(&buf[..d_off]);
    patched.extend_from_slice(&mate_genome[m_off..m_off + m_len]);
    patched.extend_from_slice(&buf[d_off + d_len..]);
    if patched.len() < sim.config.min_cell_size {
        return;
    }
    commit(sim, id, daughter, &patched, GeneticOp::SegmentCrossover);
}

/// Duplicate a random daughter segment at a random position.
fn segment_insertion(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_ins_seg) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    let mut buf = sim.soup.read_region(daughter);
    let found = segments(&buf);
    if found.is_empty() {
        return;
    }
    let (offset, len) = found[sim.rng.random_range(0..found.len())];
    let copy = buf[offset..offset + len].to_vec();
    let insert_at = sim.rng.random_range(0..=buf.len());
    buf.splice(insert_at..insert_at, copy);
    commit(sim, id, daughter, &buf, GeneticOp::SegmentInsertion);
}

/// Remove a random daughter segment.
fn segment_deletion(sim: &mut Simulation, id: CellId) {
    if !fires(&mut sim.rng, sim.config.gen_per_del_seg) {
        return;
    }
    let Some(daughter) = sim.cells[id].daughter else {
        return;
    };
    let buf = sim.soup.read_region(daughter);
    let found = segments(&buf);
    if found.is_empty() {
        return;
    }
    let (offset, len) = found[sim.rng.random_range(0..found.len())];
    if buf.len() - len < sim.config.min_cell_size {
        return;
    }
    let mut patched = buf;
    patched.drain(offset..offset + len);
    commit(sim, id, daughter, &patched, GeneticOp::SegmentDeletion);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn rates_derive_from_generations_and_mean_size() {
        let config = TierraConfig {
            gen_per_bkg_mut: 32,
            gen_per_flaw: 0,
            gen_per_mov_mut: 10,
            ..TierraConfig::default()
        };
        let mut engine = MutationEngine::new();
        engine.update_rates(&config, 80);
        assert!((engine.rate_cosmic() - 1.0 / (32.0 * 80.0)).abs() < 1e-12);
        assert_eq!(engine.rate_flaw(), 0.0);
        assert!((engine.rate_copy() - 1.0 / (10.0 * 80.0)).abs() < 1e-12);
    }

    #[test]
    fn disabled_flaw_never_perturbs() {
        let mut engine = MutationEngine::new();
        engine.update_rates(
            &TierraConfig {
                gen_per_flaw: 0,
                ..TierraConfig::default()
            },
            80,
        );
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..1000 {
            assert_eq!(engine.flaw(&mut rng), 0);
        }
    }

    #[test]
    fn mutate_opcode_stays_in_range() {
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..500 {
            let value = mutate_opcode(17, 0.5, &mut rng);
            assert!(value < 32);
        }
        // mut_bit_prop = 0 always rewrites with a random opcode.
        for _ in 0..100 {
            assert!(mutate_opcode(0, 0.0, &mut rng) < 32);
        }
    }

    #[test]
    fn segments_are_nop_bounded_runs() {
        // nop0 nop1 | incA incB | nop0 | shl shl shl | nop1
        let buf = [0, 1, 8, 9, 0, 3, 3, 3, 1];
        assert_eq!(segments(&buf), vec![(2, 2), (5, 3)]);
        assert!(segments(&[0, 1, 0]).is_empty());
        assert_eq!(segments(&[8, 9]), vec![(0, 2)]);
    }
}
