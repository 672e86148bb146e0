//! The simulation: inoculation, the tick loop, reaping, disturbances,
//! snapshots, and run outcomes.
//!
//! One tick runs one scheduler turn: pick the head cell, execute its
//! computed slice (each instruction may mutate, allocate, or divide), apply
//! the lazy-tolerance check, then sample the datalog. The engine is
//! single-threaded and cooperative; hosts drive it tick by tick.

use std::collections::HashMap;
use std::path::PathBuf;

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::Serialize;
use slotmap::SlotMap;
use thiserror::Error;

use crate::cell::{Cell, Region};
use crate::cpu::Flags;
use crate::datalog::{DataLog, SampleStats};
use crate::events::{DeathCause, EventBus, EventSink, SimEvent};
use crate::genebank::{Genebank, SEED_PARENT};
use crate::isa::{self, OpCode};
use crate::mutation::{self, MutationEngine};
use crate::reaper::Reaper;
use crate::scheduler::{self, Scheduler};
use crate::soup::{ACCESS_EXECUTE, Soup};
use crate::{CellId, ConfigError, DEFAULT_CELL_SIZE, TierraConfig};

const MILLION: u64 = 1_000_000;

/// Where an injected genome lands in the soup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Centered in the soup.
    Center,
    /// A uniformly random free position.
    Random,
    /// A fixed start address.
    At(usize),
}

/// Errors raised when injecting a genome.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InoculationError {
    #[error("genome is shorter than min_cell_size")]
    TooSmall,
    #[error("genome does not fit in the soup")]
    TooLarge,
    #[error("no free region can hold the genome")]
    NoSpace,
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TickOutcome {
    Running,
    /// No live cells remain.
    Extinct,
    /// No birth for `drop_dead` million instructions.
    NoReproduction,
}

/// Why a `run` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    InstructionLimit,
    Extinct,
    NoReproduction,
}

/// Read-only value record for one cell.
#[derive(Debug, Clone, Serialize)]
pub struct CellSnapshot {
    pub id: CellId,
    pub mother: Region,
    pub daughter: Option<Region>,
    pub ax: i32,
    pub bx: i32,
    pub cx: i32,
    pub dx: i32,
    pub ip: usize,
    pub sp: usize,
    pub flags: Flags,
    pub genotype: String,
    pub parent_genotype: String,
    pub birth_instruction: u64,
    pub instructions_executed: u64,
    pub mov_count: u32,
    pub offspring: u32,
    pub mutations: u32,
    pub errors: u32,
    pub last_reproduction_instruction: u64,
    pub slice_position: Option<usize>,
    pub reaper_position: Option<usize>,
}

/// Read-only value record for one genotype.
#[derive(Debug, Clone, Serialize)]
pub struct GenotypeSnapshot {
    pub name: String,
    pub size: usize,
    pub parent: String,
    pub origin_instruction: u64,
    pub population: u32,
    pub max_population: u32,
    pub genome: Vec<u8>,
}

/// A complete artificial-life world: soup, queues, RNG, genebank, and the
/// instruction clock.
#[derive(Debug)]
pub struct Simulation {
    pub(crate) config: TierraConfig,
    pub(crate) rng: SmallRng,
    pub(crate) soup: Soup,
    pub(crate) cells: SlotMap<CellId, Cell>,
    pub(crate) scheduler: Scheduler,
    pub(crate) reaper: Reaper,
    pub(crate) mutation: MutationEngine,
    pub(crate) genebank: Genebank,
    pub(crate) events: EventBus,
    pub(crate) datalog: DataLog,
    /// Global instruction counter.
    pub(crate) instructions: u64,
    pub(crate) last_birth_instruction: u64,
    /// Running sum of mother-region lengths, for O(1) mean size.
    pub(crate) total_cell_bytes: usize,
    next_disturbance_at: u64,
    next_milestone_at: u64,
    last_bank_save_at: u64,
    bank_failures: u32,
}

impl Simulation {
    /// Build a world from a validated configuration.
    pub fn new(config: TierraConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = if config.seed == 0 {
            SmallRng::seed_from_u64(rand::random())
        } else {
            SmallRng::seed_from_u64(config.seed)
        };
        let mut mutation = MutationEngine::new();
        mutation.update_rates(&config, DEFAULT_CELL_SIZE);
        Ok(Self {
            soup: Soup::new(config.soup_size),
            rng,
            cells: SlotMap::with_key(),
            scheduler: Scheduler::new(),
            reaper: Reaper::new(),
            mutation,
            genebank: Genebank::new(),
            events: EventBus::new(),
            datalog: DataLog::default(),
            instructions: 0,
            last_birth_instruction: 0,
            total_cell_bytes: 0,
            next_disturbance_at: 0,
            next_milestone_at: MILLION,
            last_bank_save_at: 0,
            bank_failures: 0,
            config,
        })
    }

    // --- seeding ---

    /// Inject a genome as a live cell. Seeds carry the configured parent
    /// genotype name.
    pub fn inoculate(
        &mut self,
        genome: &[u8],
        placement: Placement,
    ) -> Result<CellId, InoculationError> {
        if genome.len() < self.config.min_cell_size {
            return Err(InoculationError::TooSmall);
        }
        if genome.len() > self.config.soup_size {
            return Err(InoculationError::TooLarge);
        }

        let region = match placement {
            Placement::Center => {
                let start = self.config.soup_size / 2 - genome.len() / 2;
                let region = Region::new(start, genome.len());
                self.soup
                    .allocate_at(region)
                    .then_some(region)
                    .ok_or(InoculationError::NoSpace)?
            }
            Placement::At(start) => {
                let region = Region::new(start % self.config.soup_size, genome.len());
                self.soup
                    .allocate_at(region)
                    .then_some(region)
                    .ok_or(InoculationError::NoSpace)?
            }
            Placement::Random => self
                .random_placement(genome.len())
                .ok_or(InoculationError::NoSpace)?,
        };

        self.soup.write_block(region.start, genome);
        let mut cell = Cell::new(region, self.instructions);
        cell.demo.parent_genotype = SEED_PARENT.to_string();
        let id = self.cells.insert(cell);
        self.soup.add_owner(region, id);
        self.total_cell_bytes += region.len;

        let registered =
            self.genebank
                .register(self.soup.read_region(region), SEED_PARENT, self.instructions);
        if registered.is_new {
            self.events.emit(SimEvent::NewGenotype {
                genotype: registered.name.clone(),
            });
        }
        self.cells[id].demo.genotype = registered.name;

        self.scheduler.push(id);
        self.reaper.push(id);
        self.mutation
            .update_rates(&self.config, self.mean_cell_size());
        self.schedule_next_disturbance();
        Ok(id)
    }

    fn random_placement(&mut self, len: usize) -> Option<Region> {
        for _ in 0..64 {
            let start = self.rng.random_range(0..self.config.soup_size);
            if start + len > self.config.soup_size {
                continue;
            }
            let region = Region::new(start, len);
            if self.soup.allocate_at(region) {
                return Some(region);
            }
        }
        // Degenerate fallback when the soup is fragmented.
        let region = self.soup.allocate(
            len,
            crate::soup::AllocPolicy::FirstFit,
            None,
            0,
            &mut self.rng,
        )?;
        Some(region)
    }

    // --- the tick loop ---

    /// One scheduler turn: run the head cell's slice, then bookkeeping.
    pub fn tick(&mut self) -> TickOutcome {
        if self.cells.is_empty() {
            return TickOutcome::Extinct;
        }
        if self.config.drop_dead > 0
            && self.instructions.saturating_sub(self.last_birth_instruction)
                > u64::from(self.config.drop_dead) * MILLION
        {
            return TickOutcome::NoReproduction;
        }

        let mean = self.mean_cell_size();
        self.mutation.update_rates(&self.config, mean);

        let Some(id) = self.scheduler.front() else {
            return TickOutcome::Extinct;
        };
        let slice =
            scheduler::compute_slice(&self.config, self.cells[id].mother.len, mean, &mut self.rng);
        self.run_slice(id, slice);
        if self.scheduler.front() == Some(id) {
            self.scheduler.rotate();
        }
        if self.cells.contains_key(id) {
            self.lazy_check(id);
        }

        if self.datalog.should_sample(self.instructions) {
            self.sample_datalog();
        }
        self.maybe_save_genebank();
        TickOutcome::Running
    }

    /// Run ticks until an outcome other than `Running`, or until the global
    /// instruction counter reaches `max_instructions` (0 = unbounded).
    pub fn run(&mut self, max_instructions: u64) -> RunOutcome {
        loop {
            if max_instructions > 0 && self.instructions >= max_instructions {
                return RunOutcome::InstructionLimit;
            }
            match self.tick() {
                TickOutcome::Running => {}
                TickOutcome::Extinct => return RunOutcome::Extinct,
                TickOutcome::NoReproduction => return RunOutcome::NoReproduction,
            }
        }
    }

    /// Run at most `ticks` scheduler turns, stopping early on a terminal
    /// outcome. Hosts call this while holding their mutex.
    pub fn tick_batch(&mut self, ticks: usize) -> TickOutcome {
        for _ in 0..ticks {
            let outcome = self.tick();
            if outcome != TickOutcome::Running {
                return outcome;
            }
        }
        TickOutcome::Running
    }

    fn run_slice(&mut self, id: CellId, slice: u32) {
        for _ in 0..slice {
            if !self.cells.get(id).is_some_and(|cell| cell.alive) {
                break;
            }
            self.step_instruction(id);

            if self.mutation.rate_cosmic() > 0.0
                && self.rng.random::<f64>() < self.mutation.rate_cosmic()
            {
                mutation::cosmic_ray(self);
            }
            if self.instructions >= self.next_milestone_at {
                self.events.emit(SimEvent::Milestone {
                    instruction_count: self.instructions,
                });
                self.next_milestone_at += MILLION;
            }
            if self.next_disturbance_at > 0 && self.instructions >= self.next_disturbance_at {
                self.disturb(Some(id));
            }
        }
    }

    /// Fetch, dispatch, and retire one instruction for `id`.
    pub(crate) fn step_instruction(&mut self, id: CellId) {
        let soup_size = self.soup.size();
        let masks = self.config.protection();
        let ip = self.cells[id].cpu.ip;

        if !self.soup.check_access(ip, id, masks, ACCESS_EXECUTE) {
            let cell = &mut self.cells[id];
            cell.cpu.flags.error = true;
            cell.cpu.ip = (ip + 1) % soup_size;
            cell.demo.instructions_executed += 1;
            cell.demo.errors += 1;
            self.instructions += 1;
            self.reaper.note_error(id, &self.cells);
            return;
        }

        let op = OpCode::from_byte(self.soup.read(ip));
        self.cells[id].cpu.ip_moved = false;
        let error_before = self.cells[id].cpu.flags.error;
        isa::execute(self, id, op);

        let raised = self
            .cells
            .get_mut(id)
            .map(|cell| {
                if !cell.cpu.ip_moved {
                    cell.cpu.ip = (cell.cpu.ip + 1) % soup_size;
                }
                cell.demo.instructions_executed += 1;
                let raised = cell.cpu.flags.error && !error_before;
                if raised {
                    cell.demo.errors += 1;
                }
                raised
            })
            .unwrap_or(false);
        self.instructions += 1;
        if raised {
            self.reaper.note_error(id, &self.cells);
        }
    }

    // --- death ---

    /// Slice-end lazy tolerance: a cell that has gone too long without
    /// reproducing drifts one reaper slot toward the head.
    fn lazy_check(&mut self, id: CellId) {
        if self.config.lazy_tol != 0 && self.is_lazy(id) {
            self.reaper.promote(id);
        }
    }

    fn is_lazy(&self, id: CellId) -> bool {
        let Some(cell) = self.cells.get(id) else {
            return false;
        };
        let threshold = u64::from(self.config.lazy_tol) * cell.mother.len as u64;
        self.instructions
            .saturating_sub(cell.demo.last_reproduction_instruction)
            > threshold
    }

    /// Free a victim after an allocation failure. With `mal_reap_tol` set
    /// and an address hint, the oldest cell near the hint dies (cause
    /// `Allocation`); otherwise the head window supplies the victim, with
    /// the cause recording whether its lazy condition held.
    pub(crate) fn reap_for_space(&mut self, hint: Option<usize>, requesting: CellId) {
        if self.config.mal_reap_tol != 0
            && let Some(addr) = hint
        {
            let max_dist = self.config.mal_tol as usize * self.mean_cell_size();
            if let Some(victim) = self.reaper.select_near(
                addr,
                max_dist,
                self.soup.size(),
                Some(requesting),
                &self.cells,
            ) {
                self.kill_cell(victim, DeathCause::Allocation);
                return;
            }
        }
        if let Some(victim) =
            self.reaper
                .select_victim(self.config.reap_rnd_prop, Some(requesting), &mut self.rng)
        {
            let cause = if self.is_lazy(victim) {
                DeathCause::Lazy
            } else {
                DeathCause::Reaper
            };
            self.kill_cell(victim, cause);
        }
    }

    /// Kill a cell: emit the event, free and decay its memory, release its
    /// genotype, and drop it from both queues.
    pub(crate) fn kill_cell(&mut self, id: CellId, cause: DeathCause) {
        let Some(cell) = self.cells.get_mut(id) else {
            return;
        };
        cell.alive = false;
        let mother = cell.mother;
        let daughter = cell.daughter.take();
        let genotype = cell.demo.genotype.clone();

        self.events.emit(SimEvent::CellDied { cell: id, cause });

        self.soup.remove_owner(mother);
        self.soup.deallocate(mother);
        self.soup.randomize_region(mother, &mut self.rng);
        if let Some(region) = daughter {
            self.soup.remove_owner(region);
            self.soup.deallocate(region);
        }

        if self.genebank.release(&genotype) {
            self.events.emit(SimEvent::GenotypeExtinct { genotype });
        }

        self.scheduler.remove(id);
        self.reaper.remove(id);
        self.total_cell_bytes -= mother.len;
        self.cells.remove(id);
    }

    /// Host-requested kill (cause `Reaper`). Returns false for unknown ids.
    pub fn kill(&mut self, id: CellId) -> bool {
        if !self.cells.contains_key(id) {
            return false;
        }
        self.kill_cell(id, DeathCause::Reaper);
        true
    }

    /// Kill a random `dist_prop` fraction of the population regardless of
    /// reaper order, then schedule the next disturbance.
    fn disturb(&mut self, exclude: Option<CellId>) {
        if self.config.dist_prop > 0.0 && !self.reaper.is_empty() {
            let target = ((self.reaper.len() as f64 * self.config.dist_prop) as usize).max(1);
            for _ in 0..target {
                if self.reaper.len() <= 1 {
                    break;
                }
                let index = self.rng.random_range(0..self.reaper.len());
                let Some(victim) = self.reaper.iter().nth(index) else {
                    break;
                };
                if Some(victim) == exclude {
                    continue;
                }
                self.kill_cell(victim, DeathCause::Disturbance);
            }
        }
        self.schedule_next_disturbance();
    }

    fn schedule_next_disturbance(&mut self) {
        let freq = self.config.dist_freq;
        if freq == 0.0 {
            self.next_disturbance_at = 0;
            return;
        }
        let interval = if freq > 0.0 {
            (freq * 1e6) as u64
        } else {
            // Negative: a multiple of the population recovery time, proxied
            // by the soup size in instructions.
            (freq.abs() * self.soup.size() as f64) as u64
        };
        self.next_disturbance_at = if interval == 0 {
            0
        } else {
            self.instructions + interval
        };
    }

    // --- bookkeeping ---

    fn sample_datalog(&mut self) {
        let mut size_histogram = HashMap::new();
        for cell in self.cells.values() {
            *size_histogram.entry(cell.mother.len).or_insert(0u32) += 1;
        }
        let genotype_frequency = self
            .genebank
            .iter()
            .filter(|genotype| genotype.population > 0)
            .map(|genotype| (genotype.name.clone(), genotype.population))
            .collect();
        let stats = SampleStats {
            population: self.cells.len(),
            mean_cell_size: if self.cells.is_empty() {
                0.0
            } else {
                self.total_cell_bytes as f64 / self.cells.len() as f64
            },
            genotypes: self.genebank.living_count(),
            soup_fullness: 100.0
                * (1.0 - self.soup.total_free() as f64 / self.soup.size() as f64),
            max_offspring: self
                .cells
                .values()
                .map(|cell| cell.demo.offspring)
                .max()
                .unwrap_or(0),
            size_histogram,
            genotype_frequency,
        };
        self.datalog.record(self.instructions, stats);
    }

    fn maybe_save_genebank(&mut self) {
        if self.config.disk_bank == 0 || self.config.save_freq == 0 {
            return;
        }
        let cadence = u64::from(self.config.save_freq) * MILLION;
        if self.instructions.saturating_sub(self.last_bank_save_at) < cadence {
            return;
        }
        self.last_bank_save_at = self.instructions;
        let dir = PathBuf::from(&self.config.genebank_path);
        if self
            .genebank
            .save_qualifying(&dir, &self.config, self.cells.len())
            .is_err()
        {
            self.bank_failures += 1;
        }
    }

    // --- accessors and snapshots ---

    /// Population mean of mother-region lengths (the ancestor size before
    /// any cell exists).
    #[must_use]
    pub fn mean_cell_size(&self) -> usize {
        if self.cells.is_empty() {
            DEFAULT_CELL_SIZE
        } else {
            self.total_cell_bytes / self.cells.len()
        }
    }

    #[must_use]
    pub fn config(&self) -> &TierraConfig {
        &self.config
    }

    /// Swap in a new configuration between ticks. The soup size is fixed
    /// for the life of a simulation.
    pub fn set_config(&mut self, config: TierraConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if config.soup_size != self.config.soup_size {
            return Err(ConfigError::InvalidOption(
                "soup_size cannot change at runtime; start a new simulation",
            ));
        }
        self.config = config;
        Ok(())
    }

    #[must_use]
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn soup(&self) -> &Soup {
        &self.soup
    }

    #[must_use]
    pub fn genebank(&self) -> &Genebank {
        &self.genebank
    }

    #[must_use]
    pub fn datalog(&self) -> &DataLog {
        &self.datalog
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Count of failed disk-genebank flushes since boot.
    #[must_use]
    pub fn bank_failures(&self) -> u32 {
        self.bank_failures
    }

    /// Register an observer for simulation events.
    pub fn add_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.events.subscribe(sink);
    }

    /// Copy-out snapshot of one cell.
    #[must_use]
    pub fn snapshot_cell(&self, id: CellId) -> Option<CellSnapshot> {
        let cell = self.cells.get(id)?;
        Some(CellSnapshot {
            id,
            mother: cell.mother,
            daughter: cell.daughter,
            ax: cell.cpu.ax,
            bx: cell.cpu.bx,
            cx: cell.cpu.cx,
            dx: cell.cpu.dx,
            ip: cell.cpu.ip,
            sp: cell.cpu.sp,
            flags: cell.cpu.flags,
            genotype: cell.demo.genotype.clone(),
            parent_genotype: cell.demo.parent_genotype.clone(),
            birth_instruction: cell.demo.birth_instruction,
            instructions_executed: cell.demo.instructions_executed,
            mov_count: cell.demo.mov_count,
            offspring: cell.demo.offspring,
            mutations: cell.demo.mutations,
            errors: cell.demo.errors,
            last_reproduction_instruction: cell.demo.last_reproduction_instruction,
            slice_position: self.scheduler.position(id),
            reaper_position: self.reaper.position(id),
        })
    }

    /// Snapshots of every live cell, in scheduler order.
    #[must_use]
    pub fn cell_snapshots(&self) -> Vec<CellSnapshot> {
        self.scheduler
            .iter()
            .filter_map(|id| self.snapshot_cell(id))
            .collect()
    }

    /// Snapshots of every genotype ever registered, sorted by name.
    #[must_use]
    pub fn genotype_snapshots(&self) -> Vec<GenotypeSnapshot> {
        let mut snapshots: Vec<GenotypeSnapshot> = self
            .genebank
            .iter()
            .map(|genotype| GenotypeSnapshot {
                name: genotype.name.clone(),
                size: genotype.size(),
                parent: genotype.parent.clone(),
                origin_instruction: genotype.origin_instruction,
                population: genotype.population,
                max_population: genotype.max_population,
                genome: genotype.genome.clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// One-line status summary.
    #[must_use]
    pub fn report(&self) -> String {
        let free_pct = 100.0 * self.soup.total_free() as f64 / self.soup.size() as f64;
        format!(
            "InstExe: {}  Cells: {}  Genotypes: {}  AvgSize: {}  Free: {free_pct:.1}%",
            self.instructions,
            self.cells.len(),
            self.genebank.living_count(),
            self.mean_cell_size(),
        )
    }

    /// Verify the cross-component invariants. Intended for tests; returns a
    /// description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let cell_bytes: usize = self.cells.values().map(|cell| {
            cell.mother.len + cell.daughter.map_or(0, |region| region.len)
        }).sum();
        if cell_bytes + self.soup.total_free() != self.soup.size() {
            return Err(format!(
                "memory accounting broken: {cell_bytes} cell bytes + {} free != {}",
                self.soup.total_free(),
                self.soup.size()
            ));
        }
        if !self.soup.free_index_is_coherent() {
            return Err("free blocks are unsorted, overlapping, or adjacent".into());
        }
        for (id, cell) in &self.cells {
            if !cell.mother.contains(cell.cpu.ip, self.soup.size()) {
                return Err(format!("cell {id:?} ip {} outside its mother region", cell.cpu.ip));
            }
            if cell.cpu.sp > crate::cpu::STACK_DEPTH {
                return Err(format!("cell {id:?} stack pointer out of range"));
            }
            if !self.scheduler.contains(id) || !self.reaper.contains(id) {
                return Err(format!("cell {id:?} missing from a queue"));
            }
        }
        if self.scheduler.len() != self.cells.len() || self.reaper.len() != self.cells.len() {
            return Err("queue lengths diverge from the live-cell count".into());
        }
        if self.genebank.total_population() != self.cells.len() as u64 {
            return Err("genotype populations diverge from the live-cell count".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::ANCESTOR;

    fn quiet_config(soup_size: usize) -> TierraConfig {
        TierraConfig {
            soup_size,
            seed: 42,
            slice_style: 0,
            gen_per_bkg_mut: 0,
            gen_per_flaw: 0,
            gen_per_mov_mut: 0,
            gen_per_div_mut: 0,
            gen_per_cro_ins_sam_siz: 0,
            gen_per_ins_ins: 0,
            gen_per_del_ins: 0,
            gen_per_cro_ins: 0,
            gen_per_del_seg: 0,
            gen_per_ins_seg: 0,
            gen_per_cro_seg: 0,
            dist_freq: 0.0,
            disk_bank: 0,
            ..TierraConfig::default()
        }
    }

    #[test]
    fn inoculation_creates_a_scheduled_cell() {
        let mut sim = Simulation::new(quiet_config(4096)).expect("sim");
        let id = sim.inoculate(&ANCESTOR, Placement::Center).expect("seed");
        assert_eq!(sim.cell_count(), 1);
        assert_eq!(sim.scheduler().front(), Some(id));
        assert!(sim.reaper().contains(id));
        let snapshot = sim.snapshot_cell(id).expect("snapshot");
        assert_eq!(snapshot.mother.len, 80);
        assert_eq!(snapshot.genotype, "0080aaa");
        assert_eq!(snapshot.parent_genotype, SEED_PARENT);
        assert_eq!(snapshot.slice_position, Some(0));
        sim.check_invariants().expect("invariants");
    }

    #[test]
    fn inoculation_rejects_bad_genomes() {
        let mut sim = Simulation::new(quiet_config(1024)).expect("sim");
        assert_eq!(
            sim.inoculate(&[1; 4], Placement::Center),
            Err(InoculationError::TooSmall)
        );
        assert_eq!(
            sim.inoculate(&[1; 2000], Placement::Center),
            Err(InoculationError::TooLarge)
        );
        sim.inoculate(&ANCESTOR, Placement::At(100)).expect("seed");
        assert_eq!(
            sim.inoculate(&ANCESTOR, Placement::At(100)),
            Err(InoculationError::NoSpace)
        );
    }

    #[test]
    fn empty_world_reports_extinction() {
        let mut sim = Simulation::new(quiet_config(1024)).expect("sim");
        assert_eq!(sim.tick(), TickOutcome::Extinct);
        assert_eq!(sim.run(1000), RunOutcome::Extinct);
    }

    #[test]
    fn drop_dead_halts_a_sterile_world() {
        let mut config = quiet_config(1024);
        config.drop_dead = 1;
        let mut sim = Simulation::new(config).expect("sim");
        // A genome of pure nops never reproduces.
        sim.inoculate(&[0; 64], Placement::Center).expect("seed");
        let outcome = sim.run(3 * MILLION);
        assert_eq!(outcome, RunOutcome::NoReproduction);
        assert!(sim.instructions() > MILLION);
    }

    #[test]
    fn soup_size_is_fixed_at_runtime() {
        let mut sim = Simulation::new(quiet_config(1024)).expect("sim");
        let mut config = quiet_config(2048);
        config.seed = 42;
        assert!(sim.set_config(config).is_err());
        let same_size = quiet_config(1024);
        assert!(sim.set_config(same_size).is_ok());
    }

    #[test]
    fn host_kill_frees_everything() {
        let mut sim = Simulation::new(quiet_config(4096)).expect("sim");
        let id = sim.inoculate(&ANCESTOR, Placement::Center).expect("seed");
        assert!(sim.kill(id));
        assert!(!sim.kill(id));
        assert_eq!(sim.cell_count(), 0);
        assert_eq!(sim.soup().total_free(), 4096);
        assert_eq!(sim.genebank().living_count(), 0);
    }
}
