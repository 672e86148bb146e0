//! Core engine for the `rust_tierra` workspace: a Tierra-style artificial
//! life system in which self-replicating programs compete for a shared
//! circular memory ("soup") and for CPU slices handed out by a round-robin
//! scheduler, while a reaper reclaims memory and mutation operators inject
//! variation.
//!
//! The crate is single-threaded and deterministic: a [`Simulation`] owns the
//! soup, the queues, the RNG, and the genebank, and several independent
//! simulations may coexist in one process. Hosts that want background
//! execution should wrap a `Simulation` behind a mutex (see the
//! `tierra-control` crate).

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use thiserror::Error;

pub mod cell;
pub mod cpu;
pub mod datalog;
pub mod events;
pub mod genebank;
pub mod genome;
pub mod isa;
pub mod mutation;
pub mod reaper;
pub mod scheduler;
pub mod simulation;
pub mod soup;

pub use cell::{Cell, Demographics, Region};
pub use cpu::{Cpu, Flags, STACK_DEPTH};
pub use datalog::{DataLog, SampleStats, TimeSeries};
pub use events::{DeathCause, EventBus, EventSink, GeneticOp, MutationKind, SimEvent};
pub use genebank::{Genebank, Genotype};
pub use genome::{ANCESTOR, GenomeParseError, format_genome, parse_genome};
pub use isa::OpCode;
pub use mutation::MutationEngine;
pub use reaper::Reaper;
pub use scheduler::Scheduler;
pub use simulation::{
    CellSnapshot, GenotypeSnapshot, InoculationError, Placement, RunOutcome, Simulation,
    TickOutcome,
};
pub use soup::{ACCESS_EXECUTE, ACCESS_READ, ACCESS_WRITE, ProtectionMasks, Soup};

new_key_type! {
    /// Stable handle for cells backed by a generational slot map. Queues,
    /// owner spans, and events hold `CellId`s, never owning references.
    pub struct CellId;
}

/// Fallback mean cell size used for rate and distance derivations before any
/// cell exists (the size of the classic ancestor).
pub const DEFAULT_CELL_SIZE: usize = 80;

/// Errors raised when validating an engine configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Indicates an invalid option value or combination.
    #[error("invalid configuration: {0}")]
    InvalidOption(&'static str),
}

/// Flat configuration record for a simulation. Field names follow the
/// historical option names; all options are recognized even where the engine
/// treats them as inert (`eject_rate`, `min_gen_mem_siz`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierraConfig {
    /// Length of the soup in instructions (bytes).
    pub soup_size: usize,

    // Time slicing.
    /// Base slice size in instructions.
    pub slice_size: u32,
    /// Non-zero makes slices scale with cell size relative to the mean.
    pub siz_dep_slice: u8,
    /// Exponent applied to the size ratio when `siz_dep_slice` is set.
    pub slice_pow: f64,
    /// Slice style; style 2 applies the fixed/random fraction variation.
    pub slice_style: u8,
    /// Fixed fraction of the base slice granted under style 2.
    pub slic_fix_frac: f64,
    /// Upper bound of the uniform random fraction added under style 2.
    pub slic_ran_frac: f64,

    // Mutation pressure, expressed as generations per event (0 disables).
    pub gen_per_bkg_mut: u32,
    pub gen_per_flaw: u32,
    pub gen_per_mov_mut: u32,
    pub gen_per_div_mut: u32,
    /// Probability that a mutation flips one bit instead of replacing the
    /// opcode wholesale.
    pub mut_bit_prop: f64,

    // Genetic operators applied on divide, generations per event.
    pub gen_per_cro_ins_sam_siz: u32,
    pub gen_per_ins_ins: u32,
    pub gen_per_del_ins: u32,
    pub gen_per_cro_ins: u32,
    pub gen_per_del_seg: u32,
    pub gen_per_ins_seg: u32,
    pub gen_per_cro_seg: u32,

    // Allocator.
    /// Allocation policy: 0 first-fit, 1 better-fit, 2 random, 3 near
    /// parent, 4 near address.
    pub mal_mode: u8,
    /// Non-zero enables near-address victim selection on allocation failure.
    pub mal_reap_tol: u8,
    /// Oversize tolerance (bytes) for better-fit; also scales the
    /// near-address reap distance.
    pub mal_tol: u32,
    /// Free-block count above which the allocator coalesces eagerly.
    pub max_free_blocks: usize,
    /// Non-zero forces daughters to be allocated at the mother's size.
    pub mal_sam_siz: u8,

    // Cell constraints.
    pub min_cell_size: usize,
    pub min_gen_mem_siz: usize,
    /// Minimum template length accepted by the template matcher.
    pub min_templ_size: usize,
    /// Fraction of the daughter that must have been written before divide.
    pub mov_prop_thr_div: f64,
    /// Template search range in multiples of the mean cell size.
    pub search_limit: u32,

    // Reaper.
    /// Fraction of the reaper queue (from the head) eligible as allocation
    /// failure victims; 0 degenerates to exactly the head.
    pub reap_rnd_prop: f64,
    /// Slices of inactivity (in own-size multiples) before lazy promotion.
    pub lazy_tol: u32,
    /// Halt after this many million instructions without a birth; 0 disables.
    pub drop_dead: u32,

    // Division constraints.
    pub div_same_gen: u8,
    pub div_same_siz: u8,

    // Disturbance.
    /// Positive: period in millions of instructions. Negative: multiple of
    /// the population recovery time. Zero disables.
    pub dist_freq: f64,
    /// Fraction of the population killed per disturbance.
    pub dist_prop: f64,
    /// Recognized for compatibility; multi-soup ejection is out of scope.
    pub eject_rate: u32,

    // Memory protection masks, bit-sets of {execute=1, write=2, read=4}.
    pub mem_mode_free: u8,
    pub mem_mode_mine: u8,
    pub mem_mode_prot: u8,

    // Genebank.
    /// Non-zero persists qualifying genotypes to `genebank_path`.
    pub disk_bank: u8,
    pub genebank_path: String,
    /// Save cadence in millions of instructions.
    pub save_freq: u32,
    /// Minimum population for a genotype to qualify for saving.
    pub sav_min_num: u32,
    /// Minimum fraction of the soup a genotype must occupy to qualify.
    pub sav_thr_mem: f64,
    /// Minimum fraction of the population a genotype must hold to qualify.
    pub sav_thr_pop: f64,

    // Initial conditions.
    /// RNG seed; 0 seeds from entropy.
    pub seed: u64,
    /// Must be 1: resuming a serialized soup is out of scope.
    pub new_soup: u8,
}

impl Default for TierraConfig {
    fn default() -> Self {
        Self {
            soup_size: 60_000,
            slice_size: 25,
            siz_dep_slice: 0,
            slice_pow: 1.0,
            slice_style: 2,
            slic_fix_frac: 0.0,
            slic_ran_frac: 2.0,
            gen_per_bkg_mut: 32,
            gen_per_flaw: 32,
            gen_per_mov_mut: 0,
            gen_per_div_mut: 32,
            mut_bit_prop: 0.2,
            gen_per_cro_ins_sam_siz: 32,
            gen_per_ins_ins: 32,
            gen_per_del_ins: 32,
            gen_per_cro_ins: 32,
            gen_per_del_seg: 32,
            gen_per_ins_seg: 32,
            gen_per_cro_seg: 32,
            mal_mode: 1,
            mal_reap_tol: 1,
            mal_tol: 20,
            max_free_blocks: 800,
            mal_sam_siz: 0,
            min_cell_size: 12,
            min_gen_mem_siz: 12,
            min_templ_size: 1,
            mov_prop_thr_div: 0.7,
            search_limit: 5,
            reap_rnd_prop: 0.3,
            lazy_tol: 10,
            drop_dead: 5,
            div_same_gen: 0,
            div_same_siz: 0,
            dist_freq: -0.3,
            dist_prop: 0.2,
            eject_rate: 0,
            mem_mode_free: 0,
            mem_mode_mine: 0,
            mem_mode_prot: 2,
            disk_bank: 1,
            genebank_path: "gb0".to_string(),
            save_freq: 100,
            sav_min_num: 10,
            sav_thr_mem: 0.02,
            sav_thr_pop: 0.02,
            seed: 0,
            new_soup: 1,
        }
    }
}

impl TierraConfig {
    /// Validates the configuration. A simulation refuses to initialize from
    /// an invalid record.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.soup_size == 0 {
            return Err(ConfigError::InvalidOption("soup_size must be non-zero"));
        }
        if self.soup_size > i32::MAX as usize {
            return Err(ConfigError::InvalidOption(
                "soup_size must fit in a signed 32-bit register",
            ));
        }
        if self.min_cell_size == 0 || self.min_cell_size > self.soup_size {
            return Err(ConfigError::InvalidOption(
                "min_cell_size must be non-zero and fit in the soup",
            ));
        }
        if self.slice_size == 0 {
            return Err(ConfigError::InvalidOption("slice_size must be non-zero"));
        }
        if self.slice_style > 2 {
            return Err(ConfigError::InvalidOption("slice_style must be 0, 1, or 2"));
        }
        if self.slic_fix_frac < 0.0 || self.slic_ran_frac < 0.0 {
            return Err(ConfigError::InvalidOption(
                "slice fractions must be non-negative",
            ));
        }
        if self.mal_mode > 4 {
            return Err(ConfigError::InvalidOption("mal_mode must be 0..=4"));
        }
        if !(0.0..=1.0).contains(&self.mut_bit_prop)
            || !(0.0..=1.0).contains(&self.mov_prop_thr_div)
            || !(0.0..=1.0).contains(&self.reap_rnd_prop)
            || !(0.0..=1.0).contains(&self.dist_prop)
            || !(0.0..=1.0).contains(&self.sav_thr_mem)
            || !(0.0..=1.0).contains(&self.sav_thr_pop)
        {
            return Err(ConfigError::InvalidOption(
                "proportion options must lie in [0, 1]",
            ));
        }
        if self.mem_mode_free > 7 || self.mem_mode_mine > 7 || self.mem_mode_prot > 7 {
            return Err(ConfigError::InvalidOption(
                "memory protection masks are 3-bit sets",
            ));
        }
        if self.search_limit == 0 {
            return Err(ConfigError::InvalidOption("search_limit must be non-zero"));
        }
        if self.max_free_blocks == 0 {
            return Err(ConfigError::InvalidOption(
                "max_free_blocks must be non-zero",
            ));
        }
        if self.new_soup != 1 {
            return Err(ConfigError::InvalidOption(
                "new_soup must be 1; resuming a serialized soup is unsupported",
            ));
        }
        if self.disk_bank != 0 && self.genebank_path.is_empty() {
            return Err(ConfigError::InvalidOption(
                "genebank_path must be set when disk_bank is enabled",
            ));
        }
        Ok(())
    }

    /// Memory protection masks derived from the `mem_mode_*` options.
    #[must_use]
    pub fn protection(&self) -> ProtectionMasks {
        ProtectionMasks {
            free: self.mem_mode_free,
            mine: self.mem_mode_mine,
            prot: self.mem_mode_prot,
        }
    }
}

/// Reduce a signed register value to a soup address.
#[inline]
#[must_use]
pub fn wrap_address(value: i32, soup_size: usize) -> usize {
    (i64::from(value)).rem_euclid(soup_size as i64) as usize
}

/// Modular (toroidal) distance between two soup addresses.
#[inline]
#[must_use]
pub fn modular_distance(a: usize, b: usize, soup_size: usize) -> usize {
    let direct = a.abs_diff(b) % soup_size;
    direct.min(soup_size - direct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(TierraConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = TierraConfig {
            soup_size: 0,
            ..TierraConfig::default()
        };
        assert!(config.validate().is_err());

        config = TierraConfig {
            mal_mode: 9,
            ..TierraConfig::default()
        };
        assert!(config.validate().is_err());

        config = TierraConfig {
            mov_prop_thr_div: 1.5,
            ..TierraConfig::default()
        };
        assert!(config.validate().is_err());

        config = TierraConfig {
            new_soup: 0,
            ..TierraConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidOption(
                "new_soup must be 1; resuming a serialized soup is unsupported",
            ))
        );
    }

    #[test]
    fn wrap_address_handles_negative_registers() {
        assert_eq!(wrap_address(5, 100), 5);
        assert_eq!(wrap_address(105, 100), 5);
        assert_eq!(wrap_address(-1, 100), 99);
        assert_eq!(wrap_address(-201, 100), 99);
    }

    #[test]
    fn modular_distance_is_symmetric_and_wraps() {
        assert_eq!(modular_distance(10, 30, 100), 20);
        assert_eq!(modular_distance(30, 10, 100), 20);
        assert_eq!(modular_distance(5, 95, 100), 10);
    }
}
