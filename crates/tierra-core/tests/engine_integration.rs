//! End-to-end engine behavior: ancestor replication, determinism of event
//! streams, reaper dynamics, and the cross-component invariants.

use std::sync::{Arc, Mutex};

use tierra_core::{
    ANCESTOR, EventSink, Placement, SimEvent, Simulation, TickOutcome, TierraConfig,
};

/// A configuration with every stochastic channel disabled, for
/// deterministic replication runs.
fn quiet_config(soup_size: usize, seed: u64) -> TierraConfig {
    TierraConfig {
        soup_size,
        seed,
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

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<SimEvent>>>,
}

impl EventSink for Recorder {
    fn on_event(&mut self, event: &SimEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[test]
fn ancestor_produces_a_byte_identical_daughter() {
    let mut sim = Simulation::new(quiet_config(60_000, 42)).expect("sim");
    sim.inoculate(&ANCESTOR, Placement::Center).expect("seed");

    for _ in 0..200 {
        assert_eq!(sim.tick(), TickOutcome::Running);
        if sim.cell_count() >= 2 {
            break;
        }
    }
    assert!(
        sim.cell_count() >= 2,
        "no replication after {} instructions",
        sim.instructions()
    );

    for snapshot in sim.cell_snapshots() {
        let genome = sim.soup().read_region(snapshot.mother);
        assert_eq!(genome, ANCESTOR, "genome diverged without mutation");
    }
    sim.check_invariants().expect("invariants");
}

#[test]
fn population_grows_across_generations() {
    let mut sim = Simulation::new(quiet_config(60_000, 42)).expect("sim");
    sim.inoculate(&ANCESTOR, Placement::Center).expect("seed");

    for _ in 0..2_000 {
        sim.tick();
        if sim.cell_count() >= 4 {
            break;
        }
    }
    assert!(
        sim.cell_count() >= 4,
        "grandchildren expected, got {} cells",
        sim.cell_count()
    );

    // A single genotype carries the whole population.
    let genotypes = sim.genotype_snapshots();
    let living: Vec<_> = genotypes.iter().filter(|g| g.population > 0).collect();
    assert_eq!(living.len(), 1);
    assert_eq!(living[0].name, "0080aaa");
    assert_eq!(living[0].population as usize, sim.cell_count());
    sim.check_invariants().expect("invariants");
}

#[test]
fn saturated_small_soup_keeps_a_living_population() {
    // A 256-byte soup holds at most three 80-byte creatures, so the
    // reaper must keep clearing space for new daughters.
    let mut sim = Simulation::new(quiet_config(256, 42)).expect("sim");
    sim.inoculate(&ANCESTOR, Placement::At(0)).expect("seed");

    while sim.instructions() < 50_000 {
        if sim.tick() != TickOutcome::Running {
            break;
        }
    }
    assert!(sim.cell_count() >= 2, "population collapsed");
    for genotype in sim.genotype_snapshots() {
        if genotype.population > 0 {
            assert_eq!(genotype.size, 80);
        }
    }
    sim.check_invariants().expect("invariants");
}

#[test]
fn lazy_cells_are_promoted_toward_the_reaper_head() {
    // Two 80-byte cells that never reproduce; lazy_tol 10 promotes after
    // 10 * 80 = 800 instructions without a birth.
    let mut sim = Simulation::new(quiet_config(1_024, 42)).expect("sim");
    let _older = sim.inoculate(&[0; 80], Placement::At(0)).expect("seed a");
    let younger = sim.inoculate(&[0; 80], Placement::At(100)).expect("seed b");
    assert_eq!(sim.reaper().position(younger), Some(1));

    let mut promoted_at = None;
    for _ in 0..200 {
        sim.tick();
        let at_head = sim.reaper().position(younger) == Some(0);
        if sim.instructions() <= 800 {
            assert!(!at_head, "promoted before the lazy threshold");
        } else if at_head {
            promoted_at = Some(sim.instructions());
            break;
        }
    }
    let promoted_at = promoted_at.expect("lazy promotion never happened");
    assert!(promoted_at > 800 && promoted_at < 2_000);
}

#[test]
fn identical_seeds_produce_identical_event_streams() {
    let run = |seed: u64| {
        let recorder = Recorder::default();
        let events = recorder.events.clone();
        let mut config = TierraConfig {
            soup_size: 8_192,
            seed,
            disk_bank: 0,
            ..TierraConfig::default()
        };
        config.drop_dead = 1;
        let mut sim = Simulation::new(config).expect("sim");
        sim.add_event_sink(Box::new(recorder));
        sim.inoculate(&ANCESTOR, Placement::Center).expect("seed");
        while sim.instructions() < 30_000 {
            if sim.tick() != TickOutcome::Running {
                break;
            }
        }
        sim.check_invariants().expect("invariants");
        let events = events.lock().unwrap().clone();
        events
    };

    let first = run(0xDEAD_BEEF);
    let second = run(0xDEAD_BEEF);
    assert_eq!(first, second, "identical seed and config must replay exactly");
    assert!(!first.is_empty(), "a live run emits events");

    let different = run(0xF00D_F00D);
    assert_ne!(first, different, "different seeds should diverge");
}

#[test]
fn chaotic_run_preserves_every_invariant() {
    // All mutation channels on, disturbances on, default protection.
    let config = TierraConfig {
        soup_size: 16_384,
        seed: 7,
        disk_bank: 0,
        ..TierraConfig::default()
    };
    let mut sim = Simulation::new(config).expect("sim");
    sim.inoculate(&ANCESTOR, Placement::Center).expect("seed");

    let mut checked = 0;
    while sim.instructions() < 150_000 {
        if sim.tick() != TickOutcome::Running {
            break;
        }
        if sim.instructions() / 10_000 > checked {
            checked = sim.instructions() / 10_000;
            sim.check_invariants().expect("invariants mid-run");
        }
    }
    sim.check_invariants().expect("invariants at end");
}

#[test]
fn datalog_samples_during_a_run() {
    let mut sim = Simulation::new(quiet_config(60_000, 42)).expect("sim");
    sim.inoculate(&ANCESTOR, Placement::Center).expect("seed");
    while sim.instructions() < 60_000 {
        if sim.tick() != TickOutcome::Running {
            break;
        }
    }
    let log = sim.datalog();
    assert!(!log.population.is_empty());
    assert!(log.population.last().unwrap().value >= 1.0);
    assert!(log.mean_cell_size.last().unwrap().value > 0.0);
    assert_eq!(log.size_histogram.keys().copied().max(), Some(80));
    assert!(log.genotype_frequency.contains_key("0080aaa"));
}
