//! Host-side control plane for a running `tierra-core` simulation.
//!
//! The engine itself is single-threaded; this crate supplies the process
//! boundary described by its contract: a coarse mutex around the
//! simulation, copy-out snapshots, a bounded command inbox applied between
//! tick batches, and a cooperative stop flag checked between batches.

mod command;

pub use command::{
    CommandReceiver, CommandSender, ControlCommand, create_command_bus, drain_pending_commands,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossfire::TrySendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use tierra_core::{
    CellId, CellSnapshot, GenotypeSnapshot, Placement, Simulation, TickOutcome, TierraConfig,
};

/// The simulation behind the coarse mutex shared by engine and hosts.
pub type SharedSimulation = Arc<Mutex<Simulation>>;

/// Errors produced by the control surfaces.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to lock simulation state")]
    Lock,
    #[error("{0}")]
    InvalidPatch(String),
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("command queue is full; retry later")]
    CommandQueueFull,
    #[error("command queue has been closed")]
    CommandQueueClosed,
}

impl ControlError {
    fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<PoisonError<MutexGuard<'_, Simulation>>> for ControlError {
    fn from(_: PoisonError<MutexGuard<'_, Simulation>>) -> Self {
        ControlError::Lock
    }
}

/// Coarse status summary returned to external clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub instructions: u64,
    pub cells: usize,
    pub genotypes: usize,
    pub mean_cell_size: usize,
    /// Free fraction of the soup in `[0, 1]`.
    pub free_fraction: f64,
}

/// Shared handle used by host surfaces (CLI, GUI, RPC) to observe and steer
/// the running simulation.
#[derive(Clone)]
pub struct ControlHandle {
    shared: SharedSimulation,
    commands: CommandSender,
}

impl ControlHandle {
    #[must_use]
    pub fn new(shared: SharedSimulation, commands: CommandSender) -> Self {
        Self { shared, commands }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Simulation>, ControlError> {
        self.shared.lock().map_err(ControlError::from)
    }

    /// Coarse world status.
    pub fn status(&self) -> Result<StatusSnapshot, ControlError> {
        let sim = self.lock()?;
        Ok(StatusSnapshot {
            instructions: sim.instructions(),
            cells: sim.cell_count(),
            genotypes: sim.genebank().living_count(),
            mean_cell_size: sim.mean_cell_size(),
            free_fraction: sim.soup().total_free() as f64 / sim.soup().size() as f64,
        })
    }

    /// Copy-out snapshots of every live cell.
    pub fn cells(&self) -> Result<Vec<CellSnapshot>, ControlError> {
        Ok(self.lock()?.cell_snapshots())
    }

    /// Copy-out snapshots of every genotype.
    pub fn genotypes(&self) -> Result<Vec<GenotypeSnapshot>, ControlError> {
        Ok(self.lock()?.genotype_snapshots())
    }

    /// The current configuration as a JSON object.
    pub fn config(&self) -> Result<Value, ControlError> {
        let sim = self.lock()?;
        serde_json::to_value(sim.config().clone()).map_err(ControlError::serialization)
    }

    /// Apply a flat JSON patch onto the configuration. Unknown keys and
    /// invalid results are rejected; the accepted configuration is queued
    /// and applied between tick batches. Returns the patched configuration.
    pub fn apply_patch(&self, patch: Value) -> Result<Value, ControlError> {
        let Value::Object(patch_map) = patch else {
            return Err(ControlError::InvalidPatch(
                "configuration patch must be a JSON object".into(),
            ));
        };

        let sim = self.lock()?;
        let mut config_value =
            serde_json::to_value(sim.config().clone()).map_err(ControlError::serialization)?;
        let fields = config_value
            .as_object_mut()
            .expect("configuration serializes to an object");
        for (key, value) in patch_map {
            let Some(slot) = fields.get_mut(&key) else {
                return Err(ControlError::UnknownOption(key));
            };
            *slot = value;
        }

        let config: TierraConfig =
            serde_json::from_value(config_value.clone()).map_err(ControlError::serialization)?;
        config
            .validate()
            .map_err(|err| ControlError::InvalidPatch(err.to_string()))?;
        if config.soup_size != sim.config().soup_size {
            return Err(ControlError::InvalidPatch(
                "soup_size cannot change at runtime; start a new simulation".into(),
            ));
        }
        drop(sim);
        self.enqueue(ControlCommand::UpdateConfig(config))?;
        Ok(config_value)
    }

    /// Queue a genome injection.
    pub fn inoculate(&self, genome: Vec<u8>, placement: Placement) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Inoculate { genome, placement })
    }

    /// Queue a kill request for one cell.
    pub fn kill(&self, id: CellId) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Kill(id))
    }

    fn enqueue(&self, command: ControlCommand) -> Result<(), ControlError> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ControlError::CommandQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ControlError::CommandQueueClosed),
        }
    }
}

/// Background engine thread: drains commands and runs tick batches while
/// holding the simulation mutex, releasing it between batches so observers
/// can snapshot. Stops cooperatively via the stop flag or when the engine
/// reports a terminal outcome.
pub struct Runner {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<TickOutcome>,
}

impl Runner {
    /// Spawn the engine thread. `batch` is the number of scheduler turns
    /// executed per lock acquisition.
    #[must_use]
    pub fn spawn(shared: SharedSimulation, receiver: CommandReceiver, batch: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            info!(batch, "simulation runner started");
            loop {
                if flag.load(Ordering::Relaxed) {
                    info!("simulation runner stopped by host");
                    return TickOutcome::Running;
                }
                let Ok(mut sim) = shared.lock() else {
                    warn!("simulation mutex poisoned; runner exiting");
                    return TickOutcome::Running;
                };
                drain_pending_commands(&receiver, &mut sim);
                let outcome = sim.tick_batch(batch.max(1));
                drop(sim);
                if outcome != TickOutcome::Running {
                    info!(?outcome, "simulation halted");
                    return outcome;
                }
                debug!("tick batch complete");
            }
        });
        Self { stop, handle }
    }

    /// The cooperative stop flag, for sharing with signal handlers.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Request a stop and join the engine thread, returning the last
    /// outcome it observed.
    pub fn stop(self) -> TickOutcome {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap_or(TickOutcome::Running)
    }

    /// Whether the engine thread has exited on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierra_core::ANCESTOR;

    fn quiet_config() -> TierraConfig {
        TierraConfig {
            soup_size: 8192,
            seed: 11,
            dist_freq: 0.0,
            disk_bank: 0,
            ..TierraConfig::default()
        }
    }

    fn handle() -> (ControlHandle, CommandReceiver, SharedSimulation) {
        let sim = Simulation::new(quiet_config()).expect("sim");
        let shared: SharedSimulation = Arc::new(Mutex::new(sim));
        let (sender, receiver) = create_command_bus(8);
        (
            ControlHandle::new(Arc::clone(&shared), sender),
            receiver,
            shared,
        )
    }

    #[test]
    fn patch_updates_single_option() {
        let (handle, receiver, shared) = handle();
        let patched = handle
            .apply_patch(serde_json::json!({ "slice_size": 40 }))
            .expect("patch");
        assert_eq!(patched.get("slice_size").and_then(Value::as_u64), Some(40));

        let mut sim = shared.lock().expect("lock");
        drain_pending_commands(&receiver, &mut sim);
        assert_eq!(sim.config().slice_size, 40);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let (handle, _receiver, _shared) = handle();
        let err = handle
            .apply_patch(serde_json::json!({ "does_not_exist": 1 }))
            .expect_err("unknown option");
        assert!(matches!(err, ControlError::UnknownOption(_)));
    }

    #[test]
    fn soup_size_patches_are_rejected() {
        let (handle, _receiver, _shared) = handle();
        let err = handle
            .apply_patch(serde_json::json!({ "soup_size": 100_000 }))
            .expect_err("soup_size patch");
        assert!(matches!(err, ControlError::InvalidPatch(_)));
    }

    #[test]
    fn queued_inoculation_is_applied_between_batches() {
        let (handle, receiver, shared) = handle();
        handle
            .inoculate(ANCESTOR.to_vec(), Placement::Center)
            .expect("queue");
        let mut sim = shared.lock().expect("lock");
        drain_pending_commands(&receiver, &mut sim);
        assert_eq!(sim.cell_count(), 1);
        let status_cells = sim.cell_count();
        drop(sim);
        assert_eq!(handle.status().expect("status").cells, status_cells);
    }

    #[test]
    fn runner_executes_and_stops_cooperatively() {
        let sim = Simulation::new(quiet_config()).expect("sim");
        let shared: SharedSimulation = Arc::new(Mutex::new(sim));
        let (sender, receiver) = create_command_bus(8);
        let handle = ControlHandle::new(Arc::clone(&shared), sender);
        handle
            .inoculate(ANCESTOR.to_vec(), Placement::Center)
            .expect("queue");

        let runner = Runner::spawn(Arc::clone(&shared), receiver, 16);
        // Wait for the engine to make observable progress.
        let mut executed = 0;
        for _ in 0..200 {
            executed = handle.status().expect("status").instructions;
            if executed > 1_000 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(executed > 1_000, "runner made no progress");
        runner.stop();

        let sim = shared.lock().expect("lock");
        assert!(sim.instructions() >= executed);
        assert!(sim.cell_count() >= 1);
    }
}
