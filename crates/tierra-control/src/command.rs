//! Bounded command bus: commands from host surfaces are queued here and
//! applied between tick batches, on the engine thread.

use crossfire::{MAsyncTx, MRx, TryRecvError, detect_backoff_cfg, mpmc};
use tierra_core::{CellId, Placement, Simulation, TierraConfig};
use tracing::{debug, warn};

/// Commands accepted from outside the engine thread.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Replace the configuration (validated before application).
    UpdateConfig(TierraConfig),
    /// Inject a genome as a live cell.
    Inoculate {
        genome: Vec<u8>,
        placement: Placement,
    },
    /// Kill a specific cell.
    Kill(CellId),
}

pub type CommandSender = MAsyncTx<ControlCommand>;
pub type CommandReceiver = MRx<ControlCommand>;

/// Create the bounded command bus shared by all control surfaces.
pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    detect_backoff_cfg();
    mpmc::bounded_tx_async_rx_blocking(capacity)
}

/// Drain and apply every pending command. Called on the engine thread while
/// the simulation lock is held, between tick batches.
pub fn drain_pending_commands(receiver: &CommandReceiver, sim: &mut Simulation) {
    loop {
        match receiver.try_recv() {
            Ok(ControlCommand::UpdateConfig(config)) => {
                debug!("applying config update via control command");
                if let Err(err) = sim.set_config(config) {
                    warn!(%err, "rejected config update");
                }
            }
            Ok(ControlCommand::Inoculate { genome, placement }) => {
                match sim.inoculate(&genome, placement) {
                    Ok(id) => debug!(?id, "inoculated genome"),
                    Err(err) => warn!(%err, "inoculation failed"),
                }
            }
            Ok(ControlCommand::Kill(id)) => {
                if !sim.kill(id) {
                    warn!(?id, "kill target not found");
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
}
