//! Simulation events and the synchronous observer registry.
//!
//! Events are emitted in the total order the engine produced them, during
//! the emitting tick. Observers run synchronously; a blocking observer
//! stalls the engine. Payloads are value-typed and carry no references into
//! live state.

use std::fmt;

use serde::Serialize;

use crate::CellId;

/// Why a cell was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathCause {
    /// Allocation-pressure victim whose lazy condition held at kill time.
    Lazy,
    /// Allocation-pressure victim drawn from the head window of the queue.
    Reaper,
    /// Killed by a scheduled mass-kill event.
    Disturbance,
    /// Allocation-pressure victim selected by the near-address policy.
    Allocation,
}

/// Which genetic operator fired during a divide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneticOp {
    PointMutation,
    CrossoverSameSize,
    Crossover,
    Insertion,
    Deletion,
    SegmentCrossover,
    SegmentInsertion,
    SegmentDeletion,
}

/// The kind of a mutation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Background bit-flip at a random soup address.
    Cosmic,
    /// Corruption of a byte written by `movii`.
    Copy,
    /// Register perturbation after an executed instruction.
    Flaw,
    /// A genetic operator applied to a daughter genome on divide.
    Genetic(GeneticOp),
}

/// Events observable by external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimEvent {
    CellBorn {
        cell: CellId,
        parent: CellId,
        genotype: String,
    },
    CellDied {
        cell: CellId,
        cause: DeathCause,
    },
    NewGenotype {
        genotype: String,
    },
    GenotypeExtinct {
        genotype: String,
    },
    Mutation {
        kind: MutationKind,
        cell: Option<CellId>,
    },
    Milestone {
        instruction_count: u64,
    },
}

/// Observer invoked synchronously for every emitted event.
pub trait EventSink: Send {
    fn on_event(&mut self, event: &SimEvent);
}

/// Registry of observers. Dispatch preserves emission order and runs inside
/// the emitting tick.
pub struct EventBus {
    sinks: Vec<Box<dyn EventSink>>,
    enabled: bool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("sink_count", &self.sinks.len())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            enabled: true,
        }
    }

    /// Register an observer.
    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Drop every observer.
    pub fn clear(&mut self) {
        self.sinks.clear();
    }

    /// Suppress or restore dispatch.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Dispatch one event to all observers, in registration order.
    pub fn emit(&mut self, event: SimEvent) {
        if !self.enabled {
            return;
        }
        for sink in &mut self.sinks {
            sink.on_event(&event);
        }
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}
