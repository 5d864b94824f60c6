//! Typed event bus.
//!
//! Loops publish what they did on a bounded broadcast channel. Publishing
//! never blocks: when a subscriber falls more than `capacity` events
//! behind, its next `recv` returns `RecvError::Lagged` with the number of
//! events it missed, and it continues from the oldest retained event.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::actors::LoopKind;
use crate::core::WorkerId;
use crate::orchestration::scheduler::CoordinationEvent;
use crate::orchestration::{RecoveryAction, UnitId};

/// Default number of events retained for slow subscribers.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Events emitted by the coordination loops.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    /// A coordination action was executed or deferred.
    Coordination(CoordinationEvent),
    /// The auto-scaler computed a scalability score.
    ScalabilityEvaluated { score: f64 },
    /// A pending worker was brought online.
    WorkerActivated { worker: WorkerId },
    /// A worker's capacity multiplier was raised.
    CapacityRaised { worker: WorkerId, capacity: f64 },
    /// An optimization attempt completed and was recorded.
    OptimizationRecorded {
        unit: UnitId,
        success_rate: f64,
        improvement_score: f64,
    },
    /// A recovery action was scheduled for a failing unit.
    RecoveryScheduled { unit: UnitId, action: RecoveryAction },
    /// A unit was flagged for manual review.
    UnitFlagged { unit: UnitId },
    /// Recovery itself failed.
    CriticalError { message: String },
    /// A reflection cycle finished.
    ReflectionCompleted {
        patterns: usize,
        insights: usize,
        lessons: usize,
    },
    LoopStarted { kind: LoopKind },
    LoopStopped { kind: LoopKind },
}

/// Bounded, non-blocking pub/sub channel for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event, returning how many subscribers will see it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
