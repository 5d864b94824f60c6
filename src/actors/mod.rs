//! Actor system for the coordination loops.
//!
//! Each loop is an independent tokio task ticking on its own interval.
//! Loops share state only through the coordinator's `Arc`s and never wait on
//! each other: a slow optimizer cycle does not delay the scheduler.
//!
//! Each actor has its own `CancellationToken`, so any loop can be stopped
//! and restarted without touching the others.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{EngineEvent, EventBus};

/// The four coordination loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Scheduler,
    Scaler,
    Optimizer,
    Reflection,
}

impl LoopKind {
    pub const ALL: [LoopKind; 4] = [
        LoopKind::Scheduler,
        LoopKind::Scaler,
        LoopKind::Optimizer,
        LoopKind::Reflection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopKind::Scheduler => "scheduler",
            LoopKind::Scaler => "scaler",
            LoopKind::Optimizer => "optimizer",
            LoopKind::Reflection => "reflection",
        }
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl ActorHandle {
    /// Create a new actor handle with a cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, join: None }
    }

    fn with_join(mut self, join: JoinHandle<()>) -> Self {
        self.join = Some(join);
        self
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the actor's task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Signal shutdown and wait for the current cycle to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Actor that runs one coordination loop on a fixed interval.
pub struct LoopActor {
    kind: LoopKind,
    interval: Duration,
    bus: EventBus,
}

impl LoopActor {
    pub fn new(kind: LoopKind, interval: Duration, bus: EventBus) -> Self {
        Self {
            kind,
            interval: interval.max(Duration::from_millis(1)),
            bus,
        }
    }

    pub fn kind(&self) -> LoopKind {
        self.kind
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the loop. `tick` runs once per interval, starting immediately.
    ///
    /// A tick that overruns the interval delays the next one rather than
    /// triggering a burst of catch-up ticks. Cancellation is observed
    /// between ticks, so a running cycle always completes.
    pub fn spawn<F, Fut>(self, mut tick: F) -> ActorHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let kind = self.kind;

        debug!(loop_kind = %kind, interval_ms = self.interval.as_millis() as u64, "LoopActor::spawn");

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.bus.publish(EngineEvent::LoopStarted { kind });

            loop {
                tokio::select! {
                    biased;
                    _ = cancel_clone.cancelled() => {
                        debug!(loop_kind = %kind, "loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        tick().await;
                    }
                }
            }

            self.bus.publish(EngineEvent::LoopStopped { kind });
        });

        ActorHandle::new(cancel).with_join(join)
    }
}
