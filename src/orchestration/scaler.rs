//! Auto-scaler.
//!
//! Periodically scores how well the current set of active workers copes
//! with its load. A low score brings pending workers online (and raises
//! their capacity); with nothing pending it raises the capacity of the most
//! loaded active workers instead. A high score is only logged.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{WorkerId, WorkerRegistry, WorkerState};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::orchestration::scheduler::{CoordinationEvent, CoordinationEventKind, CoordinationLog};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Scores below this trigger scale-up.
    pub scale_up_below: f64,
    /// Scores above this are logged as a scale-down opportunity.
    pub scale_down_above: f64,
    /// Workers activated or raised per cycle.
    pub max_activations: usize,
    /// Capacity multiplier applied to scaled workers.
    pub capacity_step: f64,
    pub max_capacity: f64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            scale_up_below: 0.6,
            scale_down_above: 0.9,
            max_activations: 3,
            capacity_step: 1.2,
            max_capacity: 3.0,
        }
    }
}

/// The four inputs to the scalability score, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalabilityFactors {
    pub worker_utilization: f64,
    pub resource_availability: f64,
    pub coordination_efficiency: f64,
    pub performance_stability: f64,
}

impl ScalabilityFactors {
    pub fn score(&self) -> f64 {
        (self.worker_utilization
            + self.resource_availability
            + self.coordination_efficiency
            + self.performance_stability)
            / 4.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDecision {
    ScaleUp,
    Hold,
    ConsiderScaleDown,
}

impl ScalerConfig {
    pub fn decide(&self, score: f64) -> ScalingDecision {
        if score < self.scale_up_below {
            ScalingDecision::ScaleUp
        } else if score > self.scale_down_above {
            ScalingDecision::ConsiderScaleDown
        } else {
            ScalingDecision::Hold
        }
    }
}

/// Score of one worker's utilization.
///
/// Rises with use up to the ceiling, then falls off as the worker runs
/// past it. Idle capacity scores 0.5.
pub fn utilization_score(utilization: f64) -> f64 {
    if !utilization.is_finite() {
        return 0.0;
    }
    if utilization <= 1.0 {
        0.5 + 0.5 * utilization.max(0.0)
    } else {
        (1.0 - (utilization - 1.0)).max(0.0) * 0.5
    }
}

/// Workers changed by a scale-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleOutcome {
    pub activated: Vec<WorkerId>,
    pub raised: Vec<(WorkerId, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalerReport {
    pub factors: ScalabilityFactors,
    pub score: f64,
    pub decision: ScalingDecision,
    pub outcome: ScaleOutcome,
}

pub struct AutoScaler {
    config: ScalerConfig,
    registry: Arc<WorkerRegistry>,
    log: CoordinationLog,
    bus: EventBus,
}

impl AutoScaler {
    pub fn new(
        config: ScalerConfig,
        registry: Arc<WorkerRegistry>,
        log: CoordinationLog,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            log,
            bus,
        }
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    /// Compute the four scalability factors from current worker state.
    pub async fn factors(
        &self,
        coordination_efficiency: f64,
        performance_stability: f64,
    ) -> ScalabilityFactors {
        let active = self.registry.by_state(WorkerState::Active).await;
        let samples = self.registry.load_monitor().snapshot().await;
        let table = self.registry.categories();

        let mut utilization = 0.0;
        let mut available = 0usize;
        for worker in &active {
            let max_load = table.policy(worker.category).max_load;
            let sample = samples.get(&worker.id).cloned().unwrap_or_default();
            utilization += utilization_score(sample.utilization(max_load));
            if !sample.is_overloaded(max_load) {
                available += 1;
            }
        }

        let (worker_utilization, resource_availability) = if active.is_empty() {
            (0.0, 0.0)
        } else {
            let n = active.len() as f64;
            (utilization / n, available as f64 / n)
        };

        ScalabilityFactors {
            worker_utilization,
            resource_availability,
            coordination_efficiency: coordination_efficiency.clamp(0.0, 1.0),
            performance_stability: performance_stability.clamp(0.0, 1.0),
        }
    }

    /// Scalability score in [0, 1].
    pub async fn evaluate_scalability(
        &self,
        coordination_efficiency: f64,
        performance_stability: f64,
    ) -> f64 {
        self.factors(coordination_efficiency, performance_stability)
            .await
            .score()
    }

    /// Pending workers in activation order: category priority, then id.
    pub async fn scale_up_candidates(&self) -> Vec<WorkerId> {
        let table = self.registry.categories();
        let mut pending = self.registry.by_state(WorkerState::Pending).await;
        pending.sort_by(|a, b| {
            table
                .policy(a.category)
                .priority
                .cmp(&table.policy(b.category).priority)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.into_iter().map(|w| w.id).collect()
    }

    /// Activate up to `max_activations` of `candidates` and raise their
    /// capacity.
    ///
    /// With no candidates the most loaded active workers that are not idle
    /// get the capacity raise instead. A worker that cannot be scaled is
    /// logged and skipped; the outcome lists only what was done.
    pub async fn scale_up(&self, candidates: &[WorkerId]) -> ScaleOutcome {
        let mut outcome = ScaleOutcome::default();
        let limit = self.config.max_activations;

        if candidates.is_empty() {
            for id in self.most_loaded(limit).await {
                match self.raise_capacity(&id).await {
                    Ok(capacity) => outcome.raised.push((id, capacity)),
                    Err(e) => warn!(worker = %id, error = %e, "capacity raise failed"),
                }
            }
            return outcome;
        }

        for id in candidates.iter().take(limit) {
            let previous = match self.registry.set_state(id, WorkerState::Active).await {
                Ok(previous) => previous,
                Err(e) => {
                    warn!(worker = %id, error = %e, "activation failed");
                    continue;
                }
            };
            if previous != WorkerState::Active {
                info!(worker = %id, "worker activated by auto-scaler");
                self.record(CoordinationEvent::new(
                    CoordinationEventKind::WorkerActivated,
                    vec![id.clone()],
                    format!("activated from {}", previous),
                ))
                .await;
                self.bus
                    .publish(EngineEvent::WorkerActivated { worker: id.clone() });
                outcome.activated.push(id.clone());
            }
            match self.raise_capacity(id).await {
                Ok(capacity) => outcome.raised.push((id.clone(), capacity)),
                Err(e) => warn!(worker = %id, error = %e, "capacity raise failed"),
            }
        }
        outcome
    }

    /// Run one scaling cycle.
    pub async fn run_cycle(
        &self,
        coordination_efficiency: f64,
        performance_stability: f64,
    ) -> ScalerReport {
        let factors = self
            .factors(coordination_efficiency, performance_stability)
            .await;
        let score = factors.score();
        let decision = self.config.decide(score);
        self.bus.publish(EngineEvent::ScalabilityEvaluated { score });
        debug!(score, ?decision, "scalability evaluated");

        let outcome = match decision {
            ScalingDecision::ScaleUp => {
                let candidates = self.scale_up_candidates().await;
                self.scale_up(&candidates).await
            }
            ScalingDecision::ConsiderScaleDown => {
                info!(score, "scale-down considered, no action taken");
                self.record(CoordinationEvent::new(
                    CoordinationEventKind::ScaleDownConsidered,
                    Vec::new(),
                    format!("scalability score {:.2}", score),
                ))
                .await;
                ScaleOutcome::default()
            }
            ScalingDecision::Hold => ScaleOutcome::default(),
        };

        ScalerReport {
            factors,
            score,
            decision,
            outcome,
        }
    }

    async fn raise_capacity(&self, id: &WorkerId) -> Result<f64> {
        let step = self.config.capacity_step.max(1.0);
        let max = self.config.max_capacity.max(1.0);
        let capacity = self
            .registry
            .load_monitor()
            .update(id, |s| {
                s.capacity = (s.capacity * step).min(max);
                s.capacity
            })
            .await?;

        self.record(CoordinationEvent::new(
            CoordinationEventKind::CapacityRaised,
            vec![id.clone()],
            format!("capacity {:.2}", capacity),
        ))
        .await;
        self.bus.publish(EngineEvent::CapacityRaised {
            worker: id.clone(),
            capacity,
        });
        Ok(capacity)
    }

    async fn most_loaded(&self, limit: usize) -> Vec<WorkerId> {
        let samples = self.registry.load_monitor().snapshot().await;
        let mut active: Vec<(WorkerId, f64)> = self
            .registry
            .by_state(WorkerState::Active)
            .await
            .into_iter()
            .filter_map(|w| {
                let sample = samples.get(&w.id).filter(|s| !s.is_underutilized())?;
                Some((w.id, sample.current))
            })
            .collect();
        active.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        active.into_iter().take(limit).map(|(id, _)| id).collect()
    }

    async fn record(&self, event: CoordinationEvent) {
        self.log.write().await.push(event.clone());
        self.bus.publish(EngineEvent::Coordination(event));
    }
}
