//! Coordination scheduler.
//!
//! Each cycle the scheduler refreshes worker status, reads load and
//! dependency state, detects coordination opportunities, ranks all of them,
//! and only then executes the highest-priority ones. Ranking before
//! execution means a lower-priority action can never run ahead of a
//! higher-priority one within the same cycle.
//!
//! Opportunity kinds:
//! - `load_balancing`: an overloaded worker and at least one underutilized
//!   partner exist in the same cycle
//! - `cross_worker_sync`: a worker and one of its dependencies diverge in
//!   load by more than `sync_gap`
//! - `resource_optimization`: previously scaled-up workers sit idle and
//!   their extra capacity can be released

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::{BoundedLog, DependencyGraph, LoadSample, WorkerId, WorkerRegistry, WorkerState};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::orchestration::knowledge::Bias;
use crate::worker::{Task, ABSORB_LOAD, SHED_LOAD, SYNC};

/// Shared log of executed coordination actions.
pub type CoordinationLog = Arc<RwLock<BoundedLog<CoordinationEvent>>>;

/// Configuration for the coordination scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Load below which a worker can act as a rebalancing partner.
    pub underutilized_threshold: f64,
    /// Multiplicative reduction applied to an overloaded worker's load.
    pub damping: f64,
    /// Rebalancing never drives load below this value.
    pub load_floor: f64,
    /// Upper bound on actions executed per cycle.
    pub max_actions_per_cycle: usize,
    /// Minimum opportunity priority before knowledge-store bias.
    pub base_priority_threshold: f64,
    /// Treat dependency ordering as a hard constraint.
    pub strict_dependencies: bool,
    /// Load gap between dependent workers that warrants a sync.
    pub sync_gap: f64,
    /// Divisor applied to idle scaled-up capacity.
    pub capacity_release_step: f64,
    /// Coordination events retained.
    pub event_log_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            underutilized_threshold: crate::core::UNDERUTILIZED_THRESHOLD,
            damping: 0.8,
            load_floor: 0.1,
            max_actions_per_cycle: 5,
            base_priority_threshold: 0.3,
            strict_dependencies: false,
            sync_gap: 0.4,
            capacity_release_step: 1.2,
            event_log_capacity: 500,
        }
    }
}

/// Kind of coordination opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    LoadBalancing,
    CrossWorkerSync,
    ResourceOptimization,
}

impl std::fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpportunityKind::LoadBalancing => write!(f, "load_balancing"),
            OpportunityKind::CrossWorkerSync => write!(f, "cross_worker_sync"),
            OpportunityKind::ResourceOptimization => write!(f, "resource_optimization"),
        }
    }
}

/// A detected situation warranting coordination this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinationOpportunity {
    pub kind: OpportunityKind,
    /// Priority in [0, 1].
    pub priority: f64,
    pub workers: Vec<WorkerId>,
    /// Best (lowest) category priority class among `workers`.
    #[serde(skip)]
    pub category_priority: u8,
}

impl CoordinationOpportunity {
    pub fn involves(&self, id: &WorkerId) -> bool {
        self.workers.contains(id)
    }
}

/// What a coordination event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationEventKind {
    Rebalanced,
    Synchronized,
    CapacityReleased,
    DependencyDeferred,
    WorkerActivated,
    CapacityRaised,
    ScaleDownConsidered,
    WorkerDeactivated,
    WorkerReactivated,
}

/// An entry in the coordination log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: CoordinationEventKind,
    pub workers: Vec<WorkerId>,
    pub detail: String,
}

impl CoordinationEvent {
    pub fn new(kind: CoordinationEventKind, workers: Vec<WorkerId>, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            workers,
            detail: detail.into(),
        }
    }
}

/// Load change applied to one overloaded worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceAction {
    pub worker: WorkerId,
    pub before: f64,
    pub after: f64,
    pub partners: Vec<WorkerId>,
    /// Dependents that were mid-operation when load was moved.
    pub busy_dependents: Vec<WorkerId>,
}

/// Summary of one scheduler cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// All opportunities, in ranked order.
    pub detected: Vec<CoordinationOpportunity>,
    /// Opportunities that were executed, in execution order.
    pub executed: Vec<CoordinationOpportunity>,
    /// Threshold in effect for this cycle.
    pub threshold: f64,
    /// Executions that failed.
    pub failures: usize,
}

impl CycleReport {
    /// Share of detected opportunities that were executed.
    ///
    /// A cycle with nothing to do counts as fully efficient.
    pub fn efficiency(&self) -> f64 {
        if self.detected.is_empty() {
            1.0
        } else {
            self.executed.len() as f64 / self.detected.len() as f64
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerView {
    state: WorkerState,
    max_load: f64,
    priority: u8,
    sample: LoadSample,
}

/// The coordination scheduler.
pub struct CoordinationScheduler {
    config: SchedulerConfig,
    registry: Arc<WorkerRegistry>,
    graph: Arc<DependencyGraph>,
    log: CoordinationLog,
    bus: EventBus,
    last_report: Option<CycleReport>,
}

impl CoordinationScheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<WorkerRegistry>,
        graph: Arc<DependencyGraph>,
        log: CoordinationLog,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            graph,
            log,
            bus,
            last_report: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    /// Priority threshold after applying the knowledge-store bias.
    pub fn effective_threshold(&self, bias: &Bias) -> f64 {
        (self.config.base_priority_threshold + bias.priority_threshold_adjustment).clamp(0.05, 0.95)
    }

    /// Run one full coordination cycle.
    pub async fn run_cycle(&mut self, bias: &Bias) -> CycleReport {
        self.refresh_status().await;

        let mut detected = self.detect().await;
        rank(&mut detected);

        let threshold = self.effective_threshold(bias);
        let mut report = CycleReport {
            threshold,
            ..Default::default()
        };

        let selected: Vec<CoordinationOpportunity> = detected
            .iter()
            .filter(|o| o.priority >= threshold)
            .take(self.config.max_actions_per_cycle)
            .cloned()
            .collect();

        for opportunity in selected {
            match self.execute(&opportunity).await {
                Ok(()) => report.executed.push(opportunity),
                Err(e) => {
                    warn!(kind = %opportunity.kind, error = %e, "coordination action failed");
                    report.failures += 1;
                }
            }
        }

        debug!(
            detected = detected.len(),
            executed = report.executed.len(),
            threshold,
            "scheduler cycle complete"
        );
        report.detected = detected;
        self.last_report = Some(report.clone());
        report
    }

    /// Poll every attached worker unit and record its reported load.
    ///
    /// An active worker whose status call fails is marked inactive; an
    /// inactive worker that answers again is reactivated.
    pub async fn refresh_status(&self) {
        let units = self.registry.units().await;
        if units.is_empty() {
            return;
        }

        let polls = units.into_iter().map(|(id, state, unit)| async move {
            let status = unit.status().await;
            (id, state, status)
        });

        for (id, state, status) in join_all(polls).await {
            match status {
                Ok(status) => {
                    self.registry.load_monitor().record(&id, status.load).await;
                    if state == WorkerState::Inactive
                        && self.registry.set_state(&id, WorkerState::Active).await.is_ok()
                    {
                        self.record(CoordinationEvent::new(
                            CoordinationEventKind::WorkerReactivated,
                            vec![id],
                            "status reachable again",
                        ))
                        .await;
                    }
                }
                Err(e) => {
                    warn!(worker = %id, error = %e, "worker status unavailable");
                    if state == WorkerState::Active
                        && self.registry.set_state(&id, WorkerState::Inactive).await.is_ok()
                    {
                        self.record(CoordinationEvent::new(
                            CoordinationEventKind::WorkerDeactivated,
                            vec![id],
                            e.to_string(),
                        ))
                        .await;
                    }
                }
            }
        }
    }

    /// Detect coordination opportunities from the current state.
    ///
    /// The returned list is unranked.
    pub async fn detect(&self) -> Vec<CoordinationOpportunity> {
        let views = self.views().await;
        let mut opportunities = Vec::new();

        let mut active: Vec<(&WorkerId, &WorkerView)> = views
            .iter()
            .filter(|(_, v)| v.state == WorkerState::Active)
            .collect();
        active.sort_by(|a, b| a.0.cmp(b.0));

        // Load balancing
        let partners: Vec<&WorkerId> = active
            .iter()
            .filter(|(_, v)| self.is_partner(v))
            .map(|(id, _)| *id)
            .collect();
        if !partners.is_empty() {
            for (id, view) in active.iter().filter(|(_, v)| v.sample.is_overloaded(v.max_load)) {
                let excess = view.sample.current - view.sample.ceiling(view.max_load);
                let mut workers = vec![(*id).clone()];
                workers.extend(partners.iter().map(|p| (*p).clone()));
                opportunities.push(self.opportunity(
                    OpportunityKind::LoadBalancing,
                    0.7 + excess,
                    workers,
                    &views,
                ));
            }
        }

        // Cross-worker sync between a worker and its dependencies
        for (id, view) in &active {
            for dependency in self.graph.dependencies_of(id) {
                let Some(dep_view) = views.get(&dependency) else {
                    continue;
                };
                if dep_view.state != WorkerState::Active {
                    continue;
                }
                let gap = (view.sample.current - dep_view.sample.current).abs();
                if gap > self.config.sync_gap {
                    opportunities.push(self.opportunity(
                        OpportunityKind::CrossWorkerSync,
                        0.4 + gap / 2.0,
                        vec![dependency.clone(), (*id).clone()],
                        &views,
                    ));
                }
            }
        }

        // Idle capacity that was previously scaled up
        let idle: Vec<WorkerId> = active
            .iter()
            .filter(|(_, v)| {
                v.sample.current < self.config.underutilized_threshold && v.sample.capacity > 1.0
            })
            .map(|(id, _)| (*id).clone())
            .collect();
        if !idle.is_empty() {
            opportunities.push(self.opportunity(
                OpportunityKind::ResourceOptimization,
                0.4,
                idle,
                &views,
            ));
        }

        opportunities
    }

    /// Execute a single opportunity.
    pub async fn execute(&self, opportunity: &CoordinationOpportunity) -> Result<()> {
        match opportunity.kind {
            OpportunityKind::LoadBalancing => {
                self.rebalance(&opportunity.workers).await?;
            }
            OpportunityKind::CrossWorkerSync => {
                self.synchronize(&opportunity.workers).await?;
            }
            OpportunityKind::ResourceOptimization => {
                self.release_capacity(&opportunity.workers).await?;
            }
        }
        Ok(())
    }

    /// Rebalance load among `ids`.
    ///
    /// Every overloaded worker among `ids` has its load damped and clamped to
    /// its ceiling; the shed load is spread over the underutilized workers
    /// among `ids`. Does nothing when either group is empty.
    pub async fn rebalance(&self, ids: &[WorkerId]) -> Result<Vec<RebalanceAction>> {
        let views = self.views().await;
        let mut overloaded = Vec::new();
        let mut partners = Vec::new();
        for id in ids {
            let view = views
                .get(id)
                .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
            if view.state != WorkerState::Active {
                continue;
            }
            if view.sample.is_overloaded(view.max_load) {
                overloaded.push((id.clone(), view.max_load));
            } else if self.is_partner(view) {
                partners.push((id.clone(), view.max_load));
            }
        }

        if overloaded.is_empty() || partners.is_empty() {
            return Ok(Vec::new());
        }

        let monitor = self.registry.load_monitor();
        let partner_ids: Vec<WorkerId> = partners.iter().map(|(id, _)| id.clone()).collect();
        let mut actions = Vec::new();

        for (id, max_load) in overloaded {
            let busy_dependents: Vec<WorkerId> = self
                .graph
                .dependents_of(&id)
                .into_iter()
                .filter(|d| {
                    views
                        .get(d)
                        .map(|v| v.state == WorkerState::Active && v.sample.current > 0.0)
                        .unwrap_or(false)
                })
                .collect();

            if self.config.strict_dependencies && !busy_dependents.is_empty() {
                info!(worker = %id, dependents = ?busy_dependents, "rebalance deferred by dependency");
                self.record(CoordinationEvent::new(
                    CoordinationEventKind::DependencyDeferred,
                    std::iter::once(id.clone()).chain(busy_dependents).collect(),
                    "dependent workers mid-operation",
                ))
                .await;
                continue;
            }

            let damping = self.config.damping;
            let floor = self.config.load_floor;
            let (before, after) = monitor
                .update(&id, |s| {
                    let before = s.current;
                    let ceiling = s.ceiling(max_load);
                    let target = (before * damping).min(ceiling).max(floor.min(ceiling));
                    s.observe(target);
                    (before, target)
                })
                .await?;

            let share = (before - after) / partners.len() as f64;
            for (partner, partner_max) in &partners {
                let absorbed = monitor
                    .update(partner, |s| {
                        let target = (s.current + share).min(s.ceiling(*partner_max)).max(s.current);
                        s.observe(target);
                        target
                    })
                    .await?;
                self.notify(partner, ABSORB_LOAD, absorbed).await;
            }
            self.notify(&id, SHED_LOAD, after).await;

            let detail = if busy_dependents.is_empty() {
                format!("load {:.2} -> {:.2}", before, after)
            } else {
                format!(
                    "load {:.2} -> {:.2} while dependents busy: {}",
                    before,
                    after,
                    join_ids(&busy_dependents)
                )
            };
            info!(worker = %id, before, after, partners = partner_ids.len(), "rebalanced");
            let mut workers = vec![id.clone()];
            workers.extend(partner_ids.iter().cloned());
            self.record(CoordinationEvent::new(
                CoordinationEventKind::Rebalanced,
                workers,
                detail,
            ))
            .await;

            actions.push(RebalanceAction {
                worker: id,
                before,
                after,
                partners: partner_ids.clone(),
                busy_dependents,
            });
        }

        Ok(actions)
    }

    async fn synchronize(&self, workers: &[WorkerId]) -> Result<()> {
        for (i, id) in workers.iter().enumerate() {
            if let Some(unit) = self.registry.unit(id).await {
                let peers: Vec<&WorkerId> =
                    workers.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, w)| w).collect();
                unit.execute(Task::coordination(SYNC, json!({ "peers": peers })))
                    .await?;
            }
        }
        info!(workers = %join_ids(workers), "synchronized dependent workers");
        self.record(CoordinationEvent::new(
            CoordinationEventKind::Synchronized,
            workers.to_vec(),
            "dependency load gap",
        ))
        .await;
        Ok(())
    }

    async fn release_capacity(&self, workers: &[WorkerId]) -> Result<()> {
        let step = self.config.capacity_release_step.max(1.0);
        for id in workers {
            let capacity = self
                .registry
                .load_monitor()
                .update(id, |s| {
                    s.capacity = (s.capacity / step).max(1.0);
                    s.capacity
                })
                .await?;
            debug!(worker = %id, capacity, "released idle capacity");
        }
        self.record(CoordinationEvent::new(
            CoordinationEventKind::CapacityReleased,
            workers.to_vec(),
            format!("capacity divided by {:.2}", step),
        ))
        .await;
        Ok(())
    }

    async fn notify(&self, id: &WorkerId, kind: &str, target: f64) {
        if let Some(unit) = self.registry.unit(id).await {
            if let Err(e) = unit
                .execute(Task::coordination(kind, json!({ "target": target })))
                .await
            {
                warn!(worker = %id, error = %e, "worker rejected coordination task");
            }
        }
    }

    async fn record(&self, event: CoordinationEvent) {
        self.log.write().await.push(event.clone());
        self.bus.publish(EngineEvent::Coordination(event));
    }

    fn is_partner(&self, view: &WorkerView) -> bool {
        view.sample.current < self.config.underutilized_threshold
            && !view.sample.is_overloaded(view.max_load)
    }

    fn opportunity(
        &self,
        kind: OpportunityKind,
        priority: f64,
        workers: Vec<WorkerId>,
        views: &HashMap<WorkerId, WorkerView>,
    ) -> CoordinationOpportunity {
        let category_priority = workers
            .iter()
            .filter_map(|w| views.get(w).map(|v| v.priority))
            .min()
            .unwrap_or(u8::MAX);
        CoordinationOpportunity {
            kind,
            priority: priority.clamp(0.0, 1.0),
            workers,
            category_priority,
        }
    }

    async fn views(&self) -> HashMap<WorkerId, WorkerView> {
        let samples = self.registry.load_monitor().snapshot().await;
        let table = self.registry.categories();
        self.registry
            .get_all()
            .await
            .into_iter()
            .map(|w| {
                let policy = table.policy(w.category);
                let sample = samples.get(&w.id).cloned().unwrap_or_default();
                (
                    w.id,
                    WorkerView {
                        state: w.state,
                        max_load: policy.max_load,
                        priority: policy.priority,
                        sample,
                    },
                )
            })
            .collect()
    }
}

/// Order opportunities by priority (highest first).
///
/// Ties go to the opportunity touching the most important category, then
/// to the lexicographically smallest worker list so ranking is
/// deterministic.
pub fn rank(opportunities: &mut [CoordinationOpportunity]) {
    opportunities.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.category_priority.cmp(&b.category_priority))
            .then_with(|| a.workers.cmp(&b.workers))
    });
}

fn join_ids(ids: &[WorkerId]) -> String {
    ids.iter().map(|w| w.as_str()).collect::<Vec<_>>().join(",")
}
