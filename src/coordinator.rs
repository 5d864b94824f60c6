//! The master coordinator.
//!
//! Owns the shared coordination state, runs the four loops as independent
//! actors and exposes the status query, loop control, event subscription
//! and task routing.
//!
//! Every `run_*_cycle` method is also what the matching actor calls on each
//! tick, so a single cycle can be driven synchronously from tests and the
//! `status` command.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use crate::actors::{ActorHandle, LoopActor, LoopKind};
use crate::config::Config;
use crate::core::{
    BoundedLog, Category, DependencyGraph, LoadMonitor, Worker, WorkerId, WorkerRegistry,
    WorkerState,
};
use crate::events::{EngineEvent, EventBus};
use crate::orchestration::optimizer::{performance_stability, SharedRecovery};
use crate::orchestration::reflection::SharedKnowledge;
use crate::orchestration::scaler::ScalerReport;
use crate::orchestration::scheduler::CoordinationLog;
use crate::orchestration::{
    estimate_duration, Analyzer, AutoScaler, Bias, CoordinationEvent, CoordinationScheduler,
    CycleReport, KnowledgeStore, OptimizationEngine, OptimizationHistory, OptimizerCycleReport,
    Predictor, ProfileAnalyzer, RecoveryHandler, ReflectionEngine, ReflectionReport, TaskRouter,
    TrendPredictor, UnitId, UnitLocks, UnitProfile,
};
use crate::worker::{SimulatedWorker, Task, TaskResult, WorkerUnit};
use crate::{Error, Result};

/// Aggregate metrics maintained by the loops.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// Executed / detected opportunities of the last scheduler cycle.
    pub coordination_efficiency: f64,
    /// Score of the last scaler cycle.
    pub scalability_index: f64,
    pub cycles: BTreeMap<LoopKind, u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            coordination_efficiency: 1.0,
            scalability_index: 0.0,
            cycles: LoopKind::ALL.iter().map(|k| (*k, 0)).collect(),
        }
    }
}

impl Metrics {
    fn tick(&mut self, kind: LoopKind) {
        *self.cycles.entry(kind).or_insert(0) += 1;
    }
}

/// Per-category slice of the status report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryStatus {
    pub total: usize,
    pub active: usize,
    /// Mean current load of the active workers.
    pub average_load: f64,
}

/// Snapshot of the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub total_workers: usize,
    pub active_workers: usize,
    pub pending_workers: usize,
    pub inactive_workers: usize,
    pub categories: BTreeMap<Category, CategoryStatus>,
    /// Active workers currently above their ceiling.
    pub overloaded_workers: Vec<WorkerId>,
    pub scalability_index: f64,
    pub coordination_efficiency: f64,
    pub performance_stability: f64,
    pub units: usize,
    pub recent_events: Vec<CoordinationEvent>,
    pub review_queue: Vec<UnitId>,
    pub critical_errors: usize,
    pub patterns: usize,
    pub lessons: usize,
    pub bias: Bias,
    pub loops: BTreeMap<LoopKind, bool>,
    pub cycles: BTreeMap<LoopKind, u64>,
}

/// State shared between the coordinator and its loop actors.
struct Shared {
    config: Config,
    registry: Arc<WorkerRegistry>,
    graph: Arc<DependencyGraph>,
    scheduler: Mutex<CoordinationScheduler>,
    scaler: AutoScaler,
    optimizer: OptimizationEngine,
    reflection: ReflectionEngine,
    knowledge: SharedKnowledge,
    coordination_log: CoordinationLog,
    history: OptimizationHistory,
    recovery: SharedRecovery,
    metrics: RwLock<Metrics>,
    bus: EventBus,
}

impl Shared {
    async fn bias(&self) -> Bias {
        self.knowledge.read().await.bias()
    }

    async fn scheduler_cycle(&self) -> CycleReport {
        let bias = self.bias().await;
        let report = self.scheduler.lock().await.run_cycle(&bias).await;
        let mut metrics = self.metrics.write().await;
        metrics.coordination_efficiency = report.efficiency();
        metrics.tick(LoopKind::Scheduler);
        report
    }

    async fn scaler_cycle(&self) -> ScalerReport {
        let efficiency = self.metrics.read().await.coordination_efficiency;
        let stability = performance_stability(&*self.history.read().await);
        let report = self.scaler.run_cycle(efficiency, stability).await;

        let mut metrics = self.metrics.write().await;
        metrics.tick(LoopKind::Scaler);
        metrics.scalability_index = report.score;
        report
    }

    async fn optimizer_cycle(&self) -> OptimizerCycleReport {
        let bias = self.bias().await;
        let report = self.optimizer.run_cycle(Utc::now(), &bias).await;
        self.metrics.write().await.tick(LoopKind::Optimizer);
        report
    }

    async fn reflection_cycle(&self) -> ReflectionReport {
        let efficiency = self.metrics.read().await.coordination_efficiency;
        let report = self.reflection.reflect(efficiency, Utc::now()).await;
        self.metrics.write().await.tick(LoopKind::Reflection);
        report
    }

    async fn tick(&self, kind: LoopKind) {
        match kind {
            LoopKind::Scheduler => {
                self.scheduler_cycle().await;
            }
            LoopKind::Scaler => {
                self.scaler_cycle().await;
            }
            LoopKind::Optimizer => {
                self.optimizer_cycle().await;
            }
            LoopKind::Reflection => {
                self.reflection_cycle().await;
            }
        }
    }
}

/// Builds a [`Coordinator`] from a [`Config`].
pub struct CoordinatorBuilder {
    config: Config,
    analyzer: Option<Arc<dyn Analyzer>>,
    predictor: Option<Arc<dyn Predictor>>,
    units: Vec<(WorkerId, Arc<dyn WorkerUnit>)>,
    simulated: bool,
}

impl CoordinatorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            analyzer: None,
            predictor: None,
            units: Vec::new(),
            simulated: false,
        }
    }

    /// Replace the default [`ProfileAnalyzer`].
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Replace the default [`TrendPredictor`].
    pub fn with_predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Bind a worker unit to a catalog worker.
    pub fn attach(mut self, id: impl Into<WorkerId>, unit: Arc<dyn WorkerUnit>) -> Self {
        self.units.push((id.into(), unit));
        self
    }

    /// Back every catalog worker without an explicit unit by a
    /// [`SimulatedWorker`].
    pub fn with_simulated_workers(mut self) -> Self {
        self.simulated = true;
        self
    }

    pub async fn build(self) -> Result<Coordinator> {
        let config = self.config;
        config.validate()?;

        let bus = EventBus::new(config.loops.bus_capacity);
        let load = Arc::new(LoadMonitor::new());
        let registry = Arc::new(WorkerRegistry::new(config.category_table()?, load));
        let graph = Arc::new(config.dependency_graph()?);

        for spec in &config.workers {
            let worker = Worker::new(spec.id.as_str(), spec.category)
                .with_state(spec.state)
                .with_capabilities(spec.capabilities.iter().cloned());
            registry.register_with_load(worker, spec.initial_load).await;
        }

        let explicit: Vec<WorkerId> = self.units.iter().map(|(id, _)| id.clone()).collect();
        for (id, unit) in self.units {
            registry.attach(&id, unit).await?;
        }
        if self.simulated {
            for spec in &config.workers {
                let id = WorkerId::from(spec.id.as_str());
                if explicit.contains(&id) {
                    continue;
                }
                let unit = SimulatedWorker::new(id.clone(), spec.category, spec.initial_load)
                    .with_capabilities(spec.capabilities.iter().cloned());
                registry.attach(&id, Arc::new(unit)).await?;
            }
        }

        let coordination_log: CoordinationLog = Arc::new(RwLock::new(BoundedLog::new(
            config.scheduler.event_log_capacity,
        )));
        let history: OptimizationHistory = Arc::new(RwLock::new(BoundedLog::new(
            config.optimizer.history_capacity,
        )));
        let recovery: SharedRecovery =
            Arc::new(RwLock::new(RecoveryHandler::new(config.recovery.clone())));
        let knowledge: SharedKnowledge = Arc::new(RwLock::new(KnowledgeStore::new(
            config.reflection.knowledge_capacity,
        )));
        let locks = Arc::new(UnitLocks::new());

        let scheduler = CoordinationScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&registry),
            Arc::clone(&graph),
            Arc::clone(&coordination_log),
            bus.clone(),
        );
        let scaler = AutoScaler::new(
            config.scaler.clone(),
            Arc::clone(&registry),
            Arc::clone(&coordination_log),
            bus.clone(),
        );
        let optimizer = OptimizationEngine::new(
            config.optimizer.clone(),
            self.analyzer.unwrap_or_else(|| Arc::new(ProfileAnalyzer::new())),
            self.predictor.unwrap_or_else(|| Arc::new(TrendPredictor::new())),
            Arc::clone(&history),
            Arc::clone(&recovery),
            locks,
            bus.clone(),
        );
        for unit in &config.units {
            optimizer.register_unit(UnitId::from(unit.id.as_str()), unit.profile.clone());
        }
        let reflection = ReflectionEngine::new(
            config.reflection.clone(),
            Arc::clone(&history),
            Arc::clone(&coordination_log),
            Arc::clone(&knowledge),
            bus.clone(),
        );

        info!(
            workers = config.workers.len(),
            dependencies = graph.dependency_count(),
            units = config.units.len(),
            "coordinator built"
        );

        Ok(Coordinator {
            shared: Arc::new(Shared {
                config,
                registry,
                graph,
                scheduler: Mutex::new(scheduler),
                scaler,
                optimizer,
                reflection,
                knowledge,
                coordination_log,
                history,
                recovery,
                metrics: RwLock::new(Metrics::default()),
                bus,
            }),
            loops: Mutex::new(BTreeMap::new()),
        })
    }
}

/// Runs the coordination loops over a shared worker catalog.
pub struct Coordinator {
    shared: Arc<Shared>,
    loops: Mutex<BTreeMap<LoopKind, ActorHandle>>,
}

impl Coordinator {
    pub fn builder(config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.shared.registry
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.shared.graph
    }

    pub fn history(&self) -> &OptimizationHistory {
        &self.shared.history
    }

    pub fn knowledge(&self) -> &SharedKnowledge {
        &self.shared.knowledge
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.bus.subscribe()
    }

    // ========== Loop control ==========

    /// Start one loop. Returns `false` if it is already running.
    pub async fn start(&self, kind: LoopKind) -> bool {
        let mut loops = self.loops.lock().await;
        if loops.get(&kind).is_some_and(|h| !h.is_finished()) {
            debug!(loop_kind = %kind, "loop already running");
            return false;
        }

        let interval = self.shared.config.loops.interval(kind);
        let shared = Arc::clone(&self.shared);
        let handle = LoopActor::new(kind, interval, self.shared.bus.clone()).spawn(move || {
            let shared = Arc::clone(&shared);
            async move { shared.tick(kind).await }
        });
        info!(loop_kind = %kind, interval_ms = interval.as_millis() as u64, "loop started");
        loops.insert(kind, handle);
        true
    }

    /// Stop one loop, waiting for its current cycle to finish.
    ///
    /// Returns `false` if it was not running.
    pub async fn stop(&self, kind: LoopKind) -> bool {
        let handle = self.loops.lock().await.remove(&kind);
        match handle {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.stop().await;
                info!(loop_kind = %kind, "loop stopped");
                was_running
            }
            None => false,
        }
    }

    pub async fn start_all(&self) {
        for kind in LoopKind::ALL {
            self.start(kind).await;
        }
    }

    pub async fn stop_all(&self) {
        for kind in LoopKind::ALL {
            self.stop(kind).await;
        }
    }

    pub async fn is_running(&self, kind: LoopKind) -> bool {
        self.loops
            .lock()
            .await
            .get(&kind)
            .is_some_and(|h| !h.is_cancelled() && !h.is_finished())
    }

    // ========== Single cycles ==========

    pub async fn run_scheduler_cycle(&self) -> CycleReport {
        self.shared.scheduler_cycle().await
    }

    pub async fn run_scaler_cycle(&self) -> ScalerReport {
        self.shared.scaler_cycle().await
    }

    pub async fn run_optimizer_cycle(&self) -> OptimizerCycleReport {
        self.shared.optimizer_cycle().await
    }

    pub async fn run_reflection_cycle(&self) -> ReflectionReport {
        self.shared.reflection_cycle().await
    }

    /// One cycle of every loop, in scheduler, scaler, optimizer, reflection
    /// order.
    pub async fn run_all_cycles(&self) {
        self.run_scheduler_cycle().await;
        self.run_scaler_cycle().await;
        self.run_optimizer_cycle().await;
        self.run_reflection_cycle().await;
    }

    // ========== Units of work ==========

    pub async fn register_unit(&self, id: impl Into<UnitId>, profile: UnitProfile) -> Result<bool> {
        profile.validate()?;
        Ok(self.shared.optimizer.register_unit(id.into(), profile))
    }

    pub async fn update_profile(&self, id: &UnitId, profile: UnitProfile) -> Result<()> {
        profile.validate()?;
        self.shared.optimizer.update_profile(id, profile)
    }

    /// Release a unit from manual review. Returns `false` if it was not
    /// flagged.
    pub async fn clear_review(&self, unit: &UnitId) -> bool {
        let cleared = self.shared.recovery.write().await.clear_review(unit, Utc::now());
        if cleared {
            info!(unit = %unit, "unit cleared from manual review");
        }
        cleared
    }

    // ========== Tasks ==========

    /// Route a task to the best eligible worker and execute it.
    pub async fn dispatch(&self, task: Task) -> Result<TaskResult> {
        TaskRouter::new(&self.shared.config.router, &self.shared.registry)
            .dispatch(task)
            .await
    }

    /// Expected handling time of a task of `priority` on worker `id`.
    pub async fn estimate(&self, id: &WorkerId, priority: u8) -> Result<Duration> {
        let policy = self
            .shared
            .registry
            .policy_of(id)
            .await
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        Ok(estimate_duration(&policy, priority))
    }

    // ========== Status ==========

    pub async fn status(&self) -> SystemStatus {
        let shared = &self.shared;
        let workers = shared.registry.get_all().await;
        let samples = shared.registry.load_monitor().snapshot().await;
        let table = shared.registry.categories();

        let count = |state: WorkerState| workers.iter().filter(|w| w.state == state).count();
        let mut categories: BTreeMap<Category, CategoryStatus> = BTreeMap::new();
        let mut load_sums: BTreeMap<Category, f64> = BTreeMap::new();
        let mut overloaded_workers = Vec::new();

        for worker in &workers {
            let entry = categories.entry(worker.category).or_default();
            entry.total += 1;
            if !worker.is_active() {
                continue;
            }
            entry.active += 1;
            let sample = samples.get(&worker.id).cloned().unwrap_or_default();
            *load_sums.entry(worker.category).or_insert(0.0) += sample.current;
            if sample.is_overloaded(table.policy(worker.category).max_load) {
                overloaded_workers.push(worker.id.clone());
            }
        }
        for (category, entry) in categories.iter_mut() {
            if entry.active > 0 {
                let sum = load_sums.get(category).copied().unwrap_or(0.0);
                entry.average_load = sum / entry.active as f64;
            }
        }

        let metrics = shared.metrics.read().await.clone();
        let recent_events = shared
            .coordination_log
            .read()
            .await
            .recent_cloned(shared.config.loops.recent_events);
        let (review_queue, critical_errors) = {
            let recovery = shared.recovery.read().await;
            (recovery.review_queue(), recovery.critical_count())
        };
        let (patterns, lessons, bias) = {
            let knowledge = shared.knowledge.read().await;
            (knowledge.pattern_count(), knowledge.lesson_count(), knowledge.bias())
        };
        let performance_stability = performance_stability(&*shared.history.read().await);
        let units = shared.optimizer.unit_count();

        let mut loops = BTreeMap::new();
        for kind in LoopKind::ALL {
            loops.insert(kind, self.is_running(kind).await);
        }

        SystemStatus {
            total_workers: workers.len(),
            active_workers: count(WorkerState::Active),
            pending_workers: count(WorkerState::Pending),
            inactive_workers: count(WorkerState::Inactive),
            categories,
            overloaded_workers,
            scalability_index: metrics.scalability_index,
            coordination_efficiency: metrics.coordination_efficiency,
            performance_stability,
            units,
            recent_events,
            review_queue,
            critical_errors,
            patterns,
            lessons,
            bias,
            loops,
            cycles: metrics.cycles,
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for handle in self.loops.get_mut().values() {
            handle.shutdown();
        }
    }
}
