//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Worker catalogs and coordinators built from them
//! - Recording worker units that capture the tasks they receive
//! - Scripted analyzer and predictor doubles
//! - A standalone optimization engine harness with explicit time

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

use maestro::config::{Config, WorkerSpec};
use maestro::core::{BoundedLog, Category, WorkerId, WorkerState};
use maestro::orchestration::optimizer::{OptimizationHistory, SharedRecovery};
use maestro::orchestration::{
    Analyzer, OptimizationEngine, OptimizationRecord, OptimizerConfig, PatternSignal, Prediction,
    Predictor, ProfileAnalyzer, RecoveryConfig, RecoveryHandler, UnitId, UnitLocks, UnitProfile,
};
use maestro::worker::{Task, TaskResult, WorkerStatus, WorkerUnit, ABSORB_LOAD, SHED_LOAD};
use maestro::{Coordinator, Error, EventBus, Result};

// ========== Catalogs ==========

pub fn worker(id: &str, category: Category, state: WorkerState, load: f64) -> WorkerSpec {
    WorkerSpec {
        id: id.to_string(),
        category,
        state,
        capabilities: Vec::new(),
        initial_load: load,
    }
}

pub fn active(id: &str, category: Category, load: f64) -> WorkerSpec {
    worker(id, category, WorkerState::Active, load)
}

pub fn pending(id: &str, category: Category) -> WorkerSpec {
    worker(id, category, WorkerState::Pending, 0.0)
}

pub fn config_with(workers: Vec<WorkerSpec>) -> Config {
    Config {
        workers,
        ..Config::default()
    }
}

/// Coordinator over `workers`, each backed by a simulated unit.
pub async fn simulated(workers: Vec<WorkerSpec>) -> Coordinator {
    Coordinator::builder(config_with(workers))
        .with_simulated_workers()
        .build()
        .await
        .expect("Failed to build coordinator")
}

/// A unit profile with every inefficiency the profile analyzer knows about
/// except excessive retries.
pub fn neglected_profile() -> UnitProfile {
    UnitProfile {
        parallelism: 1,
        batch_size: 4,
        caching: false,
        retry_limit: 0,
        error_rate: 0.12,
    }
}

pub fn record(unit: &str, success_rate: f64, improvement: f64, attempted: usize) -> OptimizationRecord {
    OptimizationRecord {
        timestamp: Utc::now(),
        unit: UnitId::from(unit),
        applied: Vec::new(),
        attempted,
        success_rate,
        improvement_score: improvement,
        mode: Default::default(),
        error: None,
    }
}

// ========== Recording worker ==========

/// Worker unit that records every task it is sent.
///
/// Coordination tasks carrying a `target` set its load; other tasks leave
/// it unchanged. `status()` fails while the worker is unreachable.
pub struct RecordingWorker {
    id: WorkerId,
    category: Category,
    load: Mutex<f64>,
    tasks: Mutex<Vec<Task>>,
    reachable: AtomicBool,
}

impl RecordingWorker {
    pub fn new(id: &str, category: Category, load: f64) -> Arc<Self> {
        Arc::new(Self {
            id: WorkerId::from(id),
            category,
            load: Mutex::new(load),
            tasks: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_load(&self, load: f64) {
        *self.load.lock().unwrap() = load;
    }

    pub fn load(&self) -> f64 {
        *self.load.lock().unwrap()
    }

    pub fn task_kinds(&self) -> Vec<String> {
        self.tasks.lock().unwrap().iter().map(|t| t.kind.clone()).collect()
    }
}

#[async_trait]
impl WorkerUnit for RecordingWorker {
    async fn status(&self) -> Result<WorkerStatus> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Worker {
                worker: self.id.clone(),
                message: "unreachable".to_string(),
            });
        }
        Ok(WorkerStatus {
            load: self.load(),
            category: self.category,
            capabilities: Default::default(),
        })
    }

    async fn execute(&self, task: Task) -> Result<TaskResult> {
        if matches!(task.kind.as_str(), SHED_LOAD | ABSORB_LOAD) {
            if let Some(target) = task.payload.get("target").and_then(Value::as_f64) {
                self.set_load(target);
            }
        }
        let task_id = task.id;
        self.tasks.lock().unwrap().push(task);
        Ok(TaskResult {
            task_id,
            worker: self.id.clone(),
            output: Value::Null,
        })
    }
}

// ========== Analysis doubles ==========

/// Analyzer that fails a set number of times, then scores like
/// [`ProfileAnalyzer`].
pub struct ScriptedAnalyzer {
    remaining_failures: AtomicUsize,
    error: fn(&UnitId) -> Error,
    inner: ProfileAnalyzer,
    calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn failing(times: usize, error: fn(&UnitId) -> Error) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicUsize::new(times),
            error,
            inner: ProfileAnalyzer::new(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always_failing(error: fn(&UnitId) -> Error) -> Arc<Self> {
        Self::failing(usize::MAX, error)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn performance(&self, unit: &UnitId, profile: &UnitProfile) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err((self.error)(unit));
        }
        self.inner.performance(unit, profile).await
    }

    async fn patterns(
        &self,
        unit: &UnitId,
        profile: &UnitProfile,
        history: &[f64],
    ) -> Result<PatternSignal> {
        self.inner.patterns(unit, profile, history).await
    }
}

/// Analyzer that scores like [`ProfileAnalyzer`] after a fixed delay.
pub struct SlowAnalyzer {
    delay: Duration,
    inner: ProfileAnalyzer,
}

impl SlowAnalyzer {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            inner: ProfileAnalyzer::new(),
        })
    }
}

#[async_trait]
impl Analyzer for SlowAnalyzer {
    fn name(&self) -> &str {
        "slow"
    }

    async fn performance(&self, unit: &UnitId, profile: &UnitProfile) -> Result<f64> {
        tokio::time::sleep(self.delay).await;
        self.inner.performance(unit, profile).await
    }

    async fn patterns(
        &self,
        unit: &UnitId,
        profile: &UnitProfile,
        history: &[f64],
    ) -> Result<PatternSignal> {
        self.inner.patterns(unit, profile, history).await
    }
}

pub fn generic_error(unit: &UnitId) -> Error {
    Error::Other(format!("{} exploded", unit))
}

/// Predictor returning a fixed prediction, or a model error while failing.
pub struct ScriptedPredictor {
    prediction: Prediction,
    failing: AtomicBool,
}

impl ScriptedPredictor {
    pub const NAME: &'static str = "scripted-trend";

    pub fn new(expected: f64, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            prediction: Prediction {
                expected,
                confidence,
            },
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Predictor for ScriptedPredictor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn predict(&self, unit: &UnitId, _history: &[f64]) -> Result<Prediction> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Model {
                model: Self::NAME.to_string(),
                message: format!("no convergence for {}", unit),
            });
        }
        Ok(self.prediction)
    }
}

// ========== Optimizer harness ==========

/// An optimization engine with its shared state exposed, driven with
/// explicit timestamps.
pub struct OptimizerHarness {
    pub engine: OptimizationEngine,
    pub history: OptimizationHistory,
    pub recovery: SharedRecovery,
    pub locks: Arc<UnitLocks>,
    pub bus: EventBus,
}

impl OptimizerHarness {
    pub fn new(analyzer: Arc<dyn Analyzer>, predictor: Arc<dyn Predictor>) -> Self {
        let history: OptimizationHistory = Arc::new(RwLock::new(BoundedLog::new(100)));
        let recovery: SharedRecovery =
            Arc::new(RwLock::new(RecoveryHandler::new(RecoveryConfig::default())));
        let locks = Arc::new(UnitLocks::new());
        let bus = EventBus::default();
        let engine = OptimizationEngine::new(
            OptimizerConfig::default(),
            analyzer,
            predictor,
            Arc::clone(&history),
            Arc::clone(&recovery),
            Arc::clone(&locks),
            bus.clone(),
        );
        Self {
            engine,
            history,
            recovery,
            locks,
            bus,
        }
    }

    pub fn with_unit(self, id: &str, profile: UnitProfile) -> Self {
        self.engine.register_unit(UnitId::from(id), profile);
        self
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

pub fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    base + chrono::Duration::seconds(secs)
}
