//! Optimization engine.
//!
//! Each cycle analyzes every registered unit of work, decides whether it is
//! worth optimizing and, if so, applies validated improvements one at a
//! time, keeping only those that measurably help.
//!
//! ## Triggers
//!
//! A unit becomes an optimization candidate when at least two of these hold:
//! - its performance dropped more than `performance_drop` below baseline
//! - an inefficiency was detected that the previous analysis did not see
//! - its score drifted more than `drift_threshold` from recent history
//! - the cooldown since its last optimization has elapsed
//!
//! Recovery can force the next attempt regardless of triggers, in a
//! restricted mode (conservative or safe fallback).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::BoundedLog;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::orchestration::knowledge::Bias;
use crate::orchestration::recovery::{RecoveryAction, RecoveryHandler};
use crate::orchestration::strategy::{Analyzer, PatternSignal, Prediction, Predictor};
use crate::orchestration::unit::{Improvement, Inefficiency, Risk, UnitId, UnitProfile, UnitState};

/// Shared bounded log of optimization outcomes.
pub type OptimizationHistory = Arc<RwLock<BoundedLog<OptimizationRecord>>>;

/// Shared recovery state.
pub type SharedRecovery = Arc<RwLock<RecoveryHandler>>;

/// Records considered when measuring performance stability.
pub const STABILITY_WINDOW: usize = 20;

/// Configuration for the optimization engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Minimum time between optimizations of the same unit.
    pub cooldown_secs: u64,
    /// Performance loss below baseline that counts as a drop.
    pub performance_drop: f64,
    /// Score drift that counts as a pattern change.
    pub drift_threshold: f64,
    /// Optimization records retained.
    pub history_capacity: usize,
    /// Upper bound on one optimization attempt.
    pub optimize_timeout_secs: u64,
    /// Composite scores kept per unit for drift and prediction.
    pub score_window: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            performance_drop: 0.05,
            drift_threshold: 0.3,
            history_capacity: 1000,
            optimize_timeout_secs: 30,
            score_window: 20,
        }
    }
}

/// How freely improvements may be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    /// Every validated improvement.
    #[default]
    Standard,
    /// Low-risk improvements only.
    Conservative,
    /// The single lowest-risk validated improvement.
    SafeFallback,
}

/// Trigger signals from one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerSignals {
    pub performance_drop: bool,
    pub new_inefficiency: bool,
    pub pattern_drift: bool,
    pub cooldown_elapsed: bool,
}

impl TriggerSignals {
    pub fn count(&self) -> usize {
        [
            self.performance_drop,
            self.new_inefficiency,
            self.pattern_drift,
            self.cooldown_elapsed,
        ]
        .into_iter()
        .filter(|s| *s)
        .count()
    }

    pub fn should_optimize(&self) -> bool {
        self.count() >= 2
    }
}

/// Result of analyzing one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub unit: UnitId,
    pub performance: f64,
    pub patterns: PatternSignal,
    pub prediction: Prediction,
    /// Weighted efficiency in [0, 1].
    pub composite: f64,
    pub signals: TriggerSignals,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedImprovement {
    pub improvement: Improvement,
    pub before: f64,
    pub after: f64,
}

impl AppliedImprovement {
    pub fn gain(&self) -> f64 {
        self.after - self.before
    }
}

/// Outcome of one optimization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub timestamp: DateTime<Utc>,
    pub unit: UnitId,
    pub applied: Vec<AppliedImprovement>,
    /// Validated candidates that were tried.
    pub attempted: usize,
    /// Share of attempted improvements that were kept.
    pub success_rate: f64,
    /// Total efficiency gained.
    pub improvement_score: f64,
    pub mode: OptimizationMode,
    /// Set when the attempt failed.
    pub error: Option<String>,
}

impl OptimizationRecord {
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.success_rate < 0.5
    }
}

/// One minus the failure ratio of the most recent records.
///
/// With no records the engine is considered stable.
pub fn performance_stability(records: &BoundedLog<OptimizationRecord>) -> f64 {
    let recent: Vec<&OptimizationRecord> = records.recent(STABILITY_WINDOW).collect();
    if recent.is_empty() {
        return 1.0;
    }
    let failures = recent.iter().filter(|r| r.is_failure()).count();
    1.0 - failures as f64 / recent.len() as f64
}

/// Coordination locks on units of work.
///
/// Held by the optimizer while it modifies a unit and by external tooling
/// that needs a unit left alone.
#[derive(Debug, Default)]
pub struct UnitLocks {
    held: Mutex<HashSet<UnitId>>,
}

impl UnitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock on `unit`.
    ///
    /// # Errors
    /// `LockContention` if it is already held.
    pub async fn try_acquire(&self, unit: &UnitId) -> Result<()> {
        if self.held.lock().await.insert(unit.clone()) {
            Ok(())
        } else {
            Err(Error::LockContention(unit.clone()))
        }
    }

    pub async fn release(&self, unit: &UnitId) -> bool {
        self.held.lock().await.remove(unit)
    }

    pub async fn is_locked(&self, unit: &UnitId) -> bool {
        self.held.lock().await.contains(unit)
    }
}

/// Read-only view of a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSnapshot {
    pub id: UnitId,
    pub state: UnitState,
    pub profile: UnitProfile,
    pub baseline: Option<f64>,
    pub last_optimized: Option<DateTime<Utc>>,
    pub pending_mode: Option<OptimizationMode>,
}

/// Units touched by one optimizer cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerCycleReport {
    pub analyzed: Vec<UnitId>,
    pub optimized: Vec<UnitId>,
    pub failed: Vec<UnitId>,
    pub skipped: Vec<UnitId>,
}

#[derive(Debug)]
struct UnitEntry {
    state: UnitState,
    profile: UnitProfile,
    /// Performance after the last successful optimization.
    baseline: Option<f64>,
    known: BTreeSet<Inefficiency>,
    scores: VecDeque<f64>,
    last_optimized: Option<DateTime<Utc>>,
    last_analysis: Option<Analysis>,
    pending: Option<OptimizationMode>,
}

impl UnitEntry {
    fn new(profile: UnitProfile) -> Self {
        Self {
            state: UnitState::Unknown,
            profile,
            baseline: None,
            known: BTreeSet::new(),
            scores: VecDeque::new(),
            last_optimized: None,
            last_analysis: None,
            pending: None,
        }
    }
}

struct Attempt {
    profile: UnitProfile,
    applied: Vec<AppliedImprovement>,
    attempted: usize,
    initial: f64,
    final_score: f64,
}

/// The optimization engine.
///
/// The unit table sits behind a short synchronous lock that is never held
/// across an await, so readers are not blocked by analysis in flight.
/// Cycles are serialized by a separate async guard.
pub struct OptimizationEngine {
    config: OptimizerConfig,
    analyzer: Arc<dyn Analyzer>,
    predictor: Arc<dyn Predictor>,
    units: StdMutex<BTreeMap<UnitId, UnitEntry>>,
    confidence: StdMutex<HashMap<String, f64>>,
    cycle: Mutex<()>,
    history: OptimizationHistory,
    recovery: SharedRecovery,
    locks: Arc<UnitLocks>,
    bus: EventBus,
}

impl OptimizationEngine {
    pub fn new(
        config: OptimizerConfig,
        analyzer: Arc<dyn Analyzer>,
        predictor: Arc<dyn Predictor>,
        history: OptimizationHistory,
        recovery: SharedRecovery,
        locks: Arc<UnitLocks>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            analyzer,
            predictor,
            units: StdMutex::new(BTreeMap::new()),
            confidence: StdMutex::new(HashMap::new()),
            cycle: Mutex::new(()),
            history,
            recovery,
            locks,
            bus,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Register a unit of work. Returns `false` if the id is taken.
    pub fn register_unit(&self, id: UnitId, profile: UnitProfile) -> bool {
        let mut units = self.units();
        if units.contains_key(&id) {
            return false;
        }
        debug!(unit = %id, "unit registered");
        units.insert(id, UnitEntry::new(profile));
        true
    }

    /// Replace a unit's profile with fresh observations.
    pub fn update_profile(&self, id: &UnitId, profile: UnitProfile) -> Result<()> {
        self.with_entry(id, |entry| {
            entry.profile = profile;
            Ok(())
        })
    }

    pub fn snapshot(&self, id: &UnitId) -> Option<UnitSnapshot> {
        self.units().get(id).map(|entry| UnitSnapshot {
            id: id.clone(),
            state: entry.state,
            profile: entry.profile.clone(),
            baseline: entry.baseline,
            last_optimized: entry.last_optimized,
            pending_mode: entry.pending,
        })
    }

    pub fn state(&self, id: &UnitId) -> Option<UnitState> {
        self.units().get(id).map(|entry| entry.state)
    }

    pub fn last_analysis(&self, id: &UnitId) -> Option<Analysis> {
        self.units()
            .get(id)
            .and_then(|entry| entry.last_analysis.clone())
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units().keys().cloned().collect()
    }

    pub fn unit_count(&self) -> usize {
        self.units().len()
    }

    /// Current confidence in a model, 1.0 until it has failed.
    pub fn model_confidence(&self, model: &str) -> f64 {
        self.confidence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .copied()
            .unwrap_or(1.0)
    }

    /// Analyze a unit and update its trigger signals.
    pub async fn analyze(&self, unit: &UnitId, now: DateTime<Utc>, bias: &Bias) -> Result<Analysis> {
        let (profile, history) = self.with_entry(unit, |entry| {
            Ok((
                entry.profile.clone(),
                entry.scores.iter().copied().collect::<Vec<f64>>(),
            ))
        })?;

        let performance = self.analyzer.performance(unit, &profile).await?;
        let patterns = self.analyzer.patterns(unit, &profile, &history).await?;
        let prediction = self.predictor.predict(unit, &history).await?;

        let weight = self.model_confidence(self.predictor.name()) * prediction.confidence;
        let predictive = weight * prediction.expected + (1.0 - weight) * performance;
        let composite = 0.5 * performance + 0.25 * patterns.score() + 0.25 * predictive;

        let cooldown = scaled_cooldown(self.config.cooldown_secs, bias.cooldown_multiplier);
        let performance_drop = self.config.performance_drop;
        let drift_threshold = self.config.drift_threshold;
        let score_window = self.config.score_window.max(2);

        self.with_entry(unit, |entry| {
            let signals = TriggerSignals {
                performance_drop: entry
                    .baseline
                    .map(|b| b - performance > performance_drop)
                    .unwrap_or(false),
                new_inefficiency: patterns.inefficiencies.difference(&entry.known).next().is_some(),
                pattern_drift: patterns.drift > drift_threshold,
                cooldown_elapsed: entry
                    .last_optimized
                    .map(|t| now - t >= cooldown)
                    .unwrap_or(true),
            };

            entry.state.transition(UnitState::Analyzed)?;
            entry.known = patterns.inefficiencies.clone();
            if entry.scores.len() == score_window {
                entry.scores.pop_front();
            }
            entry.scores.push_back(composite);
            if entry.baseline.is_none() {
                entry.baseline = Some(performance);
            }
            if signals.should_optimize() || entry.pending.is_some() {
                entry.state.transition(UnitState::OptimizationCandidate)?;
            }

            let analysis = Analysis {
                unit: unit.clone(),
                performance,
                patterns,
                prediction,
                composite,
                signals,
                timestamp: now,
            };
            debug!(
                unit = %unit,
                composite,
                signals = signals.count(),
                "unit analyzed"
            );
            entry.last_analysis = Some(analysis.clone());
            Ok(analysis)
        })
    }

    /// Whether the last analysis made `unit` worth optimizing.
    pub fn should_optimize(&self, unit: &UnitId) -> bool {
        self.units()
            .get(unit)
            .map(|entry| {
                entry.pending.is_some()
                    || entry
                        .last_analysis
                        .as_ref()
                        .map(|a| a.signals.should_optimize())
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Optimize a unit that the last analysis made a candidate.
    ///
    /// Once the unit's lock is taken, the outcome is appended to the
    /// optimization history whether the attempt succeeds or fails.
    pub async fn optimize(&self, unit: &UnitId, now: DateTime<Utc>) -> Result<OptimizationRecord> {
        if self.recovery.read().await.is_flagged(unit) {
            return Err(Error::Validation(format!(
                "unit {} is awaiting manual review",
                unit
            )));
        }

        let (state, mode) =
            self.with_entry(unit, |entry| Ok((entry.state, entry.pending.unwrap_or_default())))?;
        if state != UnitState::OptimizationCandidate {
            return Err(Error::InvalidStateTransition {
                from: state.to_string(),
                to: UnitState::Optimizing.to_string(),
            });
        }

        self.locks.try_acquire(unit).await?;
        if let Err(e) = self.with_entry(unit, |entry| entry.state.transition(UnitState::Optimizing)) {
            self.locks.release(unit).await;
            return Err(e);
        }

        let limit = Duration::from_secs(self.config.optimize_timeout_secs);
        let result = match tokio::time::timeout(limit, self.attempt(unit, mode)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        };
        self.locks.release(unit).await;

        match result {
            Ok(attempt) => {
                let record = OptimizationRecord {
                    timestamp: now,
                    unit: unit.clone(),
                    success_rate: if attempt.attempted == 0 {
                        0.0
                    } else {
                        attempt.applied.len() as f64 / attempt.attempted as f64
                    },
                    improvement_score: attempt.final_score - attempt.initial,
                    applied: attempt.applied,
                    attempted: attempt.attempted,
                    mode,
                    error: None,
                };

                self.with_entry(unit, |entry| {
                    entry.profile = attempt.profile;
                    entry.baseline = Some(attempt.final_score);
                    entry.last_optimized = Some(now);
                    entry.pending = None;
                    entry.state.transition(UnitState::Optimized)
                })?;

                info!(
                    unit = %unit,
                    applied = record.applied.len(),
                    attempted = record.attempted,
                    gain = record.improvement_score,
                    "unit optimized"
                );
                self.history.write().await.push(record.clone());
                self.bus.publish(EngineEvent::OptimizationRecorded {
                    unit: unit.clone(),
                    success_rate: record.success_rate,
                    improvement_score: record.improvement_score,
                });
                Ok(record)
            }
            Err(e) => {
                self.mark_failed(unit)?;
                self.history.write().await.push(OptimizationRecord {
                    timestamp: now,
                    unit: unit.clone(),
                    applied: Vec::new(),
                    attempted: 0,
                    success_rate: 0.0,
                    improvement_score: 0.0,
                    mode,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    async fn attempt(&self, unit: &UnitId, mode: OptimizationMode) -> Result<Attempt> {
        let (profile, known) =
            self.with_entry(unit, |entry| Ok((entry.profile.clone(), entry.known.clone())))?;

        let mut candidates: Vec<Improvement> = known
            .iter()
            .map(|i| i.remedy())
            .filter(|imp| imp.precondition(&profile))
            .collect();
        candidates.sort_by_key(|imp| (imp.risk(), *imp));
        candidates.dedup();
        match mode {
            OptimizationMode::Standard => {}
            OptimizationMode::Conservative => candidates.retain(|imp| imp.risk() == Risk::Low),
            OptimizationMode::SafeFallback => candidates.truncate(1),
        }

        let initial = self.analyzer.performance(unit, &profile).await?;
        let mut current = profile;
        let mut score = initial;
        let mut applied = Vec::new();

        for improvement in &candidates {
            // Earlier improvements may have invalidated this one
            if !improvement.precondition(&current) {
                continue;
            }
            let next = improvement.apply(&current);
            let after = self.analyzer.performance(unit, &next).await?;
            if after > score {
                applied.push(AppliedImprovement {
                    improvement: *improvement,
                    before: score,
                    after,
                });
                current = next;
                score = after;
            } else {
                debug!(unit = %unit, improvement = %improvement, "improvement rejected, no gain");
            }
        }

        Ok(Attempt {
            profile: current,
            applied,
            attempted: candidates.len(),
            initial,
            final_score: score,
        })
    }

    /// Run one optimization cycle over every registered unit.
    ///
    /// Per-unit failures are routed to recovery and never abort the cycle.
    /// Units registered while a cycle is running are picked up by the next.
    pub async fn run_cycle(&self, now: DateTime<Utc>, bias: &Bias) -> OptimizerCycleReport {
        let _cycle = self.cycle.lock().await;
        let mut report = OptimizerCycleReport::default();

        for id in self.unit_ids() {
            {
                let recovery = self.recovery.read().await;
                if recovery.is_flagged(&id) || recovery.reanalysis_pending(&id, now) {
                    report.skipped.push(id);
                    continue;
                }
            }
            if self.recovery.write().await.take_due_reanalysis(&id, now) {
                debug!(unit = %id, "forced re-analysis");
            }

            match self.process(&id, now, bias).await {
                Ok(optimized) => {
                    report.analyzed.push(id.clone());
                    if optimized {
                        report.optimized.push(id);
                    }
                }
                Err(e) => {
                    report.failed.push(id.clone());
                    self.recover(&id, &e, now).await;
                }
            }
        }

        debug!(
            analyzed = report.analyzed.len(),
            optimized = report.optimized.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "optimizer cycle complete"
        );
        report
    }

    async fn process(&self, unit: &UnitId, now: DateTime<Utc>, bias: &Bias) -> Result<bool> {
        self.analyze(unit, now, bias).await?;
        if self.state(unit) == Some(UnitState::OptimizationCandidate) {
            self.optimize(unit, now).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Route a failure through the recovery handler and apply its decision.
    ///
    /// Failures while applying the decision go to the critical list.
    pub async fn recover(&self, unit: &UnitId, err: &Error, now: DateTime<Utc>) {
        let outcome = self.recovery.write().await.handle(unit, err, now);
        self.bus.publish(EngineEvent::RecoveryScheduled {
            unit: unit.clone(),
            action: outcome.action.clone(),
        });
        if outcome.flagged {
            self.bus.publish(EngineEvent::UnitFlagged { unit: unit.clone() });
        }

        if let Err(e) = self.apply_recovery(unit, &outcome.action, now).await {
            let message = format!("recovery {:?} failed: {}", outcome.action, e);
            self.recovery
                .write()
                .await
                .record_critical(unit, message.clone(), now);
            self.bus.publish(EngineEvent::CriticalError { message });
        }
    }

    async fn apply_recovery(
        &self,
        unit: &UnitId,
        action: &RecoveryAction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match action {
            RecoveryAction::Reanalyze { delay_secs, model } => {
                self.with_entry(unit, |_| Ok(()))?;
                if let Some(model) = model {
                    let current = self.model_confidence(model);
                    let lowered = self.recovery.read().await.penalize(current);
                    info!(model = %model, confidence = lowered, "model confidence lowered");
                    self.set_confidence(model, lowered);
                }
                let due = now + scaled_cooldown(*delay_secs, 1.0);
                self.recovery.write().await.schedule_reanalysis(unit, due);
            }
            RecoveryAction::ConservativeRetry => {
                self.set_pending(unit, OptimizationMode::Conservative)?;
            }
            RecoveryAction::ReleaseLockAndReschedule => {
                self.with_entry(unit, |entry| {
                    entry.pending.get_or_insert(OptimizationMode::Standard);
                    Ok(())
                })?;
                if self.locks.release(unit).await {
                    warn!(unit = %unit, "coordination lock released by recovery");
                }
                self.recovery.write().await.schedule_reanalysis(unit, now);
            }
            RecoveryAction::SafeFallback => {
                self.set_pending(unit, OptimizationMode::SafeFallback)?;
            }
        }
        Ok(())
    }

    fn set_pending(&self, unit: &UnitId, mode: OptimizationMode) -> Result<()> {
        self.with_entry(unit, |entry| {
            entry.pending = Some(mode);
            Ok(())
        })
    }

    fn mark_failed(&self, unit: &UnitId) -> Result<()> {
        match self.units().get_mut(unit) {
            Some(entry) => {
                entry.pending = None;
                entry.state.transition(UnitState::Failed)
            }
            None => Ok(()),
        }
    }

    fn set_confidence(&self, model: &str, confidence: f64) {
        self.confidence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.to_string(), confidence);
    }

    fn units(&self) -> MutexGuard<'_, BTreeMap<UnitId, UnitEntry>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry<T>(&self, unit: &UnitId, f: impl FnOnce(&mut UnitEntry) -> Result<T>) -> Result<T> {
        let mut units = self.units();
        let entry = units
            .get_mut(unit)
            .ok_or_else(|| Error::UnitNotFound(unit.clone()))?;
        f(entry)
    }
}

fn scaled_cooldown(secs: u64, multiplier: f64) -> ChronoDuration {
    let millis = (secs as f64 * multiplier.max(0.0) * 1000.0).min(i64::MAX as f64 / 2.0);
    ChronoDuration::milliseconds(millis as i64)
}
