//! Reflection over recent optimization and coordination outcomes.
//!
//! Runs far less often than the other loops. Each cycle it takes a bounded
//! window of optimization records and coordination events, answers a fixed
//! battery of self-critique questions, extracts patterns, derives lessons
//! from poor outcomes, and folds everything into the knowledge store. The
//! resulting [`Bias`] is what the scheduler and optimizer read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::core::WorkerId;
use crate::events::{EngineEvent, EventBus};
use crate::orchestration::knowledge::{
    Bias, KnowledgeStore, Lesson, Pattern, PatternKind, ReflectionInsight,
};
use crate::orchestration::optimizer::{OptimizationHistory, OptimizationRecord};
use crate::orchestration::scheduler::{CoordinationEvent, CoordinationEventKind, CoordinationLog};
use crate::orchestration::unit::{Improvement, UnitId};

/// Shared knowledge store.
pub type SharedKnowledge = Arc<RwLock<KnowledgeStore>>;

/// The fixed self-critique battery.
pub const CRITIQUE_QUESTIONS: [&str; 5] = [
    "Did applied improvements produce measurable gains?",
    "Are optimization attempts succeeding?",
    "Are failures concentrated in a few units?",
    "Is coordination executing what it detects?",
    "Are optimizations attempted with nothing to apply?",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Optimization records considered per cycle.
    pub window: usize,
    /// Below this many records reflection finds nothing.
    pub min_records: usize,
    /// Rebalances of one worker within the window that make it a hotspot.
    pub hotspot_threshold: usize,
    /// Insights and lessons retained by the knowledge store.
    pub knowledge_capacity: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            window: 50,
            min_records: 3,
            hotspot_threshold: 3,
            knowledge_capacity: 500,
        }
    }
}

/// What one reflection cycle found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReflectionReport {
    pub records: usize,
    pub patterns: Vec<Pattern>,
    pub insights: Vec<ReflectionInsight>,
    pub lessons: Vec<Lesson>,
    /// New bias, if the window was large enough to derive one.
    pub bias: Option<Bias>,
}

/// Reflect on a window of records and coordination events.
///
/// Pure function of its inputs; [`ReflectionEngine`] handles reading the
/// shared logs and writing the knowledge store.
pub fn reflect_on(
    records: &[OptimizationRecord],
    events: &[CoordinationEvent],
    coordination_efficiency: f64,
    config: &ReflectionConfig,
    now: DateTime<Utc>,
) -> ReflectionReport {
    let mut report = ReflectionReport {
        records: records.len(),
        ..Default::default()
    };
    if records.len() < config.min_records.max(1) {
        return report;
    }

    let n = records.len() as f64;
    let confidence = (n / config.window.max(1) as f64).min(1.0);
    let mean_success = records.iter().map(|r| r.success_rate).sum::<f64>() / n;
    let mean_gain = records.iter().map(|r| r.improvement_score).sum::<f64>() / n;
    let failures_by_unit = failures_by_unit(records);
    let empty_attempts = records.iter().filter(|r| r.attempted == 0).count() as f64 / n;

    // Critique battery
    let answers = [
        (
            format!("mean efficiency gain per optimization is {:.3}", mean_gain),
            mean_gain <= 0.01,
        ),
        (
            format!("mean success rate is {:.2}", mean_success),
            mean_success < 0.5,
        ),
        (
            if failures_by_unit.is_empty() {
                "no unit failed more than once".to_string()
            } else {
                format!(
                    "repeated failures in: {}",
                    failures_by_unit
                        .keys()
                        .map(|u| u.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            },
            !failures_by_unit.is_empty(),
        ),
        (
            format!("coordination efficiency is {:.2}", coordination_efficiency),
            coordination_efficiency < 0.5,
        ),
        (
            format!("{:.0}% of attempts had no candidate", empty_attempts * 100.0),
            empty_attempts > 0.3,
        ),
    ];
    report.insights = CRITIQUE_QUESTIONS
        .iter()
        .zip(answers)
        .map(|(question, (finding, actionable))| ReflectionInsight {
            question: question.to_string(),
            finding,
            confidence,
            actionable,
            timestamp: now,
        })
        .collect();

    // Patterns
    let mut applied: BTreeMap<Improvement, usize> = BTreeMap::new();
    for record in records {
        for a in &record.applied {
            *applied.entry(a.improvement).or_default() += 1;
        }
    }
    for (improvement, count) in applied.into_iter().filter(|(_, c)| *c >= 3) {
        report.patterns.push(Pattern::new(
            PatternKind::RecurringImprovement,
            improvement.as_str(),
            format!("{} applied {} times", improvement, count),
            count as f64 / n,
            false,
        ));
    }

    for (unit, (failed, total)) in &failures_by_unit {
        report.patterns.push(Pattern::new(
            PatternKind::RepeatedFailure,
            unit.as_str(),
            format!("{} failed {} of {} optimizations", unit, failed, total),
            *failed as f64 / *total as f64,
            true,
        ));
    }

    if records.len() >= 4 {
        let (first, second) = records.split_at(records.len() / 2);
        let first_mean = mean_score(first);
        let second_mean = mean_score(second);
        if first_mean > 0.0 && second_mean < first_mean {
            report.patterns.push(Pattern::new(
                PatternKind::DecliningReturns,
                "",
                format!(
                    "mean gain fell from {:.3} to {:.3}",
                    first_mean, second_mean
                ),
                (first_mean - second_mean) / first_mean,
                true,
            ));
        }
    }

    if mean_success < 0.5 {
        report.patterns.push(Pattern::new(
            PatternKind::LowSuccessRate,
            "",
            format!("mean success rate {:.2}", mean_success),
            1.0 - mean_success,
            true,
        ));
    }

    let rebalanced: Vec<&CoordinationEvent> = events
        .iter()
        .filter(|e| e.kind == CoordinationEventKind::Rebalanced)
        .collect();
    let mut hotspots: BTreeMap<&WorkerId, usize> = BTreeMap::new();
    for event in &rebalanced {
        if let Some(worker) = event.workers.first() {
            *hotspots.entry(worker).or_default() += 1;
        }
    }
    for (worker, count) in hotspots
        .into_iter()
        .filter(|(_, c)| *c >= config.hotspot_threshold.max(1))
    {
        report.patterns.push(Pattern::new(
            PatternKind::RebalanceHotspot,
            worker.as_str(),
            format!("{} rebalanced {} times", worker, count),
            count as f64 / rebalanced.len() as f64,
            true,
        ));
    }

    // Lessons
    report.lessons = records
        .iter()
        .filter(|r| r.success_rate < 0.5)
        .map(|r| lesson_for(r, now))
        .collect();

    report.bias = Some(derive_bias(&report.patterns, mean_success, mean_gain, coordination_efficiency));
    report
}

/// Units with at least two failures, mapped to (failed, total).
fn failures_by_unit(records: &[OptimizationRecord]) -> BTreeMap<UnitId, (usize, usize)> {
    let mut totals: BTreeMap<UnitId, (usize, usize)> = BTreeMap::new();
    for record in records {
        let entry = totals.entry(record.unit.clone()).or_default();
        entry.1 += 1;
        if record.is_failure() {
            entry.0 += 1;
        }
    }
    totals.retain(|_, (failed, _)| *failed >= 2);
    totals
}

fn mean_score(records: &[OptimizationRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().map(|r| r.improvement_score).sum::<f64>() / records.len() as f64
}

fn lesson_for(record: &OptimizationRecord, now: DateTime<Utc>) -> Lesson {
    let (root_cause, prevention, adaptation) = match (&record.error, record.attempted) {
        (Some(error), _) => (
            format!("optimization failed: {}", error),
            "check analyzer inputs and unit locks before optimizing".to_string(),
            "retry through the recovery path in a restricted mode".to_string(),
        ),
        (None, 0) => (
            "no validated improvement candidates".to_string(),
            "require a new inefficiency before treating the unit as a candidate".to_string(),
            "lengthen the optimization cooldown".to_string(),
        ),
        (None, attempted) => (
            format!(
                "{} of {} improvements produced no measurable gain",
                attempted - record.applied.len(),
                attempted
            ),
            "measure the current profile before generating candidates".to_string(),
            "prefer low-risk improvements for this unit".to_string(),
        ),
    };
    Lesson {
        unit: record.unit.clone(),
        root_cause,
        prevention,
        adaptation,
        timestamp: now,
    }
}

fn derive_bias(
    patterns: &[Pattern],
    mean_success: f64,
    mean_gain: f64,
    coordination_efficiency: f64,
) -> Bias {
    let has = |kind: PatternKind| patterns.iter().any(|p| p.kind == kind);

    let cooldown_multiplier =
        if has(PatternKind::DecliningReturns) || has(PatternKind::LowSuccessRate) {
            1.5
        } else if mean_success >= 0.8 && mean_gain > 0.05 {
            0.75
        } else {
            1.0
        };

    let mut priority_threshold_adjustment = 0.0;
    if coordination_efficiency < 0.5 {
        priority_threshold_adjustment -= 0.1;
    }
    if has(PatternKind::RebalanceHotspot) {
        priority_threshold_adjustment -= 0.05;
    }

    Bias {
        priority_threshold_adjustment,
        cooldown_multiplier,
    }
}

/// Reads the shared logs, reflects, and updates the knowledge store.
///
/// Each record and coordination event is reflected on once. Entries that
/// arrive in too small a batch wait for the next cycle.
pub struct ReflectionEngine {
    config: ReflectionConfig,
    history: OptimizationHistory,
    coordination: CoordinationLog,
    knowledge: SharedKnowledge,
    cursor: Mutex<Cursor>,
    bus: EventBus,
}

/// Log sequence numbers up to which reflection has already run.
#[derive(Debug, Default)]
struct Cursor {
    records: u64,
    events: u64,
}

impl ReflectionEngine {
    pub fn new(
        config: ReflectionConfig,
        history: OptimizationHistory,
        coordination: CoordinationLog,
        knowledge: SharedKnowledge,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            history,
            coordination,
            knowledge,
            cursor: Mutex::new(Cursor::default()),
            bus,
        }
    }

    pub fn config(&self) -> &ReflectionConfig {
        &self.config
    }

    /// Run one reflection cycle over what was logged since the last one.
    ///
    /// At most `window` of the new records and events are considered.
    pub async fn reflect(&self, coordination_efficiency: f64, now: DateTime<Utc>) -> ReflectionReport {
        let mut cursor = self.cursor.lock().await;
        let (records, records_end) = {
            let history = self.history.read().await;
            (history.since_cloned(cursor.records), history.next_seq())
        };
        let (events, events_end) = {
            let log = self.coordination.read().await;
            (log.since_cloned(cursor.events), log.next_seq())
        };
        let records = tail(records, self.config.window);
        let events = tail(events, self.config.window);

        let report = reflect_on(&records, &events, coordination_efficiency, &self.config, now);

        if report.bias.is_some() {
            cursor.records = records_end;
            cursor.events = events_end;
            let mut knowledge = self.knowledge.write().await;
            for pattern in &report.patterns {
                knowledge.merge_pattern(pattern.clone());
            }
            for insight in &report.insights {
                knowledge.add_insight(insight.clone());
            }
            for lesson in &report.lessons {
                knowledge.add_lesson(lesson.clone());
            }
            if let Some(bias) = report.bias {
                knowledge.set_bias(bias);
            }
            info!(
                patterns = report.patterns.len(),
                lessons = report.lessons.len(),
                "reflection updated knowledge"
            );
        } else {
            debug!(records = report.records, "too few records to reflect on");
        }

        self.bus.publish(EngineEvent::ReflectionCompleted {
            patterns: report.patterns.len(),
            insights: report.insights.len(),
            lessons: report.lessons.len(),
        });
        report
    }
}

fn tail<T>(mut entries: Vec<T>, n: usize) -> Vec<T> {
    let excess = entries.len().saturating_sub(n);
    entries.drain(..excess);
    entries
}
