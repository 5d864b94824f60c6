//! Error classification and recovery for the optimization loop.
//!
//! The `RecoveryHandler` receives every per-unit failure from the
//! optimization engine, classifies it and decides on a bounded recovery
//! action. It never re-throws: the loop that reported the error keeps
//! running with the next unit.
//!
//! ## Classification
//!
//! Errors are classified by variant first. Variants that carry no class of
//! their own (`Other`, `Worker`, IO...) fall back to pattern matching on the
//! error message:
//! - analysis or model failures lower the implicated model's confidence and
//!   schedule a delayed re-analysis
//! - performance degradation and timeouts queue a conservative retry
//! - coordination and lock failures release the unit's lock and reschedule
//! - anything else queues a safe fallback
//!
//! A unit that fails more than `review_threshold` times within
//! `review_window` is flagged for manual review and skipped by the
//! optimizer until [`RecoveryHandler::clear_review`] is called.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use tracing::{error, warn};

use crate::core::BoundedLog;
use crate::error::Error;
use crate::orchestration::UnitId;

/// Default delay before a unit whose analysis failed is analyzed again.
pub const DEFAULT_REANALYSIS_DELAY_SECS: u64 = 30;

/// Default window over which a unit's error density is measured.
pub const DEFAULT_REVIEW_WINDOW_SECS: u64 = 300; // 5 minutes

/// Default number of errors tolerated within the window.
pub const DEFAULT_REVIEW_THRESHOLD: usize = 3;

/// Configuration for the recovery handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub reanalysis_delay_secs: u64,
    /// Multiplier applied to a model's confidence after it fails.
    pub confidence_penalty: f64,
    /// Confidence never drops below this value.
    pub confidence_floor: f64,
    /// Errors tolerated per unit within the window before manual review.
    pub review_threshold: usize,
    pub review_window_secs: u64,
    /// Error records retained.
    pub history_capacity: usize,
    /// Critical errors retained.
    pub critical_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reanalysis_delay_secs: DEFAULT_REANALYSIS_DELAY_SECS,
            confidence_penalty: 0.8,
            confidence_floor: 0.1,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
            review_window_secs: DEFAULT_REVIEW_WINDOW_SECS,
            history_capacity: 200,
            critical_capacity: 100,
        }
    }
}

/// Error classes the handler distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    AnalysisOrModel,
    PerformanceTimeout,
    CoordinationLock,
    Generic,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::AnalysisOrModel => write!(f, "analysis_or_model"),
            ErrorClass::PerformanceTimeout => write!(f, "performance_timeout"),
            ErrorClass::CoordinationLock => write!(f, "coordination_lock"),
            ErrorClass::Generic => write!(f, "generic"),
        }
    }
}

/// Recovery actions for failing units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RecoveryAction {
    /// Lower the model's confidence and analyze the unit again later.
    Reanalyze {
        delay_secs: u64,
        model: Option<String>,
    },
    /// Retry optimization using only low-risk improvements.
    ConservativeRetry,
    /// Release the unit's coordination lock and retry next cycle.
    ReleaseLockAndReschedule,
    /// Apply a single minimal improvement on the next attempt.
    SafeFallback,
}

/// A recorded per-unit failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub unit: UnitId,
    pub message: String,
    pub class: ErrorClass,
    pub timestamp: DateTime<Utc>,
}

/// A failure that occurred while applying a recovery action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalError {
    pub unit: UnitId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of handling one error.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub class: ErrorClass,
    pub action: RecoveryAction,
    /// The unit crossed the error-density threshold with this error.
    pub flagged: bool,
}

/// Classify an error.
pub fn classify(err: &Error) -> ErrorClass {
    match err {
        Error::Analysis { .. } | Error::Model { .. } => ErrorClass::AnalysisOrModel,
        Error::Timeout(_) | Error::Performance(_) => ErrorClass::PerformanceTimeout,
        Error::Coordination(_) | Error::LockContention(_) => ErrorClass::CoordinationLock,
        other => classify_message(&other.to_string()),
    }
}

/// Classify an error message by keyword.
pub fn classify_message(message: &str) -> ErrorClass {
    static PATTERNS: OnceLock<Vec<(Regex, ErrorClass)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"(?i)\b(analy[sz]\w*|model|predict\w*)\b", ErrorClass::AnalysisOrModel),
            (r"(?i)(timed out|timeout|performance|slow|latency)", ErrorClass::PerformanceTimeout),
            (r"(?i)\b(lock\w*|coordinat\w*|contention|deadlock)\b", ErrorClass::CoordinationLock),
        ]
        .into_iter()
        .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, class)))
        .collect()
    });

    patterns
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, class)| *class)
        .unwrap_or(ErrorClass::Generic)
}

/// Tracks failures per unit and decides how to recover.
#[derive(Debug)]
pub struct RecoveryHandler {
    config: RecoveryConfig,
    history: BoundedLog<ErrorRecord>,
    review: BTreeSet<UnitId>,
    critical: BoundedLog<CriticalError>,
    reanalysis: HashMap<UnitId, DateTime<Utc>>,
}

impl RecoveryHandler {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            history: BoundedLog::new(config.history_capacity),
            critical: BoundedLog::new(config.critical_capacity),
            review: BTreeSet::new(),
            reanalysis: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Record a failure for `unit` and decide on a recovery action.
    pub fn handle(&mut self, unit: &UnitId, err: &Error, now: DateTime<Utc>) -> RecoveryOutcome {
        let class = classify(err);
        self.history.push(ErrorRecord {
            unit: unit.clone(),
            message: err.to_string(),
            class,
            timestamp: now,
        });
        warn!(unit = %unit, class = %class, error = %err, "optimization unit failed");

        let flagged = !self.review.contains(unit)
            && self.recent_errors(unit, now) > self.config.review_threshold;
        if flagged {
            self.review.insert(unit.clone());
            warn!(unit = %unit, "unit flagged for manual review");
        }

        let action = match class {
            ErrorClass::AnalysisOrModel => RecoveryAction::Reanalyze {
                delay_secs: self.config.reanalysis_delay_secs,
                model: err.model().map(str::to_string),
            },
            ErrorClass::PerformanceTimeout => RecoveryAction::ConservativeRetry,
            ErrorClass::CoordinationLock => RecoveryAction::ReleaseLockAndReschedule,
            ErrorClass::Generic => RecoveryAction::SafeFallback,
        };

        RecoveryOutcome {
            class,
            action,
            flagged,
        }
    }

    /// Errors recorded for `unit` within the review window ending at `now`.
    pub fn recent_errors(&self, unit: &UnitId, now: DateTime<Utc>) -> usize {
        let since = now - window(self.config.review_window_secs);
        self.history
            .iter()
            .filter(|r| &r.unit == unit && r.timestamp > since)
            .count()
    }

    /// Confidence after one more failure of a model.
    pub fn penalize(&self, confidence: f64) -> f64 {
        (confidence * self.config.confidence_penalty).max(self.config.confidence_floor)
    }

    /// Queue a re-analysis of `unit` at `due`.
    pub fn schedule_reanalysis(&mut self, unit: &UnitId, due: DateTime<Utc>) {
        self.reanalysis.insert(unit.clone(), due);
    }

    /// The unit has a queued re-analysis that is not yet due.
    pub fn reanalysis_pending(&self, unit: &UnitId, now: DateTime<Utc>) -> bool {
        self.reanalysis.get(unit).map(|due| *due > now).unwrap_or(false)
    }

    /// Remove and return whether a due re-analysis was queued for `unit`.
    pub fn take_due_reanalysis(&mut self, unit: &UnitId, now: DateTime<Utc>) -> bool {
        match self.reanalysis.get(unit) {
            Some(due) if *due <= now => {
                self.reanalysis.remove(unit);
                true
            }
            _ => false,
        }
    }

    pub fn reanalysis_due_at(&self, unit: &UnitId) -> Option<DateTime<Utc>> {
        self.reanalysis.get(unit).copied()
    }

    pub fn is_flagged(&self, unit: &UnitId) -> bool {
        self.review.contains(unit)
    }

    /// Units awaiting manual review, ordered.
    pub fn review_queue(&self) -> Vec<UnitId> {
        self.review.iter().cloned().collect()
    }

    /// Return a unit to automatic optimization.
    ///
    /// Its error history is kept but no longer counts against it: only
    /// errors recorded after `now` do.
    pub fn clear_review(&mut self, unit: &UnitId, now: DateTime<Utc>) -> bool {
        let removed = self.review.remove(unit);
        if removed {
            let cleared: Vec<ErrorRecord> = self
                .history
                .iter()
                .filter(|r| &r.unit != unit || r.timestamp > now)
                .cloned()
                .collect();
            let mut history = BoundedLog::new(self.config.history_capacity);
            for record in cleared {
                history.push(record);
            }
            self.history = history;
        }
        removed
    }

    /// Record a failure of the recovery process itself.
    pub fn record_critical(&mut self, unit: &UnitId, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        error!(unit = %unit, message = %message, "recovery failed");
        self.critical.push(CriticalError {
            unit: unit.clone(),
            message,
            timestamp: now,
        });
    }

    pub fn critical_errors(&self) -> Vec<CriticalError> {
        self.critical.iter().cloned().collect()
    }

    pub fn critical_count(&self) -> usize {
        self.critical.len()
    }

    pub fn history(&self) -> Vec<ErrorRecord> {
        self.history.iter().cloned().collect()
    }
}

impl Default for RecoveryHandler {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

fn window(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}
