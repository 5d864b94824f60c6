//! Knowledge store written by reflection and read by the loops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::BoundedLog;
use crate::orchestration::UnitId;

/// Identifier of a pattern, e.g. `repeated_failure:billing`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(pub String);

impl PatternId {
    pub fn new(kind: PatternKind, subject: &str) -> Self {
        if subject.is_empty() {
            Self(kind.as_str().to_string())
        } else {
            Self(format!("{}:{}", kind.as_str(), subject))
        }
    }
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// The same improvement keeps being applied.
    RecurringImprovement,
    /// A unit keeps failing to optimize.
    RepeatedFailure,
    /// Gains per optimization are shrinking.
    DecliningReturns,
    /// Optimizations mostly fail to help.
    LowSuccessRate,
    /// A worker keeps needing rebalancing.
    RebalanceHotspot,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::RecurringImprovement => "recurring_improvement",
            PatternKind::RepeatedFailure => "repeated_failure",
            PatternKind::DecliningReturns => "declining_returns",
            PatternKind::LowSuccessRate => "low_success_rate",
            PatternKind::RebalanceHotspot => "rebalance_hotspot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub kind: PatternKind,
    pub description: String,
    /// Confidence in [0, 1].
    pub strength: f64,
    pub actionable: bool,
    /// Reflection cycles that observed this pattern.
    pub observations: u32,
    pub last_seen: DateTime<Utc>,
}

impl Pattern {
    pub fn new(
        kind: PatternKind,
        subject: &str,
        description: impl Into<String>,
        strength: f64,
        actionable: bool,
    ) -> Self {
        Self {
            id: PatternId::new(kind, subject),
            kind,
            description: description.into(),
            strength: strength.clamp(0.0, 1.0),
            actionable,
            observations: 1,
            last_seen: Utc::now(),
        }
    }
}

/// Answer to one self-critique question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionInsight {
    pub question: String,
    pub finding: String,
    pub confidence: f64,
    pub actionable: bool,
    pub timestamp: DateTime<Utc>,
}

/// What went wrong with one optimization and how to avoid it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub unit: UnitId,
    pub root_cause: String,
    pub prevention: String,
    pub adaptation: String,
    pub timestamp: DateTime<Utc>,
}

/// Adjustments the loops apply based on what reflection learned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bias {
    /// Added to the scheduler's priority threshold.
    pub priority_threshold_adjustment: f64,
    /// Multiplies the optimizer's cooldown.
    pub cooldown_multiplier: f64,
}

impl Default for Bias {
    fn default() -> Self {
        Self {
            priority_threshold_adjustment: 0.0,
            cooldown_multiplier: 1.0,
        }
    }
}

/// Patterns, insights, lessons and the current bias.
#[derive(Debug)]
pub struct KnowledgeStore {
    patterns: BTreeMap<PatternId, Pattern>,
    insights: BoundedLog<ReflectionInsight>,
    lessons: BoundedLog<Lesson>,
    bias: Bias,
}

impl KnowledgeStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            patterns: BTreeMap::new(),
            insights: BoundedLog::new(capacity),
            lessons: BoundedLog::new(capacity),
            bias: Bias::default(),
        }
    }

    /// Insert a pattern or reinforce the existing one with the same id.
    ///
    /// Reinforcement averages the strengths and counts the observation.
    pub fn merge_pattern(&mut self, pattern: Pattern) {
        match self.patterns.get_mut(&pattern.id) {
            Some(existing) => {
                existing.strength = (existing.strength + pattern.strength) / 2.0;
                existing.observations += 1;
                existing.description = pattern.description;
                existing.actionable = pattern.actionable;
                existing.last_seen = pattern.last_seen;
            }
            None => {
                self.patterns.insert(pattern.id.clone(), pattern);
            }
        }
    }

    pub fn add_insight(&mut self, insight: ReflectionInsight) {
        self.insights.push(insight);
    }

    pub fn add_lesson(&mut self, lesson: Lesson) {
        self.lessons.push(lesson);
    }

    pub fn pattern(&self, id: &PatternId) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.values()
    }

    pub fn patterns_of(&self, kind: PatternKind) -> impl Iterator<Item = &Pattern> {
        self.patterns.values().filter(move |p| p.kind == kind)
    }

    pub fn insights(&self) -> impl Iterator<Item = &ReflectionInsight> {
        self.insights.iter()
    }

    pub fn lessons(&self) -> impl Iterator<Item = &Lesson> {
        self.lessons.iter()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn insight_count(&self) -> usize {
        self.insights.len()
    }

    pub fn lesson_count(&self) -> usize {
        self.lessons.len()
    }

    pub fn bias(&self) -> Bias {
        self.bias
    }

    pub fn set_bias(&mut self, bias: Bias) {
        self.bias = Bias {
            priority_threshold_adjustment: bias.priority_threshold_adjustment.clamp(-0.2, 0.2),
            cooldown_multiplier: bias.cooldown_multiplier.clamp(0.5, 3.0),
        };
    }
}

impl Default for KnowledgeStore {
    fn default() -> Self {
        Self::new(500)
    }
}
