//! Units of work the optimization engine tunes.
//!
//! A unit is a recurring piece of work (a pipeline, a report, a sync job)
//! described by a small profile of tunable knobs and observed metrics.
//! Improvements are typed edits to that profile, each with a precondition
//! checked against the current profile before it is applied.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unique identifier for a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimization lifecycle of a unit.
///
/// ```text
/// unknown -> analyzed -> optimization_candidate -> optimizing -> optimized
///               ^  |                |                  |
///               |  +-- (analyzed) <-+                  +-> failed
///               +---------------- optimized / failed <-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    #[default]
    Unknown,
    Analyzed,
    OptimizationCandidate,
    Optimizing,
    Optimized,
    Failed,
}

impl UnitState {
    pub fn can_transition_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Unknown, Analyzed)
                | (Analyzed, Analyzed)
                | (Analyzed, OptimizationCandidate)
                | (OptimizationCandidate, Analyzed)
                | (OptimizationCandidate, Optimizing)
                | (Optimizing, Optimized)
                | (Optimizing, Failed)
                | (Optimized, Analyzed)
                | (Failed, Analyzed)
        )
    }

    /// Validate and perform a transition.
    pub fn transition(&mut self, next: UnitState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Unknown => write!(f, "unknown"),
            UnitState::Analyzed => write!(f, "analyzed"),
            UnitState::OptimizationCandidate => write!(f, "optimization_candidate"),
            UnitState::Optimizing => write!(f, "optimizing"),
            UnitState::Optimized => write!(f, "optimized"),
            UnitState::Failed => write!(f, "failed"),
        }
    }
}

/// Largest parallelism an improvement will configure.
pub const MAX_PARALLELISM: u32 = 16;

/// Batch size the analyzer considers ideal.
pub const IDEAL_BATCH_SIZE: u32 = 32;

/// Tunable knobs and observed metrics of a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitProfile {
    pub parallelism: u32,
    pub batch_size: u32,
    pub caching: bool,
    pub retry_limit: u32,
    /// Observed failure rate in [0, 1].
    pub error_rate: f64,
}

impl Default for UnitProfile {
    fn default() -> Self {
        Self {
            parallelism: 1,
            batch_size: IDEAL_BATCH_SIZE,
            caching: false,
            retry_limit: 3,
            error_rate: 0.0,
        }
    }
}

impl UnitProfile {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::Validation("parallelism must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Validation("batch_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(Error::Validation(format!(
                "error_rate {} outside [0, 1]",
                self.error_rate
            )));
        }
        Ok(())
    }
}

/// An inefficiency detected in a unit's profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inefficiency {
    LowParallelism,
    CacheDisabled,
    BatchMistuned,
    ExcessiveRetries,
    UnprotectedFailures,
}

impl Inefficiency {
    /// The improvement that addresses this inefficiency.
    pub fn remedy(self) -> Improvement {
        match self {
            Inefficiency::LowParallelism => Improvement::IncreaseParallelism,
            Inefficiency::CacheDisabled => Improvement::EnableCaching,
            Inefficiency::BatchMistuned => Improvement::ResizeBatch,
            Inefficiency::ExcessiveRetries => Improvement::TightenRetries,
            Inefficiency::UnprotectedFailures => Improvement::AddRetries,
        }
    }
}

/// How disruptive an improvement is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// A candidate edit to a unit's profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Improvement {
    EnableCaching,
    TightenRetries,
    AddRetries,
    ResizeBatch,
    IncreaseParallelism,
}

impl Improvement {
    pub fn risk(self) -> Risk {
        match self {
            Improvement::EnableCaching | Improvement::TightenRetries | Improvement::AddRetries => {
                Risk::Low
            }
            Improvement::ResizeBatch => Risk::Medium,
            Improvement::IncreaseParallelism => Risk::High,
        }
    }

    /// Whether the improvement can apply to `profile` at all.
    pub fn precondition(self, profile: &UnitProfile) -> bool {
        match self {
            Improvement::EnableCaching => !profile.caching,
            Improvement::TightenRetries => profile.retry_limit > 3,
            Improvement::AddRetries => profile.retry_limit == 0,
            Improvement::ResizeBatch => profile.batch_size != IDEAL_BATCH_SIZE,
            Improvement::IncreaseParallelism => profile.parallelism < MAX_PARALLELISM,
        }
    }

    /// The profile after applying this improvement.
    pub fn apply(self, profile: &UnitProfile) -> UnitProfile {
        let mut next = profile.clone();
        match self {
            Improvement::EnableCaching => next.caching = true,
            Improvement::TightenRetries => next.retry_limit = 3,
            Improvement::AddRetries => next.retry_limit = 2,
            Improvement::ResizeBatch => next.batch_size = IDEAL_BATCH_SIZE,
            Improvement::IncreaseParallelism => {
                next.parallelism = (profile.parallelism.saturating_mul(2)).min(MAX_PARALLELISM)
            }
        }
        next
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Improvement::EnableCaching => "enable_caching",
            Improvement::TightenRetries => "tighten_retries",
            Improvement::AddRetries => "add_retries",
            Improvement::ResizeBatch => "resize_batch",
            Improvement::IncreaseParallelism => "increase_parallelism",
        }
    }
}

impl std::fmt::Display for Improvement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
