//! Pluggable analysis strategies.
//!
//! The optimization engine never computes efficiency itself; it asks an
//! [`Analyzer`] for the performance and pattern signals and a [`Predictor`]
//! for the forward-looking one. The built-in implementations are
//! deterministic functions of the unit profile and score history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::orchestration::unit::{Inefficiency, UnitId, UnitProfile, IDEAL_BATCH_SIZE};

/// Pattern signal for a unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternSignal {
    pub inefficiencies: BTreeSet<Inefficiency>,
    /// How far the latest score moved away from its recent history.
    pub drift: f64,
}

impl PatternSignal {
    /// Score in [0, 1]; each inefficiency costs 0.1.
    pub fn score(&self) -> f64 {
        (1.0 - 0.1 * self.inefficiencies.len() as f64).max(0.0)
    }
}

/// Predicted efficiency of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub expected: f64,
    /// How much history backs the prediction, in [0, 1].
    pub confidence: f64,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Efficiency of a profile in [0, 1].
    async fn performance(&self, unit: &UnitId, profile: &UnitProfile) -> Result<f64>;

    /// Inefficiencies and drift given the unit's recent scores.
    async fn patterns(
        &self,
        unit: &UnitId,
        profile: &UnitProfile,
        history: &[f64],
    ) -> Result<PatternSignal>;
}

#[async_trait]
pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    async fn predict(&self, unit: &UnitId, history: &[f64]) -> Result<Prediction>;
}

/// Scores a profile knob by knob.
#[derive(Debug, Clone, Default)]
pub struct ProfileAnalyzer;

impl ProfileAnalyzer {
    pub const NAME: &'static str = "profile";

    pub fn new() -> Self {
        Self
    }

    fn score(profile: &UnitProfile) -> f64 {
        let parallel = f64::from(profile.parallelism.min(8)) / 8.0;
        let batch = {
            let distance = (f64::from(profile.batch_size).log2()
                - f64::from(IDEAL_BATCH_SIZE).log2())
            .abs();
            (1.0 - distance / 5.0).clamp(0.0, 1.0)
        };
        let cache = if profile.caching { 1.0 } else { 0.6 };
        let retries = match profile.retry_limit {
            0 => 1.0 - profile.error_rate,
            1..=3 => 1.0,
            _ => 0.8,
        };
        let reliability = 1.0 - profile.error_rate;

        (parallel + batch + cache + retries + reliability) / 5.0
    }
}

#[async_trait]
impl Analyzer for ProfileAnalyzer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn performance(&self, unit: &UnitId, profile: &UnitProfile) -> Result<f64> {
        profile.validate().map_err(|e| Error::Analysis {
            model: Self::NAME.to_string(),
            message: format!("{}: {}", unit, e),
        })?;
        Ok(Self::score(profile))
    }

    async fn patterns(
        &self,
        unit: &UnitId,
        profile: &UnitProfile,
        history: &[f64],
    ) -> Result<PatternSignal> {
        profile.validate().map_err(|e| Error::Analysis {
            model: Self::NAME.to_string(),
            message: format!("{}: {}", unit, e),
        })?;

        let mut inefficiencies = BTreeSet::new();
        if profile.parallelism < 4 {
            inefficiencies.insert(Inefficiency::LowParallelism);
        }
        if !profile.caching {
            inefficiencies.insert(Inefficiency::CacheDisabled);
        }
        let ratio = f64::from(profile.batch_size) / f64::from(IDEAL_BATCH_SIZE);
        if !(0.5..=2.0).contains(&ratio) {
            inefficiencies.insert(Inefficiency::BatchMistuned);
        }
        if profile.retry_limit > 3 {
            inefficiencies.insert(Inefficiency::ExcessiveRetries);
        }
        if profile.retry_limit == 0 && profile.error_rate > 0.05 {
            inefficiencies.insert(Inefficiency::UnprotectedFailures);
        }

        Ok(PatternSignal {
            inefficiencies,
            drift: drift(history),
        })
    }
}

/// Distance of the latest score from the mean of the ones before it.
fn drift(history: &[f64]) -> f64 {
    match history.split_last() {
        Some((last, previous)) if !previous.is_empty() => {
            let mean = previous.iter().sum::<f64>() / previous.len() as f64;
            (last - mean).abs()
        }
        _ => 0.0,
    }
}

/// Linear extrapolation over the score history.
#[derive(Debug, Clone)]
pub struct TrendPredictor {
    /// History length at which confidence reaches 1.0.
    pub full_confidence_at: usize,
}

impl TrendPredictor {
    pub const NAME: &'static str = "trend";

    pub fn new() -> Self {
        Self {
            full_confidence_at: 10,
        }
    }
}

impl Default for TrendPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Predictor for TrendPredictor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn predict(&self, unit: &UnitId, history: &[f64]) -> Result<Prediction> {
        if history.iter().any(|v| !v.is_finite()) {
            return Err(Error::Model {
                model: Self::NAME.to_string(),
                message: format!("non-finite score in history of {}", unit),
            });
        }

        let confidence =
            (history.len() as f64 / self.full_confidence_at.max(1) as f64).min(1.0);
        let expected = match history {
            [] => 0.5,
            [only] => *only,
            [first, .., last] => {
                let slope = (last - first) / (history.len() - 1) as f64;
                last + slope
            }
        };

        Ok(Prediction {
            expected: expected.clamp(0.0, 1.0),
            confidence,
        })
    }
}
