//! Orchestration layer.
//!
//! The four coordination loops and their supporting pieces:
//! - `scheduler`: detects, ranks and executes coordination opportunities
//! - `scaler`: scores scalability and brings capacity online
//! - `optimizer`: analyzes and tunes units of work
//! - `reflection`: learns from recent outcomes and biases the other loops
//!
//! plus error recovery for the optimizer, task routing, and the pluggable
//! analysis strategies.

pub mod knowledge;
pub mod optimizer;
pub mod recovery;
pub mod reflection;
pub mod router;
pub mod scaler;
pub mod scheduler;
pub mod strategy;
pub mod unit;

pub use knowledge::{Bias, KnowledgeStore, Lesson, Pattern, PatternId, PatternKind, ReflectionInsight};
pub use optimizer::{
    Analysis, OptimizationEngine, OptimizationHistory, OptimizationMode, OptimizationRecord,
    OptimizerConfig, OptimizerCycleReport, TriggerSignals, UnitLocks,
};
pub use recovery::{ErrorClass, RecoveryAction, RecoveryConfig, RecoveryHandler};
pub use reflection::{ReflectionConfig, ReflectionEngine, ReflectionReport};
pub use router::{estimate_duration, RouterConfig, TaskRouter};
pub use scaler::{AutoScaler, ScalabilityFactors, ScalerConfig, ScalingDecision};
pub use scheduler::{
    CoordinationEvent, CoordinationEventKind, CoordinationOpportunity, CoordinationScheduler,
    CycleReport, OpportunityKind, SchedulerConfig,
};
pub use strategy::{Analyzer, PatternSignal, Prediction, Predictor, ProfileAnalyzer, TrendPredictor};
pub use unit::{Improvement, Inefficiency, Risk, UnitId, UnitProfile, UnitState};
