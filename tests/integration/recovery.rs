//! Recovery integration tests.
//!
//! These tests verify how per-unit failures are classified and recovered
//! from: review flagging, delayed re-analysis with lowered model
//! confidence, lock release, and failures of recovery itself.

use chrono::Utc;
use std::sync::Arc;

use maestro::core::Category;
use maestro::orchestration::{
    Bias, ProfileAnalyzer, RecoveryAction, TrendPredictor, UnitId, UnitState,
};
use maestro::{Coordinator, EngineEvent, Error};

use crate::fixtures::{
    active, at, config_with, generic_error, neglected_profile, OptimizerHarness,
    ScriptedAnalyzer, ScriptedPredictor,
};

// ========== Review Flagging Tests ==========

/// Test: Repeated failures flag a unit for manual review
/// Given a unit whose analysis always fails
/// When the optimizer runs repeatedly
/// Then the fourth failure flags it, the fifth cycle skips it, and clearing
///      the review returns it to automatic optimization
#[tokio::test]
async fn test_repeated_failures_flag_unit() {
    let analyzer = ScriptedAnalyzer::always_failing(generic_error);
    let mut config = config_with(vec![active("orchestrator", Category::Core, 0.3)]);
    config.units.push(maestro::config::UnitSpec {
        id: "ledger".to_string(),
        profile: neglected_profile(),
    });
    let coordinator = Coordinator::builder(config)
        .with_analyzer(analyzer.clone())
        .with_simulated_workers()
        .build()
        .await
        .unwrap();
    let mut events = coordinator.subscribe();
    let unit = UnitId::from("ledger");

    for cycle in 1..=4 {
        let report = coordinator.run_optimizer_cycle().await;
        assert_eq!(report.failed, vec![unit.clone()], "cycle {}", cycle);
    }
    assert_eq!(coordinator.status().await.review_queue, vec![unit.clone()]);

    let fifth = coordinator.run_optimizer_cycle().await;
    assert_eq!(fifth.skipped, vec![unit.clone()]);
    assert_eq!(analyzer.calls(), 4);

    let mut flagged = 0;
    let mut fallbacks = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::UnitFlagged { unit: u } if u == unit => flagged += 1,
            EngineEvent::RecoveryScheduled {
                action: RecoveryAction::SafeFallback,
                ..
            } => fallbacks += 1,
            _ => {}
        }
    }
    assert_eq!(flagged, 1);
    assert_eq!(fallbacks, 4);

    assert!(coordinator.clear_review(&unit).await);
    assert!(!coordinator.clear_review(&unit).await);
    let resumed = coordinator.run_optimizer_cycle().await;
    assert_eq!(resumed.failed, vec![unit.clone()]);
    assert!(coordinator.status().await.review_queue.is_empty());
}

// ========== Re-analysis Tests ==========

/// Test: Model failure lowers confidence and delays re-analysis
/// Given a predictor that fails with a model error
/// When a cycle runs, then cycles at +10s and +31s after recovery
/// Then confidence drops to 0.8, the unit is skipped until due, and it is
///      analyzed again once the delay has passed
#[tokio::test]
async fn test_model_error_schedules_reanalysis() {
    let predictor = ScriptedPredictor::new(0.7, 0.5);
    let harness = OptimizerHarness::new(Arc::new(ProfileAnalyzer::new()), predictor.clone())
        .with_unit("ledger", neglected_profile());
    let unit = UnitId::from("ledger");
    let now = Utc::now();

    predictor.set_failing(true);
    let first = harness.engine.run_cycle(now, &Bias::default()).await;

    assert_eq!(first.failed, vec![unit.clone()]);
    assert!((harness.engine.model_confidence(ScriptedPredictor::NAME) - 0.8).abs() < 1e-9);
    assert_eq!(
        harness.recovery.read().await.reanalysis_due_at(&unit),
        Some(at(now, 30))
    );

    predictor.set_failing(false);
    let early = harness.engine.run_cycle(at(now, 10), &Bias::default()).await;
    assert_eq!(early.skipped, vec![unit.clone()]);

    let due = harness.engine.run_cycle(at(now, 31), &Bias::default()).await;
    assert_eq!(due.analyzed, vec![unit.clone()]);
    assert!(harness.recovery.read().await.reanalysis_due_at(&unit).is_none());
}

/// Test: Analysis failures of the built-in analyzer name its model
#[tokio::test]
async fn test_invalid_profile_recovers_as_analysis_error() {
    let mut broken = neglected_profile();
    broken.error_rate = 1.5;
    let harness = OptimizerHarness::new(
        Arc::new(ProfileAnalyzer::new()),
        Arc::new(TrendPredictor::new()),
    )
    .with_unit("ledger", broken);
    let mut events = harness.bus.subscribe();

    harness.engine.run_cycle(Utc::now(), &Bias::default()).await;

    let mut action = None;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::RecoveryScheduled { action: a, .. } = event {
            action = Some(a);
        }
    }
    assert_eq!(
        action,
        Some(RecoveryAction::Reanalyze {
            delay_secs: 30,
            model: Some(ProfileAnalyzer::NAME.to_string()),
        })
    );
    assert!(harness.engine.model_confidence(ProfileAnalyzer::NAME) < 1.0);
}

// ========== Lock Tests ==========

/// Test: Contended unit lock
/// Given a candidate unit whose lock is held by someone else
/// When a cycle runs
/// Then the attempt fails without a history record, recovery releases the
///      lock, and the next cycle optimizes the unit
#[tokio::test]
async fn test_lock_contention_releases_and_retries() {
    let harness = OptimizerHarness::new(
        Arc::new(ProfileAnalyzer::new()),
        Arc::new(TrendPredictor::new()),
    )
    .with_unit("ledger", neglected_profile());
    let unit = UnitId::from("ledger");
    let now = Utc::now();
    harness.locks.try_acquire(&unit).await.unwrap();

    let contended = harness.engine.run_cycle(now, &Bias::default()).await;

    assert_eq!(contended.failed, vec![unit.clone()]);
    assert_eq!(harness.history_len().await, 0);
    assert!(!harness.locks.is_locked(&unit).await);
    assert_eq!(
        harness.engine.state(&unit),
        Some(UnitState::OptimizationCandidate)
    );

    let retried = harness.engine.run_cycle(at(now, 1), &Bias::default()).await;

    assert_eq!(retried.optimized, vec![unit.clone()]);
    assert_eq!(harness.history_len().await, 1);
    assert_eq!(harness.engine.state(&unit), Some(UnitState::Optimized));
}

// ========== Critical Error Tests ==========

/// Test: Recovery that cannot be applied becomes a critical error
/// Given a failure reported for a unit the engine does not know
/// When recovery runs for it
/// Then a critical error is recorded and published
#[tokio::test]
async fn test_failed_recovery_is_critical() {
    let harness = OptimizerHarness::new(
        Arc::new(ProfileAnalyzer::new()),
        Arc::new(TrendPredictor::new()),
    );
    let mut events = harness.bus.subscribe();
    let ghost = UnitId::from("ghost");

    harness
        .engine
        .recover(&ghost, &Error::Other("ghost exploded".to_string()), Utc::now())
        .await;

    let recovery = harness.recovery.read().await;
    assert_eq!(recovery.critical_count(), 1);
    assert_eq!(recovery.critical_errors()[0].unit, ghost);

    let mut critical = false;
    while let Ok(event) = events.try_recv() {
        critical |= matches!(event, EngineEvent::CriticalError { .. });
    }
    assert!(critical);
}
