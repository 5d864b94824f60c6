//! Optimization engine integration tests.
//!
//! These tests drive the engine through whole cycles with explicit
//! timestamps and check the unit lifecycle, trigger signals and the
//! optimization history it leaves behind.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use maestro::config::UnitSpec;
use maestro::core::Category;
use maestro::orchestration::{
    Bias, ProfileAnalyzer, TrendPredictor, UnitId, UnitProfile, UnitState,
};
use maestro::EngineEvent;

use crate::fixtures::{
    active, at, config_with, neglected_profile, OptimizerHarness, SlowAnalyzer,
};

fn harness() -> OptimizerHarness {
    OptimizerHarness::new(
        Arc::new(ProfileAnalyzer::new()),
        Arc::new(TrendPredictor::new()),
    )
}

fn perfect_profile() -> UnitProfile {
    UnitProfile {
        parallelism: 8,
        batch_size: 32,
        caching: true,
        retry_limit: 3,
        error_rate: 0.0,
    }
}

// ========== Lifecycle Tests ==========

/// Test: Neglected unit is optimized on first sight
/// Given a unit with several inefficiencies and no history
/// When one optimizer cycle runs
/// Then it is optimized, every kept improvement gained efficiency, and it
///      ends in the optimized state
#[tokio::test]
async fn test_neglected_unit_is_optimized() {
    let harness = harness().with_unit("ledger", neglected_profile());
    let mut events = harness.bus.subscribe();
    let unit = UnitId::from("ledger");
    let now = Utc::now();

    let report = harness.engine.run_cycle(now, &Bias::default()).await;

    assert_eq!(report.analyzed, vec![unit.clone()]);
    assert_eq!(report.optimized, vec![unit.clone()]);
    assert!(report.failed.is_empty());
    assert_eq!(harness.engine.state(&unit), Some(UnitState::Optimized));

    let history = harness.history.read().await;
    assert_eq!(history.len(), 1);
    let record = history.iter().next().unwrap();
    assert!(!record.applied.is_empty());
    assert!(record.applied.iter().all(|a| a.gain() > 0.0));
    assert!(record.improvement_score > 0.0);
    assert_eq!(record.success_rate, 1.0);
    assert!(record.error.is_none());

    let snapshot = harness.engine.snapshot(&unit).unwrap();
    assert!(snapshot.profile.caching);
    assert_eq!(snapshot.profile.batch_size, 32);
    assert_eq!(snapshot.last_optimized, Some(now));

    let mut recorded = false;
    while let Ok(event) = events.try_recv() {
        recorded |= matches!(event, EngineEvent::OptimizationRecorded { .. });
    }
    assert!(recorded);
}

/// Test: Immediate second cycle only analyzes
/// Given a unit that was just optimized
/// When another cycle runs a few seconds later
/// Then the unit is analyzed but not optimized again
#[tokio::test]
async fn test_second_cycle_analyzes_without_optimizing() {
    let harness = harness().with_unit("ledger", neglected_profile());
    let unit = UnitId::from("ledger");
    let now = Utc::now();

    harness.engine.run_cycle(now, &Bias::default()).await;
    let second = harness.engine.run_cycle(at(now, 5), &Bias::default()).await;

    assert_eq!(second.analyzed, vec![unit.clone()]);
    assert!(second.optimized.is_empty());
    assert_eq!(harness.engine.state(&unit), Some(UnitState::Analyzed));
    assert_eq!(harness.history_len().await, 1);

    let signals = harness.engine.last_analysis(&unit).unwrap().signals;
    assert!(!signals.new_inefficiency);
    assert!(!signals.cooldown_elapsed);
}

/// Test: Unit without inefficiencies is left alone
/// Given a unit whose profile is already ideal
/// When an optimizer cycle runs
/// Then only the cooldown signal fires and it does not become a candidate
#[tokio::test]
async fn test_perfect_unit_is_not_a_candidate() {
    let harness = harness().with_unit("ledger", perfect_profile());
    let unit = UnitId::from("ledger");

    let report = harness.engine.run_cycle(Utc::now(), &Bias::default()).await;

    assert!(report.optimized.is_empty());
    assert_eq!(harness.engine.state(&unit), Some(UnitState::Analyzed));
    assert_eq!(harness.engine.last_analysis(&unit).unwrap().signals.count(), 1);
    assert_eq!(harness.history_len().await, 0);
}

// ========== Trigger Tests ==========

/// Test: Performance regression after the cooldown
/// Given an optimized unit whose observed error rate then spikes
/// When a cycle runs after the cooldown has passed
/// Then the drop and the elapsed cooldown together trigger another pass
#[tokio::test]
async fn test_regression_after_cooldown_reoptimizes() {
    let harness = harness().with_unit("ledger", neglected_profile());
    let unit = UnitId::from("ledger");
    let now = Utc::now();

    harness.engine.run_cycle(now, &Bias::default()).await;
    let mut degraded = harness.engine.snapshot(&unit).unwrap().profile;
    degraded.error_rate = 0.5;
    harness.engine.update_profile(&unit, degraded).unwrap();

    let later = harness.engine.run_cycle(at(now, 301), &Bias::default()).await;

    assert_eq!(later.optimized, vec![unit.clone()]);
    let signals = harness.engine.last_analysis(&unit).unwrap().signals;
    assert!(signals.performance_drop);
    assert!(signals.cooldown_elapsed);
    assert_eq!(harness.history_len().await, 2);
}

/// Test: Reflection bias stretches the cooldown
/// Given an optimized, then degraded unit
/// When a cycle runs past the normal cooldown but under a 1.5x bias
/// Then the cooldown has not elapsed and nothing is optimized
#[tokio::test]
async fn test_cooldown_bias_delays_reoptimization() {
    let harness = harness().with_unit("ledger", neglected_profile());
    let unit = UnitId::from("ledger");
    let now = Utc::now();
    let cautious = Bias {
        cooldown_multiplier: 1.5,
        ..Bias::default()
    };

    harness.engine.run_cycle(now, &cautious).await;
    let mut degraded = harness.engine.snapshot(&unit).unwrap().profile;
    degraded.error_rate = 0.5;
    harness.engine.update_profile(&unit, degraded).unwrap();

    let later = harness.engine.run_cycle(at(now, 301), &cautious).await;

    assert!(later.optimized.is_empty());
    assert!(!harness.engine.last_analysis(&unit).unwrap().signals.cooldown_elapsed);
}

// ========== Coordinator Tests ==========

/// Test: Units from the config are optimized through the coordinator
#[tokio::test]
async fn test_config_units_flow_through_coordinator() {
    let mut config = config_with(vec![active("orchestrator", Category::Core, 0.3)]);
    config.units.push(UnitSpec {
        id: "invoice_pipeline".to_string(),
        profile: neglected_profile(),
    });
    let coordinator = maestro::Coordinator::builder(config)
        .with_simulated_workers()
        .build()
        .await
        .unwrap();

    let report = coordinator.run_optimizer_cycle().await;

    assert_eq!(report.optimized, vec![UnitId::from("invoice_pipeline")]);
    let status = coordinator.status().await;
    assert_eq!(status.units, 1);
    assert_eq!(status.performance_stability, 1.0);

    let duplicate = coordinator
        .register_unit("invoice_pipeline", perfect_profile())
        .await
        .unwrap();
    assert!(!duplicate);

    let invalid = UnitProfile {
        parallelism: 0,
        ..UnitProfile::default()
    };
    assert!(coordinator.register_unit("broken", invalid).await.is_err());
}

/// Test: Status and registration stay responsive during a slow cycle
/// Given three units and an analyzer that takes seconds per call
/// When an optimizer cycle is in flight
/// Then status and unit registration complete without waiting for it, and
///      the cycle still covers the units it started with
#[tokio::test(start_paused = true)]
async fn test_status_not_blocked_by_optimizer_cycle() {
    let mut config = config_with(vec![active("orchestrator", Category::Core, 0.3)]);
    for id in ["ledger", "invoices", "payroll"] {
        config.units.push(UnitSpec {
            id: id.to_string(),
            profile: neglected_profile(),
        });
    }
    let coordinator = Arc::new(
        maestro::Coordinator::builder(config)
            .with_analyzer(SlowAnalyzer::new(Duration::from_secs(5)))
            .with_simulated_workers()
            .build()
            .await
            .unwrap(),
    );

    let cycle = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.run_optimizer_cycle().await }
    });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    let status = tokio::time::timeout(Duration::from_secs(1), coordinator.status())
        .await
        .expect("status waited on the optimizer cycle");
    assert_eq!(status.units, 3);

    let registered = tokio::time::timeout(
        Duration::from_secs(1),
        coordinator.register_unit("payments", perfect_profile()),
    )
    .await
    .expect("registration waited on the optimizer cycle")
    .unwrap();
    assert!(registered);

    let report = cycle.await.unwrap();
    assert_eq!(report.analyzed.len() + report.failed.len(), 3);
    assert!(!report.analyzed.contains(&UnitId::from("payments")));
    assert_eq!(coordinator.status().await.units, 4);
}
