//! Coordination scheduler integration tests.
//!
//! These tests drive full scheduler cycles through the coordinator with
//! recording worker units attached, and check load balancing, dependency
//! handling, status polling and task routing end to end.

use maestro::config::DependencySpec;
use maestro::core::{Category, WorkerId, WorkerState};
use maestro::orchestration::{CoordinationEventKind, OpportunityKind};
use maestro::worker::{Task, ABSORB_LOAD, SHED_LOAD};
use maestro::{Coordinator, EngineEvent, Error};

use crate::fixtures::{active, config_with, pending, simulated, RecordingWorker};

async fn load_of(coordinator: &Coordinator, id: &str) -> f64 {
    coordinator
        .registry()
        .load_monitor()
        .sample(&WorkerId::from(id))
        .await
        .expect("worker has no load sample")
        .current
}

// ========== Load Balancing Tests ==========

/// Test: Overloaded worker with an idle peer in the same category
/// Given A (max_load 0.8, load 0.95) and B (load 0.1), both core
/// When one scheduler cycle runs
/// Then a load_balancing opportunity references A and B and A's load drops
#[tokio::test]
async fn test_overloaded_worker_is_rebalanced() {
    let a = RecordingWorker::new("a", Category::Core, 0.95);
    let b = RecordingWorker::new("b", Category::Core, 0.1);
    let coordinator = Coordinator::builder(config_with(vec![
        active("a", Category::Core, 0.95),
        active("b", Category::Core, 0.1),
    ]))
    .attach("a", a.clone())
    .attach("b", b.clone())
    .build()
    .await
    .unwrap();
    let mut events = coordinator.subscribe();

    let report = coordinator.run_scheduler_cycle().await;

    let balancing = report
        .detected
        .iter()
        .find(|o| o.kind == OpportunityKind::LoadBalancing)
        .expect("no load_balancing opportunity");
    assert!(balancing.involves(&WorkerId::from("a")));
    assert!(balancing.involves(&WorkerId::from("b")));
    assert!(report.executed.iter().any(|o| o.kind == OpportunityKind::LoadBalancing));

    let a_load = load_of(&coordinator, "a").await;
    assert!(a_load < 0.95);
    assert!(a_load <= 0.8, "A should be at or under its ceiling, got {}", a_load);
    assert!(load_of(&coordinator, "b").await > 0.1);

    // Workers were told about their new targets
    assert_eq!(a.task_kinds(), vec![SHED_LOAD.to_string()]);
    assert_eq!(b.task_kinds(), vec![ABSORB_LOAD.to_string()]);
    assert!((a.load() - a_load).abs() < 1e-9);

    let mut saw_rebalance = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Coordination(e) = event {
            saw_rebalance |= e.kind == CoordinationEventKind::Rebalanced;
        }
    }
    assert!(saw_rebalance, "rebalance should be published on the bus");
}

/// Test: No underutilized partner
/// Given an overloaded worker whose only peer is moderately loaded
/// When a scheduler cycle runs
/// Then no load_balancing opportunity is generated and loads are unchanged
#[tokio::test]
async fn test_no_partner_no_rebalance() {
    let coordinator = simulated(vec![
        active("a", Category::Core, 0.95),
        active("c", Category::Core, 0.5),
    ])
    .await;

    let report = coordinator.run_scheduler_cycle().await;

    assert!(report
        .detected
        .iter()
        .all(|o| o.kind != OpportunityKind::LoadBalancing));
    assert!((load_of(&coordinator, "a").await - 0.95).abs() < 1e-9);
}

/// Test: Shed load respects every ceiling
/// Given a worker at full load and two idle peers
/// When one scheduler cycle runs
/// Then the worker and both peers end at or under their ceilings
#[tokio::test]
async fn test_rebalancing_reaches_ceiling() {
    let coordinator = simulated(vec![
        active("finance", Category::Business, 1.0),
        active("legal", Category::Business, 0.0),
        active("marketing", Category::Business, 0.05),
    ])
    .await;

    coordinator.run_scheduler_cycle().await;

    let ceiling = Category::Business.default_policy().max_load;
    assert!(load_of(&coordinator, "finance").await <= ceiling + 1e-9);
    for partner in ["legal", "marketing"] {
        assert!(load_of(&coordinator, partner).await <= ceiling + 1e-9);
    }
}

// ========== Dependency Tests ==========

fn dependent_catalog(strict: bool) -> maestro::config::Config {
    let mut config = config_with(vec![
        active("a", Category::Core, 0.95),
        active("b", Category::Core, 0.1),
        active("c", Category::Technical, 0.5),
    ]);
    config.dependencies.push(DependencySpec {
        worker: "c".to_string(),
        on: vec!["a".to_string()],
    });
    config.scheduler.strict_dependencies = strict;
    config
}

/// Test: Soft dependencies (default)
/// Given C depends on A and is mid-operation
/// When A is rebalanced
/// Then the action proceeds and the event names the busy dependent
#[tokio::test]
async fn test_soft_dependency_recorded_not_blocking() {
    let coordinator = Coordinator::builder(dependent_catalog(false))
        .with_simulated_workers()
        .build()
        .await
        .unwrap();

    coordinator.run_scheduler_cycle().await;

    assert!(load_of(&coordinator, "a").await < 0.95);
    let status = coordinator.status().await;
    let rebalanced = status
        .recent_events
        .iter()
        .find(|e| e.kind == CoordinationEventKind::Rebalanced)
        .expect("no rebalance event");
    assert!(rebalanced.detail.contains("dependents busy"));
    assert!(rebalanced.detail.ends_with("busy: c"));
}

/// Test: Strict dependencies
/// Given strict_dependencies and C depending on A mid-operation
/// When a scheduler cycle runs
/// Then A keeps its load and a dependency_deferred event is recorded
#[tokio::test]
async fn test_strict_dependency_defers_rebalance() {
    let coordinator = Coordinator::builder(dependent_catalog(true))
        .with_simulated_workers()
        .build()
        .await
        .unwrap();

    coordinator.run_scheduler_cycle().await;

    assert!((load_of(&coordinator, "a").await - 0.95).abs() < 1e-9);
    let status = coordinator.status().await;
    let deferred = status
        .recent_events
        .iter()
        .find(|e| e.kind == CoordinationEventKind::DependencyDeferred)
        .expect("no dependency_deferred event");
    assert_eq!(
        deferred.workers,
        vec![WorkerId::from("a"), WorkerId::from("c")]
    );
}

/// Test: Dependency load gap triggers a sync
/// Given C depends on A and their loads differ by more than the sync gap
/// When a scheduler cycle runs
/// Then both workers receive a sync task
#[tokio::test]
async fn test_dependency_gap_synchronizes_workers() {
    let a = RecordingWorker::new("a", Category::Core, 0.75);
    let c = RecordingWorker::new("c", Category::Technical, 0.2);
    let mut config = config_with(vec![
        active("a", Category::Core, 0.75),
        active("c", Category::Technical, 0.2),
    ]);
    config.dependencies.push(DependencySpec {
        worker: "c".to_string(),
        on: vec!["a".to_string()],
    });
    let coordinator = Coordinator::builder(config)
        .attach("a", a.clone())
        .attach("c", c.clone())
        .build()
        .await
        .unwrap();

    let report = coordinator.run_scheduler_cycle().await;

    assert!(report
        .executed
        .iter()
        .any(|o| o.kind == OpportunityKind::CrossWorkerSync));
    assert_eq!(a.task_kinds(), vec!["sync".to_string()]);
    assert_eq!(c.task_kinds(), vec!["sync".to_string()]);
}

// ========== Ranking Tests ==========

/// Test: Per-cycle action budget
/// Given two overloaded workers and one action allowed per cycle
/// When a scheduler cycle runs
/// Then only the highest-priority opportunity executes
#[tokio::test]
async fn test_action_budget_limits_execution() {
    let mut config = config_with(vec![
        active("x", Category::Core, 0.9),
        active("y", Category::Core, 1.0),
        active("idle", Category::Core, 0.0),
    ]);
    config.scheduler.max_actions_per_cycle = 1;
    let coordinator = Coordinator::builder(config)
        .with_simulated_workers()
        .build()
        .await
        .unwrap();

    let report = coordinator.run_scheduler_cycle().await;

    assert_eq!(report.detected.len(), 2);
    assert_eq!(report.executed.len(), 1);
    assert_eq!(report.executed[0].workers[0], WorkerId::from("y"));
    assert!((report.efficiency() - 0.5).abs() < 1e-9);
    assert!((coordinator.status().await.coordination_efficiency - 0.5).abs() < 1e-9);
}

// ========== Status Polling Tests ==========

/// Test: Unreachable worker
/// Given an active worker whose status call starts failing
/// When scheduler cycles run before and after it recovers
/// Then it goes inactive, then active again
#[tokio::test]
async fn test_unreachable_worker_deactivated_then_reactivated() {
    let flaky = RecordingWorker::new("flaky", Category::Support, 0.2);
    let config = config_with(vec![active("flaky", Category::Support, 0.2)]);
    let coordinator = Coordinator::builder(config)
        .attach("flaky", flaky.clone())
        .build()
        .await
        .unwrap();
    let id = WorkerId::from("flaky");

    flaky.set_reachable(false);
    coordinator.run_scheduler_cycle().await;
    assert_eq!(
        coordinator.registry().get(&id).await.unwrap().state,
        WorkerState::Inactive
    );
    assert_eq!(coordinator.status().await.inactive_workers, 1);

    flaky.set_reachable(true);
    flaky.set_load(0.4);
    coordinator.run_scheduler_cycle().await;
    assert_eq!(
        coordinator.registry().get(&id).await.unwrap().state,
        WorkerState::Active
    );
    assert!((load_of(&coordinator, "flaky").await - 0.4).abs() < 1e-9);

    let kinds: Vec<CoordinationEventKind> = coordinator
        .status()
        .await
        .recent_events
        .iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&CoordinationEventKind::WorkerDeactivated));
    assert!(kinds.contains(&CoordinationEventKind::WorkerReactivated));
}

// ========== Task Routing Tests ==========

/// Test: Dispatch picks the least relatively loaded capable worker
/// Given two capable active workers and an idle pending one
/// When a reporting task is dispatched
/// Then it runs on the less loaded active worker
#[tokio::test]
async fn test_dispatch_routes_to_least_loaded() {
    let mut workers = vec![
        active("finance", Category::Business, 0.6),
        active("legal", Category::Business, 0.3),
        pending("marketing", Category::Business),
    ];
    for w in &mut workers {
        w.capabilities = vec!["reporting".to_string()];
    }
    let coordinator = simulated(workers).await;

    let result = coordinator
        .dispatch(Task::new("quarterly").requiring(["reporting"]))
        .await
        .unwrap();

    assert_eq!(result.worker, WorkerId::from("legal"));
    assert!(load_of(&coordinator, "legal").await > 0.3);

    let missing = coordinator
        .dispatch(Task::new("deploy").requiring(["kubernetes"]))
        .await;
    assert!(matches!(missing, Err(Error::NoEligibleWorker(_))));
}

/// Test: Duration estimate by category and priority
#[tokio::test]
async fn test_estimate_uses_category_response_time() {
    let coordinator = simulated(vec![active("iot", Category::Specialized, 0.1)]).await;

    let urgent = coordinator.estimate(&WorkerId::from("iot"), 1).await.unwrap();
    let routine = coordinator.estimate(&WorkerId::from("iot"), 8).await.unwrap();

    assert!(urgent < routine);
    assert_eq!(routine.as_secs(), 108);
}
