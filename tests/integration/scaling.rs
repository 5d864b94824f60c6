//! Auto-scaler integration tests.
//!
//! These tests run the auto-scaler against a real registry and load
//! monitor and verify which workers it brings online and how it raises
//! capacity.

use std::sync::Arc;
use tokio::sync::RwLock;

use maestro::core::{
    BoundedLog, Category, CategoryTable, LoadMonitor, Worker, WorkerId, WorkerRegistry, WorkerState,
};
use maestro::orchestration::scheduler::CoordinationLog;
use maestro::orchestration::{
    AutoScaler, CoordinationEventKind, ScalabilityFactors, ScalerConfig, ScalingDecision,
};
use maestro::{EngineEvent, EventBus};

use crate::fixtures::{active, pending, simulated};

struct ScalerHarness {
    registry: Arc<WorkerRegistry>,
    log: CoordinationLog,
    bus: EventBus,
    scaler: AutoScaler,
}

impl ScalerHarness {
    fn new() -> Self {
        let registry = Arc::new(WorkerRegistry::new(
            CategoryTable::new(),
            Arc::new(LoadMonitor::new()),
        ));
        let log: CoordinationLog = Arc::new(RwLock::new(BoundedLog::new(100)));
        let bus = EventBus::default();
        let scaler = AutoScaler::new(
            ScalerConfig::default(),
            Arc::clone(&registry),
            Arc::clone(&log),
            bus.clone(),
        );
        Self {
            registry,
            log,
            bus,
            scaler,
        }
    }

    async fn add(&self, id: &str, category: Category, state: WorkerState, load: f64) {
        self.registry
            .register_with_load(Worker::new(id, category).with_state(state), load)
            .await;
    }

    async fn state(&self, id: &str) -> WorkerState {
        self.registry.get(&WorkerId::from(id)).await.unwrap().state
    }

    async fn capacity(&self, id: &str) -> f64 {
        self.registry
            .load_monitor()
            .sample(&WorkerId::from(id))
            .await
            .unwrap()
            .capacity
    }
}

// ========== Scoring Tests ==========

/// Test: Score of 0.9 sits in the hold band
/// Given all four factors at 0.9
/// When the score is evaluated
/// Then it is 0.9 and no scale-up is triggered
#[test]
fn test_uniform_factors_hold() {
    let factors = ScalabilityFactors {
        worker_utilization: 0.9,
        resource_availability: 0.9,
        coordination_efficiency: 0.9,
        performance_stability: 0.9,
    };

    let score = factors.score();

    assert!((score - 0.9).abs() < 1e-12);
    assert_eq!(ScalerConfig::default().decide(score), ScalingDecision::Hold);
}

/// Test: Overloaded workers drag the score down
#[tokio::test]
async fn test_overloaded_fleet_scores_low() {
    let harness = ScalerHarness::new();
    harness.add("finance", Category::Business, WorkerState::Active, 1.0).await;
    harness.add("legal", Category::Business, WorkerState::Active, 0.95).await;

    let factors = harness.scaler.factors(0.5, 0.5).await;

    assert_eq!(factors.resource_availability, 0.0);
    assert!(factors.score() < 0.6);
}

// ========== Scale-Up Tests ==========

/// Test: At most three activations per cycle, in category priority order
/// Given an overloaded fleet and five pending workers
/// When a scaler cycle runs with poor efficiency and stability
/// Then exactly three are activated, most important categories first
#[tokio::test]
async fn test_scale_up_activates_at_most_three() {
    let harness = ScalerHarness::new();
    let mut events = harness.bus.subscribe();
    harness.add("finance", Category::Business, WorkerState::Active, 1.0).await;
    harness.add("audiovisual", Category::Specialized, WorkerState::Pending, 0.0).await;
    harness.add("self_repair", Category::Support, WorkerState::Pending, 0.0).await;
    harness.add("marketing", Category::Business, WorkerState::Pending, 0.0).await;
    harness.add("planner", Category::Core, WorkerState::Pending, 0.0).await;
    harness.add("iot", Category::Specialized, WorkerState::Pending, 0.0).await;

    let report = harness.scaler.run_cycle(0.0, 0.0).await;

    assert_eq!(report.decision, ScalingDecision::ScaleUp);
    assert_eq!(
        report.outcome.activated,
        vec![
            WorkerId::from("planner"),
            WorkerId::from("marketing"),
            WorkerId::from("audiovisual"),
        ]
    );
    assert_eq!(harness.state("iot").await, WorkerState::Pending);
    assert_eq!(harness.state("self_repair").await, WorkerState::Pending);
    assert_eq!(harness.registry.by_state(WorkerState::Pending).await.len(), 2);

    // Activated workers get a load sample with raised capacity
    assert!((harness.capacity("planner").await - 1.2).abs() < 1e-9);

    let mut activated = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::WorkerActivated { .. }) {
            activated += 1;
        }
    }
    assert_eq!(activated, 3);

    let log = harness.log.read().await;
    assert_eq!(
        log.iter()
            .filter(|e| e.kind == CoordinationEventKind::WorkerActivated)
            .count(),
        3
    );
}

/// Test: No pending workers
/// Given an overloaded fleet with nobody left to activate
/// When a scaler cycle runs
/// Then the most loaded workers get more capacity instead
#[tokio::test]
async fn test_scale_up_without_pending_raises_capacity() {
    let harness = ScalerHarness::new();
    harness.add("finance", Category::Business, WorkerState::Active, 1.0).await;
    harness.add("legal", Category::Business, WorkerState::Active, 0.95).await;

    let report = harness.scaler.run_cycle(0.0, 0.0).await;

    assert!(report.outcome.activated.is_empty());
    assert_eq!(report.outcome.raised.len(), 2);
    assert_eq!(report.outcome.raised[0].0, WorkerId::from("finance"));
    assert!((harness.capacity("finance").await - 1.2).abs() < 1e-9);
}

/// Test: Capacity is capped
/// Given repeated scale-ups of the same worker
/// When capacity would pass the maximum
/// Then it stops at the cap
#[tokio::test]
async fn test_capacity_raise_is_capped() {
    let harness = ScalerHarness::new();
    harness.add("finance", Category::Business, WorkerState::Active, 1.0).await;

    for _ in 0..10 {
        harness
            .scaler
            .scale_up(&[WorkerId::from("finance")])
            .await;
    }

    assert!((harness.capacity("finance").await - 3.0).abs() < 1e-9);
}

// ========== Scale-Down Tests ==========

/// Test: Healthy fleet
/// Given workers comfortably under their ceilings and perfect metrics
/// When a scaler cycle runs
/// Then scale-down is only considered and recorded
#[tokio::test]
async fn test_high_score_considers_scale_down_only() {
    let harness = ScalerHarness::new();
    harness.add("finance", Category::Business, WorkerState::Active, 0.8).await;
    harness.add("legal", Category::Business, WorkerState::Active, 0.8).await;
    harness.add("iot", Category::Specialized, WorkerState::Pending, 0.0).await;

    let report = harness.scaler.run_cycle(1.0, 1.0).await;

    assert_eq!(report.decision, ScalingDecision::ConsiderScaleDown);
    assert!(report.outcome.activated.is_empty());
    assert!(report.outcome.raised.is_empty());
    assert_eq!(harness.state("finance").await, WorkerState::Active);
    assert_eq!(harness.state("iot").await, WorkerState::Pending);
    assert!(harness
        .log
        .read()
        .await
        .iter()
        .any(|e| e.kind == CoordinationEventKind::ScaleDownConsidered));
}

// ========== Coordinator Tests ==========

/// Test: Scaler cycle through the coordinator updates the scalability index
#[tokio::test]
async fn test_coordinator_scaler_cycle_updates_index() {
    let coordinator = simulated(vec![
        active("finance", Category::Business, 0.5),
        pending("iot", Category::Specialized),
    ])
    .await;

    let report = coordinator.run_scaler_cycle().await;
    let status = coordinator.status().await;

    assert_eq!(status.scalability_index, report.score);
    assert_eq!(status.cycles[&maestro::actors::LoopKind::Scaler], 1);
}
