//! Task routing.
//!
//! Picks the active worker best placed to take a task and hands it over.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{CategoryPolicy, WorkerId, WorkerRegistry, WorkerState};
use crate::error::{Error, Result};
use crate::worker::{Task, TaskResult};

/// Shortest duration an estimate will return.
pub const MIN_ESTIMATE_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Load added to a worker's observed load per dispatched task.
    pub task_load_increment: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            task_load_increment: 0.05,
        }
    }
}

/// Expected time for a worker of the given category to handle a task.
///
/// Urgent tasks (priority 1-2) are expected to be handled faster than the
/// category's base response time, low-priority ones (6+) slower.
pub fn estimate_duration(policy: &CategoryPolicy, priority: u8) -> Duration {
    let factor = match priority {
        0..=2 => 0.7,
        3..=5 => 0.9,
        _ => 1.2,
    };
    let secs = (policy.response_time_secs as f64 * factor).round() as u64;
    Duration::from_secs(secs.max(MIN_ESTIMATE_SECS))
}

/// Routes tasks to workers.
pub struct TaskRouter<'a> {
    config: &'a RouterConfig,
    registry: &'a WorkerRegistry,
}

impl<'a> TaskRouter<'a> {
    pub fn new(config: &'a RouterConfig, registry: &'a WorkerRegistry) -> Self {
        Self { config, registry }
    }

    /// The active worker with an attached unit, covering the task's
    /// capabilities, with the lowest load relative to its ceiling.
    ///
    /// Ties go to the more important category, then to the smaller id.
    pub async fn select(&self, task: &Task) -> Result<WorkerId> {
        let samples = self.registry.load_monitor().snapshot().await;
        let table = self.registry.categories();

        let mut best: Option<(f64, u8, WorkerId)> = None;
        for worker in self.registry.by_state(WorkerState::Active).await {
            if !worker.covers(&task.required_capabilities) {
                continue;
            }
            if self.registry.unit(&worker.id).await.is_none() {
                continue;
            }
            let policy = table.policy(worker.category);
            let utilization = samples
                .get(&worker.id)
                .map(|s| s.utilization(policy.max_load))
                .unwrap_or(0.0);
            let candidate = (utilization, policy.priority, worker.id);
            let better = match &best {
                None => true,
                Some(current) => compare(&candidate, current) == Ordering::Less,
            };
            if better {
                best = Some(candidate);
            }
        }

        best.map(|(_, _, id)| id)
            .ok_or_else(|| Error::NoEligibleWorker(task.required_capabilities.clone()))
    }

    /// Route a task to the best worker and execute it there.
    pub async fn dispatch(&self, task: Task) -> Result<TaskResult> {
        let id = self.select(&task).await?;
        let unit = self
            .registry
            .unit(&id)
            .await
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;

        let kind = task.kind.clone();
        debug!(worker = %id, task = %task.id, kind = %kind, "dispatching task");
        let result = unit.execute(task).await?;

        let increment = self.config.task_load_increment;
        self.registry
            .load_monitor()
            .update(&id, |s| {
                let next = s.current + increment;
                s.observe(next);
            })
            .await?;
        info!(worker = %id, kind = %kind, "task dispatched");
        Ok(result)
    }
}

fn compare(a: &(f64, u8, WorkerId), b: &(f64, u8, WorkerId)) -> Ordering {
    a.0.partial_cmp(&b.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.1.cmp(&b.1))
        .then_with(|| a.2.cmp(&b.2))
}
