//! Interface to the business-logic worker modules.
//!
//! The coordinator treats workers as opaque units: it can ask for their
//! status and hand them tasks, nothing else. Task payloads are never
//! inspected, except for the coordination tasks the coordinator authors
//! itself (see [`Task::coordination`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Mutex;
use uuid::Uuid;

use crate::core::{Category, WorkerId};
use crate::error::{Error, Result};

/// Task kind used when the coordinator asks a worker to shed load.
pub const SHED_LOAD: &str = "shed_load";

/// Task kind sent to a partner worker that takes over shed load.
pub const ABSORB_LOAD: &str = "absorb_load";

/// Task kind used when the coordinator synchronizes two dependent workers.
pub const SYNC: &str = "sync";

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// 1 is most urgent.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

fn default_priority() -> u8 {
    5
}

impl Task {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            kind: kind.into(),
            required_capabilities: Vec::new(),
            priority: default_priority(),
            payload: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// A task authored by the coordinator itself.
    pub fn coordination(kind: &str, payload: Value) -> Self {
        Self::new(kind).with_priority(1).with_payload(payload)
    }

    pub fn is_coordination(&self) -> bool {
        matches!(self.kind.as_str(), SHED_LOAD | ABSORB_LOAD | SYNC)
    }
}

/// Outcome reported by a worker after executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub worker: WorkerId,
    #[serde(default)]
    pub output: Value,
}

/// Status reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub load: f64,
    pub category: Category,
    pub capabilities: BTreeSet<String>,
}

/// A worker's business-logic module as seen by the coordinator.
#[async_trait]
pub trait WorkerUnit: Send + Sync {
    /// Current load, category and capabilities.
    async fn status(&self) -> Result<WorkerStatus>;

    /// Execute a task and report its result.
    async fn execute(&self, task: Task) -> Result<TaskResult>;
}

/// In-process worker whose load responds to the tasks it receives.
///
/// Used by the CLI to drive the coordinator without external services.
/// Regular tasks add `task_cost` to its load; `shed_load` and
/// `absorb_load` tasks set it to the requested target.
pub struct SimulatedWorker {
    id: WorkerId,
    category: Category,
    capabilities: BTreeSet<String>,
    load: Mutex<f64>,
    task_cost: f64,
}

impl SimulatedWorker {
    pub fn new(id: impl Into<WorkerId>, category: Category, initial_load: f64) -> Self {
        Self {
            id: id.into(),
            category,
            capabilities: BTreeSet::new(),
            load: Mutex::new(initial_load.clamp(0.0, 1.0)),
            task_cost: 0.05,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task_cost(mut self, cost: f64) -> Self {
        self.task_cost = cost;
        self
    }

    pub fn load(&self) -> f64 {
        self.load.lock().map(|l| *l).unwrap_or(0.0)
    }

    fn set_load(&self, value: f64) -> Result<f64> {
        let mut load = self
            .load
            .lock()
            .map_err(|_| Error::Worker {
                worker: self.id.clone(),
                message: "load lock poisoned".to_string(),
            })?;
        *load = value.clamp(0.0, 1.0);
        Ok(*load)
    }
}

#[async_trait]
impl WorkerUnit for SimulatedWorker {
    async fn status(&self) -> Result<WorkerStatus> {
        Ok(WorkerStatus {
            load: self.load(),
            category: self.category,
            capabilities: self.capabilities.clone(),
        })
    }

    async fn execute(&self, task: Task) -> Result<TaskResult> {
        let load = match task.kind.as_str() {
            SHED_LOAD | ABSORB_LOAD => {
                let target = task
                    .payload
                    .get("target")
                    .and_then(Value::as_f64)
                    .unwrap_or_else(|| self.load());
                self.set_load(target)?
            }
            SYNC => self.load(),
            _ => self.set_load(self.load() + self.task_cost)?,
        };

        Ok(TaskResult {
            task_id: task.id,
            worker: self.id.clone(),
            output: serde_json::json!({ "load": load }),
        })
    }
}
