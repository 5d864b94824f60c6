//! Worker registry and category manager.
//!
//! Holds every registered worker with its lifecycle state and, optionally,
//! the [`WorkerUnit`] that implements it. Each worker lives in its own slot
//! behind a mutex; state changes from the scheduler and the auto-scaler on
//! the same worker are therefore serialized.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::core::load::LoadMonitor;
use crate::core::worker::{Category, CategoryPolicy, CategoryTable, Worker, WorkerId, WorkerState};
use crate::error::{Error, Result};
use crate::worker::WorkerUnit;

struct WorkerSlot {
    worker: Worker,
    unit: Option<Arc<dyn WorkerUnit>>,
}

/// Catalog of workers.
pub struct WorkerRegistry {
    categories: CategoryTable,
    slots: RwLock<HashMap<WorkerId, Arc<Mutex<WorkerSlot>>>>,
    load: Arc<LoadMonitor>,
}

impl WorkerRegistry {
    pub fn new(categories: CategoryTable, load: Arc<LoadMonitor>) -> Self {
        Self {
            categories,
            slots: RwLock::new(HashMap::new()),
            load,
        }
    }

    /// Register a worker.
    ///
    /// Idempotent by id: returns `false` and leaves the existing entry
    /// untouched when the id is already registered. Active workers get a
    /// load sample immediately.
    pub async fn register(&self, worker: Worker) -> bool {
        self.register_with_load(worker, 0.0).await
    }

    /// Register a worker with an initial load observation.
    pub async fn register_with_load(&self, worker: Worker, initial_load: f64) -> bool {
        let id = worker.id.clone();
        let active = worker.is_active();
        {
            let mut slots = self.slots.write().await;
            if slots.contains_key(&id) {
                debug!(worker = %id, "worker already registered");
                return false;
            }
            slots.insert(
                id.clone(),
                Arc::new(Mutex::new(WorkerSlot { worker, unit: None })),
            );
        }

        if active || initial_load > 0.0 {
            self.load.ensure(&id, initial_load).await;
        }
        debug!(worker = %id, active, "worker registered");
        true
    }

    /// Bind the business-logic module that implements a worker.
    pub async fn attach(&self, id: &WorkerId, unit: Arc<dyn WorkerUnit>) -> Result<()> {
        let slot = self.slot(id).await?;
        slot.lock().await.unit = Some(unit);
        Ok(())
    }

    pub async fn unit(&self, id: &WorkerId) -> Option<Arc<dyn WorkerUnit>> {
        let slot = self.slot(id).await.ok()?;
        let unit = slot.lock().await.unit.clone();
        unit
    }

    /// Workers with an attached unit, with their current state.
    pub async fn units(&self) -> Vec<(WorkerId, WorkerState, Arc<dyn WorkerUnit>)> {
        let mut out = Vec::new();
        for slot in self.all_slots().await {
            let slot = slot.lock().await;
            if let Some(unit) = &slot.unit {
                out.push((slot.worker.id.clone(), slot.worker.state, Arc::clone(unit)));
            }
        }
        out
    }

    pub async fn get(&self, id: &WorkerId) -> Option<Worker> {
        let slot = self.slot(id).await.ok()?;
        let worker = slot.lock().await.worker.clone();
        Some(worker)
    }

    /// All workers, ordered by id.
    pub async fn get_all(&self) -> Vec<Worker> {
        let mut workers = Vec::new();
        for slot in self.all_slots().await {
            workers.push(slot.lock().await.worker.clone());
        }
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub async fn by_state(&self, state: WorkerState) -> Vec<Worker> {
        self.get_all()
            .await
            .into_iter()
            .filter(|w| w.state == state)
            .collect()
    }

    /// Change a worker's lifecycle state, returning the previous state.
    ///
    /// Activating a worker initializes its load sample if it has none.
    pub async fn set_state(&self, id: &WorkerId, state: WorkerState) -> Result<WorkerState> {
        let slot = self.slot(id).await?;
        let previous = {
            let mut slot = slot.lock().await;
            let previous = slot.worker.state;
            slot.worker.state = state;
            previous
        };

        if state == WorkerState::Active && self.load.ensure(id, 0.0).await {
            debug!(worker = %id, "load sample initialized on activation");
        }
        if previous != state {
            info!(worker = %id, from = %previous, to = %state, "worker state changed");
        }
        Ok(previous)
    }

    pub async fn category_of(&self, id: &WorkerId) -> Option<Category> {
        let slot = self.slot(id).await.ok()?;
        let category = slot.lock().await.worker.category;
        Some(category)
    }

    pub async fn policy_of(&self, id: &WorkerId) -> Option<CategoryPolicy> {
        self.category_of(id)
            .await
            .map(|category| self.categories.policy(category))
    }

    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    pub fn load_monitor(&self) -> &Arc<LoadMonitor> {
        &self.load
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    async fn slot(&self, id: &WorkerId) -> Result<Arc<Mutex<WorkerSlot>>> {
        self.slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))
    }

    async fn all_slots(&self) -> Vec<Arc<Mutex<WorkerSlot>>> {
        self.slots.read().await.values().cloned().collect()
    }
}
