//! Per-worker load tracking.
//!
//! The `LoadMonitor` keeps one [`LoadSample`] per worker behind its own
//! mutex so the scheduler (rebalancing) and the auto-scaler (capacity
//! changes) can touch different workers concurrently while updates to the
//! same worker are serialized.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::core::worker::WorkerId;
use crate::error::{Error, Result};

/// Number of recent observations the rolling average is computed over.
pub const ROLLING_WINDOW: usize = 12;

/// Load below which a worker counts as underutilized.
pub const UNDERUTILIZED_THRESHOLD: f64 = 0.3;

/// Default capacity multiplier for a newly tracked worker.
pub const DEFAULT_CAPACITY: f64 = 1.0;

/// Load observation for a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    /// Current load in [0, 1].
    pub current: f64,
    /// Highest load observed.
    pub peak: f64,
    /// Rolling average over the last [`ROLLING_WINDOW`] observations.
    pub average: f64,
    /// Capacity multiplier applied to the category ceiling.
    pub capacity: f64,
    #[serde(skip)]
    window: VecDeque<f64>,
}

impl Default for LoadSample {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl LoadSample {
    pub fn new(current: f64) -> Self {
        let current = current.clamp(0.0, 1.0);
        let mut window = VecDeque::with_capacity(ROLLING_WINDOW);
        window.push_back(current);
        Self {
            current,
            peak: current,
            average: current,
            capacity: DEFAULT_CAPACITY,
            window,
        }
    }

    /// Record a new observation, updating peak and rolling average.
    pub fn observe(&mut self, load: f64) {
        let load = load.clamp(0.0, 1.0);
        self.current = load;
        self.peak = self.peak.max(load);
        if self.window.len() == ROLLING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(load);
        self.average = self.window.iter().sum::<f64>() / self.window.len() as f64;
    }

    /// Effective load ceiling for a category maximum.
    pub fn ceiling(&self, max_load: f64) -> f64 {
        (self.capacity * max_load).min(1.0)
    }

    pub fn is_overloaded(&self, max_load: f64) -> bool {
        self.current > self.ceiling(max_load)
    }

    pub fn is_underutilized(&self) -> bool {
        self.current < UNDERUTILIZED_THRESHOLD
    }

    /// Load relative to the ceiling; above 1.0 means overloaded.
    pub fn utilization(&self, max_load: f64) -> f64 {
        let ceiling = self.ceiling(max_load);
        if ceiling <= f64::EPSILON {
            return if self.current > 0.0 { f64::INFINITY } else { 0.0 };
        }
        self.current / ceiling
    }
}

/// Store of per-worker load samples.
#[derive(Debug, Default)]
pub struct LoadMonitor {
    samples: RwLock<HashMap<WorkerId, Arc<Mutex<LoadSample>>>>,
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a worker if it is not tracked yet.
    ///
    /// Returns `true` when a new sample was created.
    pub async fn ensure(&self, id: &WorkerId, initial: f64) -> bool {
        let mut samples = self.samples.write().await;
        if samples.contains_key(id) {
            return false;
        }
        samples.insert(id.clone(), Arc::new(Mutex::new(LoadSample::new(initial))));
        true
    }

    pub async fn contains(&self, id: &WorkerId) -> bool {
        self.samples.read().await.contains_key(id)
    }

    /// Snapshot of a worker's load.
    pub async fn sample(&self, id: &WorkerId) -> Option<LoadSample> {
        let slot = self.slot(id).await?;
        let sample = slot.lock().await.clone();
        Some(sample)
    }

    /// Snapshot of every tracked worker.
    pub async fn snapshot(&self) -> HashMap<WorkerId, LoadSample> {
        let slots: Vec<(WorkerId, Arc<Mutex<LoadSample>>)> = self
            .samples
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut out = HashMap::with_capacity(slots.len());
        for (id, slot) in slots {
            out.insert(id, slot.lock().await.clone());
        }
        out
    }

    /// Record an observed load, creating the sample if needed.
    pub async fn record(&self, id: &WorkerId, load: f64) {
        if self.ensure(id, load).await {
            return;
        }
        if let Some(slot) = self.slot(id).await {
            slot.lock().await.observe(load);
        }
    }

    /// Mutate a worker's sample under its lock.
    pub async fn update<F, T>(&self, id: &WorkerId, f: F) -> Result<T>
    where
        F: FnOnce(&mut LoadSample) -> T,
    {
        let slot = self
            .slot(id)
            .await
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        let mut sample = slot.lock().await;
        Ok(f(&mut sample))
    }

    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }

    async fn slot(&self, id: &WorkerId) -> Option<Arc<Mutex<LoadSample>>> {
        self.samples.read().await.get(id).cloned()
    }
}
