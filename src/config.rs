use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::actors::LoopKind;
use crate::core::{Category, CategoryPolicy, CategoryTable, DependencyGraph, WorkerId, WorkerState};
use crate::events::DEFAULT_BUS_CAPACITY;
use crate::orchestration::{
    OptimizerConfig, RecoveryConfig, ReflectionConfig, RouterConfig, ScalerConfig,
    SchedulerConfig, UnitProfile,
};
use crate::{Error, Result};

/// Loop cadences and event retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopsConfig {
    pub scheduler_interval_secs: u64,
    pub optimizer_interval_secs: u64,
    pub scaler_interval_secs: u64,
    /// Reflection runs this many times slower than the fastest loop.
    pub reflection_ratio: u32,
    pub bus_capacity: usize,
    /// Coordination events included in a status report.
    pub recent_events: usize,
}

impl Default for LoopsConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_secs: 5,
            optimizer_interval_secs: 10,
            scaler_interval_secs: 30,
            reflection_ratio: 60,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            recent_events: 20,
        }
    }
}

impl LoopsConfig {
    pub fn interval(&self, kind: LoopKind) -> Duration {
        match kind {
            LoopKind::Scheduler => secs(self.scheduler_interval_secs),
            LoopKind::Optimizer => secs(self.optimizer_interval_secs),
            LoopKind::Scaler => secs(self.scaler_interval_secs),
            LoopKind::Reflection => self.fastest() * self.reflection_ratio.max(1),
        }
    }

    fn fastest(&self) -> Duration {
        [
            self.scheduler_interval_secs,
            self.optimizer_interval_secs,
            self.scaler_interval_secs,
        ]
        .into_iter()
        .map(secs)
        .min()
        .unwrap_or(Duration::from_secs(1))
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

/// A worker declared in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub category: Category,
    #[serde(default)]
    pub state: WorkerState,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub initial_load: f64,
}

/// `worker` depends on every worker in `on`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub worker: String,
    pub on: Vec<String>,
}

/// A unit of work handed to the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub id: String,
    #[serde(flatten)]
    pub profile: UnitProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub loops: LoopsConfig,
    pub scheduler: SchedulerConfig,
    pub scaler: ScalerConfig,
    pub optimizer: OptimizerConfig,
    pub recovery: RecoveryConfig,
    pub reflection: ReflectionConfig,
    pub router: RouterConfig,
    /// Per-category policy overrides keyed by category name.
    pub categories: BTreeMap<String, CategoryPolicy>,
    pub workers: Vec<WorkerSpec>,
    pub dependencies: Vec<DependencySpec>,
    pub units: Vec<UnitSpec>,
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    /// Load from `~/.maestro/maestro.toml`, or defaults when it is absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit path. The file must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load_from");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            workers = config.workers.len(),
            dependencies = config.dependencies.len(),
            units = config.units.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!(dir = %parent.display(), "creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Write the sample configuration to `path`.
    ///
    /// Refuses to overwrite an existing file unless `force` is set.
    pub fn init(path: &Path, force: bool) -> Result<Self> {
        if path.exists() && !force {
            return Err(Error::Validation(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        let config = Self::sample();
        config.save_to(path)?;
        Ok(config)
    }

    /// Check cross-references in the catalog.
    pub fn validate(&self) -> Result<()> {
        self.category_table()?;

        let mut ids = BTreeSet::new();
        for worker in &self.workers {
            if !ids.insert(worker.id.as_str()) {
                return Err(Error::Validation(format!("duplicate worker '{}'", worker.id)));
            }
            if !(0.0..=1.0).contains(&worker.initial_load) {
                return Err(Error::Validation(format!(
                    "worker '{}' initial_load {} outside [0, 1]",
                    worker.id, worker.initial_load
                )));
            }
        }

        for dependency in &self.dependencies {
            for id in std::iter::once(&dependency.worker).chain(dependency.on.iter()) {
                if !ids.contains(id.as_str()) {
                    return Err(Error::Validation(format!(
                        "dependency references unknown worker '{}'",
                        id
                    )));
                }
            }
        }

        let mut units = BTreeSet::new();
        for unit in &self.units {
            if !units.insert(unit.id.as_str()) {
                return Err(Error::Validation(format!("duplicate unit '{}'", unit.id)));
            }
            unit.profile.validate()?;
        }
        Ok(())
    }

    /// Category policies with the configured overrides applied.
    pub fn category_table(&self) -> Result<CategoryTable> {
        let mut table = CategoryTable::new();
        for (name, policy) in &self.categories {
            let category: Category = name.parse()?;
            table.set(
                category,
                CategoryPolicy::new(policy.priority, policy.max_load, policy.response_time_secs),
            );
        }
        Ok(table)
    }

    /// Build the dependency graph. Cycles are rejected.
    pub fn dependency_graph(&self) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        for worker in &self.workers {
            graph.add_worker(&WorkerId::from(worker.id.as_str()));
        }
        for dependency in &self.dependencies {
            let on: Vec<WorkerId> = dependency
                .on
                .iter()
                .map(|id| WorkerId::from(id.as_str()))
                .collect();
            graph.depends_on(&WorkerId::from(dependency.worker.as_str()), on.iter())?;
        }
        Ok(graph)
    }

    /// A small catalog of teams for trying the engine out.
    pub fn sample() -> Self {
        fn worker(
            id: &str,
            category: Category,
            state: WorkerState,
            caps: &[&str],
            load: f64,
        ) -> WorkerSpec {
            WorkerSpec {
                id: id.to_string(),
                category,
                state,
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                initial_load: load,
            }
        }
        fn depends(worker: &str, on: &[&str]) -> DependencySpec {
            DependencySpec {
                worker: worker.to_string(),
                on: on.iter().map(|w| w.to_string()).collect(),
            }
        }

        use Category::*;
        use WorkerState::*;
        Self {
            workers: vec![
                worker("orchestrator", Core, Active, &["planning", "routing"], 0.4),
                worker("finance", Business, Active, &["reporting", "forecasting"], 0.92),
                worker("legal", Business, Active, &["contracts", "reporting"], 0.15),
                worker("marketing", Business, Pending, &["campaigns"], 0.0),
                worker("cloud", Technical, Active, &["deploy", "monitoring"], 0.55),
                worker("security", Technical, Active, &["audit", "monitoring"], 0.2),
                worker("iot", Specialized, Pending, &["telemetry"], 0.0),
                worker("audiovisual", Specialized, Pending, &["media"], 0.0),
                worker("self_repair", Support, Pending, &["diagnostics"], 0.0),
            ],
            dependencies: vec![
                depends("finance", &["orchestrator"]),
                depends("legal", &["orchestrator"]),
                depends("security", &["cloud"]),
                depends("iot", &["cloud"]),
            ],
            units: vec![
                UnitSpec {
                    id: "invoice_pipeline".to_string(),
                    profile: UnitProfile {
                        parallelism: 1,
                        batch_size: 4,
                        caching: false,
                        retry_limit: 0,
                        error_rate: 0.12,
                    },
                },
                UnitSpec {
                    id: "contract_review".to_string(),
                    profile: UnitProfile {
                        parallelism: 2,
                        batch_size: 32,
                        caching: true,
                        retry_limit: 3,
                        error_rate: 0.02,
                    },
                },
            ],
            ..Self::default()
        }
    }
}
