//! Worker data model.
//!
//! Workers are the addressable units of capacity the coordinator balances,
//! scales and routes tasks to. Each belongs to a category that fixes its
//! load ceiling and priority class.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::error::Error;

/// Unique identifier for a worker.
///
/// Workers are named by the team they stand for ("finance", "legal"), so
/// the identifier is a string rather than a generated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker categories.
///
/// The set is fixed; the per-category load ceiling and priority class are
/// configurable through [`CategoryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Coordination-critical teams (orchestration, planning).
    Core,
    /// Business-facing teams (finance, legal, marketing).
    Business,
    /// Technical teams (cloud, security).
    Technical,
    /// Specialized teams (audiovisual, IoT).
    Specialized,
    /// Support and self-repair teams.
    Support,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Core,
        Category::Business,
        Category::Technical,
        Category::Specialized,
        Category::Support,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Core => "core",
            Category::Business => "business",
            Category::Technical => "technical",
            Category::Specialized => "specialized",
            Category::Support => "support",
        }
    }

    /// Built-in policy for this category.
    pub fn default_policy(&self) -> CategoryPolicy {
        match self {
            Category::Core => CategoryPolicy::new(1, 0.8, 30),
            Category::Business => CategoryPolicy::new(2, 0.85, 60),
            Category::Technical => CategoryPolicy::new(2, 0.85, 45),
            Category::Specialized => CategoryPolicy::new(3, 0.9, 90),
            Category::Support => CategoryPolicy::new(4, 0.9, 40),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s.to_lowercase())
            .ok_or_else(|| Error::UnknownCategory(s.to_string()))
    }
}

/// Load ceiling and priority class of a category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// Priority class, lower is more important. Used only for tie-breaking.
    pub priority: u8,
    /// Maximum sustainable load in [0, 1].
    pub max_load: f64,
    /// Typical response time used for duration estimates.
    #[serde(default = "default_response_time")]
    pub response_time_secs: u64,
}

fn default_response_time() -> u64 {
    60
}

impl CategoryPolicy {
    pub fn new(priority: u8, max_load: f64, response_time_secs: u64) -> Self {
        Self {
            priority,
            max_load: max_load.clamp(0.0, 1.0),
            response_time_secs,
        }
    }
}

/// Policy table for all categories.
///
/// Always answers for every category: overrides fall back to the built-in
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct CategoryTable {
    overrides: BTreeMap<Category, CategoryPolicy>,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, category: Category, policy: CategoryPolicy) -> Self {
        self.set(category, policy);
        self
    }

    pub fn set(&mut self, category: Category, policy: CategoryPolicy) {
        self.overrides.insert(category, policy);
    }

    pub fn policy(&self, category: Category) -> CategoryPolicy {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_policy())
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Registered but dormant; eligible for activation by the auto-scaler.
    #[default]
    Pending,
    /// Taking load.
    Active,
    /// Unreachable or withdrawn.
    Inactive,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Pending => write!(f, "pending"),
            WorkerState::Active => write!(f, "active"),
            WorkerState::Inactive => write!(f, "inactive"),
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub category: Category,
    #[serde(default)]
    pub state: WorkerState,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl Worker {
    pub fn new(id: impl Into<WorkerId>, category: Category) -> Self {
        Self {
            id: id.into(),
            category,
            state: WorkerState::Pending,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_state(mut self, state: WorkerState) -> Self {
        self.state = state;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Active
    }

    /// Whether this worker declares every one of `required`.
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}
