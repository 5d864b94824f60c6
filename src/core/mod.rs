//! Shared coordination state.
//!
//! Workers, their load, and the dependency relations between them. These
//! are read and mutated by every coordination loop.

pub mod graph;
pub mod history;
pub mod load;
pub mod registry;
pub mod worker;

pub use graph::DependencyGraph;
pub use history::BoundedLog;
pub use load::{LoadMonitor, LoadSample, UNDERUTILIZED_THRESHOLD};
pub use registry::WorkerRegistry;
pub use worker::{Category, CategoryPolicy, CategoryTable, Worker, WorkerId, WorkerState};
