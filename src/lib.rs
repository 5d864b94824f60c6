pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod log;
pub mod worker;

// Coordination state and loops
pub mod actors;
pub mod core;
pub mod orchestration;

pub use coordinator::{Coordinator, CoordinatorBuilder, SystemStatus};
pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
