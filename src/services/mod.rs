//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `engine` - Single-consumer actor that owns the vehicle state
//! - `normalizer` - Raw tracker record to `VehicleEvent`
//! - `store` - Per-tracker state table with snapshot publishing
//! - `trail` - Bounded trail accumulation
//! - `zone_detector` - Terminal arrival matching
//! - `overspeed` - Speed threshold detection
//! - `coordinator` - Dispatch lifecycle guards and API sequencing
//! - `refresh` - Suspend/refetch/resume controller

pub mod coordinator;
pub mod engine;
pub mod normalizer;
pub mod overspeed;
pub mod refresh;
pub mod store;
pub mod trail;
pub mod zone_detector;

// Re-export commonly used types
pub use coordinator::{DispatchCoordinator, DispatchError};
pub use engine::{Engine, EngineHandle};
pub use refresh::{RefreshController, RefreshError};
pub use store::VehicleStateStore;
