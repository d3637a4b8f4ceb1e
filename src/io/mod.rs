//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `api` - HTTP clients for the dispatch, overspeed and location APIs
//! - `kv` - Key-value storage backends
//! - `persistence` - Fleet snapshot save/restore
//! - `transport` - MQTT subscription delivering tracker records

pub mod api;
pub mod kv;
pub mod persistence;
pub mod transport;

// Re-export commonly used types
pub use api::{ApiSet, DispatchApi, HttpApiClient, LocationGateApi, OverspeedApi};
pub use kv::{FileKvStore, KeyValueStore, MemoryKvStore};
pub use persistence::PersistenceBridge;
pub use transport::start_transport;
