//! doppel Runtime - Lifecycle coordination and adapter scheduling
//!
//! This crate hosts the twin itself: the lifecycle coordinator that
//! owns one twin's adapter workers and aggregates their bound status,
//! the physical/digital adapter contracts and their worker loops, the
//! shadowing contract that drives the transaction engine, the registry
//! of named twins, and the storage observer that archives everything
//! an external backend may query.

pub mod lifecycle;
pub mod physical;
pub mod digital;
pub mod shadowing;
pub mod twin;
pub mod engine;
pub mod storage;

pub use lifecycle::{LifecycleListener, LifecycleSignal, LifecycleState};
pub use physical::{
    ActionRequest, AssetAction, AssetDescription, AssetEvent, AssetProperty, AssetRelationship,
    PhysicalAdapter, PhysicalAdapterEndpoint,
};
pub use digital::{DigitalAdapter, DigitalAdapterEndpoint};
pub use shadowing::{PhysicalSignal, ShadowingContext, ShadowingFunction};
pub use twin::{DigitalTwin, TwinConfig};
pub use engine::TwinEngine;
pub use storage::{InMemoryStorage, StorageObserver, StorageRecord, StoredEntry, TwinStorage};
