//! doppel Core - Fundamental types for the digital twin runtime
//!
//! This crate defines the types shared by every other doppel crate:
//! - Identifiers (TwinId, AdapterId)
//! - Time primitives (Timestamp)
//! - Topics and topic filters
//! - The event envelope carried by the bus
//! - The digital twin state model and state-change records
//! - The error taxonomy

pub mod id;
pub mod time;
pub mod topic;
pub mod event;
pub mod state;
pub mod change;
pub mod error;

pub use id::*;
pub use time::*;
pub use topic::*;
pub use event::*;
pub use state::*;
pub use change::*;
pub use error::*;
