//! doppel State - Transactional state management
//!
//! The state manager is the only component permitted to mutate the
//! digital twin state. The shadowing function stages a batch of
//! property/action/event/relationship mutations inside a transaction
//! and atomically commits or rolls them back; every commit replaces the
//! published snapshot wholesale and emits one `dt.state.update`
//! envelope plus one topical envelope per applied change.

pub mod transaction;
pub mod manager;

pub use transaction::*;
pub use manager::*;
