//! doppel Bus - In-process publish/subscribe dispatcher
//!
//! Every component of a twin communicates exclusively through this bus:
//! physical adapters announce asset descriptions and publish variations,
//! the transaction engine publishes state updates, the coordinator
//! publishes lifecycle transitions, digital adapters observe state
//! topics. The bus is an explicit instance handed to each component at
//! construction and is internally keyed by twin id, so twins never
//! cross-talk and tests can run isolated buses.

pub mod bus;

pub use bus::*;
