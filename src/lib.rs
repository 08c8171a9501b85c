//! A trace-driven model of a single-level, set-associative, write-back cache.
//!
//! [`Simulator`] replays `load`/`store` records from a [`Trace`] against a
//! [`Cache`] backed by a [`Memory`], producing one result line per access.

pub mod cache;
pub mod config;
pub mod error;
pub mod hex;
pub mod memory;
pub mod replace;
pub mod sim;
pub mod trace;

pub use cache::{AccessResult, Cache, CacheStats, Geometry, Request};
pub use config::CacheConfig;
pub use error::{ConfigError, Error, RangeError, Result};
pub use memory::{FlatMemory, Memory};
pub use sim::Simulator;
pub use trace::{Record, Trace};
