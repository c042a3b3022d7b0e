#![forbid(unsafe_code)]

//! rivulet: a clustered reactive stream subscription and dispatch
//! framework.
//!
//! Producer services publish named topic streams through a per-service
//! [`endpoint`]; remote consumers subscribe over a framed binary
//! connection speaking the [`proto`] dialect. Each consumer connection
//! owns a [`session`] (alias table) and an [`aggregator`] that
//! multiplexes its subscriptions with demand-driven backpressure,
//! priority round-robin dispatch, time-based coalescing, and transparent
//! rebinding via the [`binding`] registry when a service relocates.

pub mod aggregator;
pub mod binding;
pub mod clock;
pub mod config;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod proto;
pub mod session;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    Alias, ColumnValue, CorrelationId, DictMapState, EvictionSide, Limits, ListState,
    ListTransition, ServiceKey, SetState, SetTransition, StreamState, StreamStateTransition,
    StreamUpdate, StringState, Subject, Tags, TopicKey,
};
