//! Asynchronous, multi-device parameter-server training core.
//!
//! Workers pinned to model replicas exchange parameters and gradients with a
//! [`storage::ParameterStore`] that keeps one versioned shard per device. The
//! exchange can be compressed through [`compression::GradientSparsifier`] and the
//! store can maintain [`averaging::MovingAverage`] shadow parameters.
//!
//! The entry point for a training driver is [`AsyncGraphGroup`].

pub mod averaging;
pub mod checkpoint;
pub mod compression;
pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod model;
pub mod optimization;
pub mod scheduling;
pub mod storage;

pub use config::GroupConfig;
pub use error::{Result, TrainErr};
pub use execution::AsyncGraphGroup;
