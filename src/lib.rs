//! Directory-based cache coherence simulator.
//!
//! L1 controllers and home directories exchange coherence messages over a
//! three-network interconnect, driven cycle by cycle on an asynchronix
//! timeline. Two protocols are provided: a classic invalidation-based MSI
//! and the timestamp-leased TARDIS.

pub mod buffer;
pub mod cache_memory;
pub mod common;
pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod models;
pub mod monitor;
pub mod msi;
pub mod sequencer;
pub mod stats;
pub mod system;
pub mod tardis;
pub mod workload;

pub use config::{Config, Protocol};
pub use error::SimError;
pub use stats::Report;
pub use system::run;
