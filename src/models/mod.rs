//! asynchronix models wiring the controllers into one simulated system.
//!
//! Every model is driven by a per-cycle `on_tick` input sent by the run
//! loop; traffic between models goes through `Output` ports. Models report
//! whether they still hold work through a shared busy flag and publish
//! their statistics when sent `on_report`.

mod cache;
mod directory;
mod memory;
mod network;
mod processor;

use std::sync::{Arc, Mutex};

pub use cache::CacheNode;
pub use directory::DirectoryNode;
pub use memory::Memory;
pub use network::Network;
pub use processor::Processor;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
