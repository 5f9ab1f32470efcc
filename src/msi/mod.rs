//! Home-directory MSI protocol.
//!
//! The directory is the ordering point for every line. It collects the
//! invalidation acknowledgements itself and only then sends data to the
//! requestor, so L1 controllers never count acks.

mod directory;
mod l1;

pub use directory::{DirState, MsiDirectory};
pub use l1::{L1State, MsiL1};
