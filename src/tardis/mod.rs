//! Timestamp-leased TARDIS protocol.
//!
//! Shared copies carry a read lease `[wts, rts]` in logical time and every
//! core keeps a program timestamp `pts`. A load may use a shared copy as
//! long as its lease covers `max(pts, wts)`; past that it renews at the
//! directory. Writers never invalidate readers: a store commits at a
//! timestamp above every lease handed out for the line, so the directory
//! grants ownership right away and does not track sharers.

mod directory;
mod l1;

pub use directory::{DirState, TardisDirectory};
pub use l1::{L1State, TardisL1};
