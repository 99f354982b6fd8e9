//! Synchronization primitives shared by the reconcilers

pub mod keyed_lock;
pub mod wait;

pub use keyed_lock::*;
pub use wait::*;
