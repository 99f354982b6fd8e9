//! Connection Registry Module
//!
//! Shares one backend session per cluster across all resource operations.

pub mod connections;
pub mod events;

pub use connections::*;
pub use events::*;
