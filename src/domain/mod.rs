//! Domain layer - Resource identifiers and port definitions
//!
//! This module defines the compound identifiers and the backend capability
//! traits (ports) that adapters implement, following hexagonal architecture
//! principles.

pub mod path;
pub mod ports;

pub use path::*;
pub use ports::*;
