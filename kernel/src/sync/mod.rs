//! Synchronization: hazard bitmasks and RCU reclamation.

pub mod hazard;
pub mod rcu;

pub use hazard::{Hazard, HazardFlags};
