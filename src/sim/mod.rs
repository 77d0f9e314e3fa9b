//! Deterministic save device simulation
//!
//! Stands in for a console save-data service in tests and the demo. It must
//! stay deterministic:
//! - Seeded RNG only (latency in ticks)
//! - Completions released by an explicit step
//! - Failures scripted per call kind, never random

pub mod device;
pub mod faults;

pub use device::SimDevice;
pub use faults::FaultPlan;
