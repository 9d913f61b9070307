//! Resource sampling and CPU allocation control.
//!
//! [`ResourceSampler`] smooths OS readings from a [`ResourceProbe`];
//! [`AllocationController`] turns the smoothed view into an
//! [`AllocationState`] and pushes it to registered listeners.

pub mod controller;
pub mod probe;
pub mod sampler;

pub use controller::{
    thread_split, AllocationController, AllocationListener, AllocationState, ControllerSettings,
};
pub use probe::{MemoryProbe, RawReading, ResourceProbe, SystemProbe};
pub use sampler::{ResourceSample, ResourceSampler};
