//! Hardware capabilities available without a device.

pub mod simulated;

pub use simulated::{GpsReceiver, MotionSensors, SimulatedHardware, SimulationConfig};
