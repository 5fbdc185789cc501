//! Capture layer: fix detection, sample sources and the process fusing them.

pub mod fix_status;
pub mod process;

pub use fix_status::{
    select_fix_source, FixSink, FixSource, FixState, FixStatusMachine, FixTransition,
    LocationTimeoutFix, SatelliteFixSource, SatelliteStatus,
};
pub use process::{CaptureCore, CaptureEvent, CaptureProcess, SampleSink, SampleSource};

use crate::model::{GeoLocation, Point3D};

/// Everything a hardware source can push into a running capture process
#[derive(Debug, Clone)]
pub(crate) enum SourceEvent {
    FixAcquired,
    FixLost,
    Location(GeoLocation),
    Sample(Point3D),
    Unavailable { source: String, reason: String },
}
