//! Capture, local persistence and upload of vehicle sensor measurements.
//!
//! A [`orchestrator::CaptureService`] records locations and motion samples from a
//! [`orchestrator::HardwareProvider`] into a [`storage::MeasurementStore`] and fans them out
//! to registered [`delivery::Observer`]s. Finished measurements are serialized and pushed
//! to a collector by the [`sync::SyncEngine`].

pub mod capture;
pub mod config;
pub mod delivery;
pub mod error;
pub mod hardware;
pub mod model;
pub mod orchestrator;
pub mod preferences;
pub mod serializer;
pub mod status;
pub mod storage;
pub mod sync;
