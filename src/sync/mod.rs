//! Upload of finished measurements to the remote collector.
//!
//! A cycle fetches a bearer token, resolves endpoint and device id from preferences,
//! then serializes, compresses and uploads each syncable measurement in id order.
//! 201 and 409 answers purge the measurement's points and mark it synced. Any other
//! answer ends the cycle; the measurement stays finished and is retried next cycle.

pub mod engine;
pub mod http;
pub mod scheduler;

pub use engine::{
    CredentialProvider, ProgressListener, StaticCredentials, SyncEngine, SyncFailure,
    SyncProgress, SyncReport,
};
pub use http::{HttpResponse, HttpUploader, UploadOutcome, UploadRequest, Uploader};
pub use scheduler::SyncScheduler;
