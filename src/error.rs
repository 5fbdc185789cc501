use crate::model::{MeasurementId, MeasurementStatus};
use thiserror::Error;

/// Errors raised while capturing or controlling a capture session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Invalid capture state: {0}")]
    InvalidState(String),

    #[error("Timed out after {0} ms waiting for the capture service")]
    Timeout(u64),

    #[error("Capture service is not running")]
    ServiceGone,

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors raised by the measurement store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("No measurement with identifier {0}")]
    NoSuchMeasurement(MeasurementId),

    #[error("Measurement {id} cannot move from {from:?} to {to:?}")]
    StatusRegression {
        id: MeasurementId,
        from: MeasurementStatus,
        to: MeasurementStatus,
    },

    #[error("Write for measurement {id} failed after {committed_batches} batches ({committed_points} points): {source}")]
    PartialWrite {
        id: MeasurementId,
        committed_batches: usize,
        committed_points: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Measurement {id} is {status:?}; points can only be added while it is open")]
    NotOpen {
        id: MeasurementId,
        status: MeasurementStatus,
    },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}

impl From<StorageError> for CaptureError {
    fn from(e: StorageError) -> Self {
        CaptureError::Storage(e.to_string())
    }
}

/// Errors raised when delivering a message to one observer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Observer disconnected")]
    Disconnected,

    #[error("Observer did not accept the message within {0} ms")]
    Timeout(u64),

    #[error("Failed to write message: {0}")]
    Io(String),
}

/// Errors surfaced by a synchronization cycle
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No valid auth token available: {0}")]
    CredentialUnavailable(String),

    #[error("Unable to read synchronization endpoint from settings")]
    EndpointUnconfigured,

    #[error("Unable to read device identifier from settings")]
    DeviceIdUnconfigured,

    #[error("Unable to set up the HTTP client: {0}")]
    ClientSetup(String),

    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Malformed response (status {status}): {detail}")]
    MalformedResponse { status: u16, detail: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request rejected with status {status}: {reason}")]
    RequestRejected { status: u16, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] std::io::Error),
}

impl SyncError {
    /// True for conditions the caller should answer with a fresh login
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized(_) | SyncError::CredentialUnavailable(_)
        )
    }
}

/// Errors raised while encoding a stored measurement
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Measurement {id} changed while serializing: expected {expected} {kind} rows, read {read}")]
    Inconsistent {
        id: MeasurementId,
        kind: &'static str,
        expected: usize,
        read: usize,
    },
}

impl From<SerializeError> for SyncError {
    fn from(e: SerializeError) -> Self {
        match e {
            SerializeError::Storage(e) => SyncError::Storage(e),
            SerializeError::Io(e) => SyncError::Serialization(e),
            other => SyncError::Serialization(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other.to_string(),
            )),
        }
    }
}

/// Errors raised while loading configuration or preferences
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Preferences lock poisoned")]
    Poisoned,
}

pub type CaptureResult<T> = Result<T, CaptureError>;
pub type StorageResult<T> = Result<T, StorageError>;
