//! Observer mailbox between the capture service and its listeners.
//!
//! Observers may live in another task, thread or process. Delivery never waits on an
//! observer for longer than its own send timeout, and an observer that fails once is
//! dropped from the registry while everyone else still gets the message.

use crate::error::DeliveryError;
use crate::model::{CapturedData, GeoLocation, MeasurementId, Point3D};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wire codes of [`CaptureMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EventCode {
    DataCaptured = 1,
    LocationCaptured = 2,
    FixAcquired = 3,
    FixLost = 4,
    CaptureStarted = 5,
    CaptureStopped = 6,
    CaptureError = 7,
}

impl EventCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Everything the capture service tells its observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum CaptureMessage {
    DataCaptured(CapturedData),
    LocationCaptured(GeoLocation),
    FixAcquired,
    FixLost,
    CaptureStarted {
        measurement_id: MeasurementId,
    },
    CaptureStopped {
        measurement_id: MeasurementId,
        success: bool,
    },
    CaptureError {
        reason: String,
    },
}

impl CaptureMessage {
    pub fn code(&self) -> EventCode {
        match self {
            CaptureMessage::DataCaptured(_) => EventCode::DataCaptured,
            CaptureMessage::LocationCaptured(_) => EventCode::LocationCaptured,
            CaptureMessage::FixAcquired => EventCode::FixAcquired,
            CaptureMessage::FixLost => EventCode::FixLost,
            CaptureMessage::CaptureStarted { .. } => EventCode::CaptureStarted,
            CaptureMessage::CaptureStopped { .. } => EventCode::CaptureStopped,
            CaptureMessage::CaptureError { .. } => EventCode::CaptureError,
        }
    }
}

pub trait Observer: Send + Sync {
    /// Registry key; two observers with the same id are the same observer
    fn id(&self) -> &str;

    fn deliver(&self, message: &CaptureMessage) -> Result<(), DeliveryError>;
}

/// Observer backed by a bounded crossbeam channel
pub struct ChannelObserver {
    id: String,
    tx: Sender<CaptureMessage>,
    send_timeout: Duration,
}

impl ChannelObserver {
    pub fn new(
        id: impl Into<String>,
        capacity: usize,
        send_timeout: Duration,
    ) -> (Self, Receiver<CaptureMessage>) {
        let (tx, rx) = channel::bounded(capacity);
        (
            Self {
                id: id.into(),
                tx,
                send_timeout,
            },
            rx,
        )
    }
}

impl Observer for ChannelObserver {
    fn id(&self) -> &str {
        &self.id
    }

    fn deliver(&self, message: &CaptureMessage) -> Result<(), DeliveryError> {
        self.tx
            .send_timeout(message.clone(), self.send_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    DeliveryError::Timeout(self.send_timeout.as_millis() as u64)
                }
                SendTimeoutError::Disconnected(_) => DeliveryError::Disconnected,
            })
    }
}

/// Observer writing one JSON object per line, e.g. into a pipe or socket to another process.
///
/// Lines go through a bounded queue drained by a dedicated writer thread, so a reader
/// that stops reading fills the queue and the next delivery times out.
pub struct WriterObserver<W: Write + Send + 'static> {
    id: String,
    lines: Sender<Vec<u8>>,
    send_timeout: Duration,
    writer: JoinHandle<W>,
}

impl<W: Write + Send + 'static> WriterObserver<W> {
    pub fn new(
        id: impl Into<String>,
        writer: W,
        capacity: usize,
        send_timeout: Duration,
    ) -> std::io::Result<Self> {
        let id = id.into();
        let (tx, rx) = channel::bounded::<Vec<u8>>(capacity);
        let thread_id = id.clone();
        let handle = thread::Builder::new()
            .name(format!("observer-{}", id))
            .spawn(move || {
                let mut writer = writer;
                for line in rx {
                    if let Err(e) = writer.write_all(&line).and_then(|_| writer.flush()) {
                        log::warn!("Observer {} writer failed: {}", thread_id, e);
                        break;
                    }
                }
                writer
            })?;
        Ok(Self {
            id,
            lines: tx,
            send_timeout,
            writer: handle,
        })
    }

    /// Close the queue, wait for queued lines to be written and return the writer
    pub fn finish(self) -> Option<W> {
        let Self { lines, writer, .. } = self;
        drop(lines);
        writer.join().ok()
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    code: i32,
    #[serde(flatten)]
    message: &'a CaptureMessage,
}

impl<W: Write + Send + 'static> Observer for WriterObserver<W> {
    fn id(&self) -> &str {
        &self.id
    }

    fn deliver(&self, message: &CaptureMessage) -> Result<(), DeliveryError> {
        let envelope = Envelope {
            code: message.code().as_i32(),
            message,
        };
        let mut line =
            serde_json::to_vec(&envelope).map_err(|e| DeliveryError::Io(e.to_string()))?;
        line.push(b'\n');
        self.lines
            .send_timeout(line, self.send_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    DeliveryError::Timeout(self.send_timeout.as_millis() as u64)
                }
                SendTimeoutError::Disconnected(_) => DeliveryError::Disconnected,
            })
    }
}

/// Registry of observers with snapshot delivery
#[derive(Default)]
pub struct DeliveryChannel {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl DeliveryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an observer with the same id is already registered
    pub fn register(&self, observer: Arc<dyn Observer>) -> bool {
        let Ok(mut observers) = self.observers.write() else {
            log::error!("Observer registry poisoned");
            return false;
        };
        if observers.iter().any(|o| o.id() == observer.id()) {
            log::warn!("Observer {} already registered", observer.id());
            return false;
        }
        log::debug!("Registered observer {}", observer.id());
        observers.push(observer);
        true
    }

    pub fn unregister(&self, id: &str) -> bool {
        let Ok(mut observers) = self.observers.write() else {
            return false;
        };
        let before = observers.len();
        observers.retain(|o| o.id() != id);
        let removed = observers.len() != before;
        if !removed {
            log::debug!("Observer {} was not registered", id);
        }
        removed
    }

    /// Remove this exact instance, leaving a re-registered observer with the same id alone
    fn remove(&self, observer: &Arc<dyn Observer>) {
        if let Ok(mut observers) = self.observers.write() {
            let target = Arc::as_ptr(observer) as *const ();
            observers.retain(|o| Arc::as_ptr(o) as *const () != target);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Deliver to every observer registered at call time; returns how many accepted it
    pub fn deliver(&self, message: &CaptureMessage) -> usize {
        let snapshot: Vec<Arc<dyn Observer>> = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for observer in snapshot {
            match observer.deliver(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!(
                        "Dropping observer {} after failed {:?} delivery: {}",
                        observer.id(),
                        message.code(),
                        e
                    );
                    self.remove(&observer);
                }
            }
        }
        delivered
    }
}

/// Split a batch into consecutive chunks of at most `chunk_size` combined samples.
///
/// Chunks fill greedily in kind order (accelerations, then rotations, then directions),
/// each kind taken from its own list, so `N` samples always give `ceil(N / chunk_size)`
/// chunks whose concatenation equals the input.
pub fn chunk_captured_data(data: &CapturedData, chunk_size: usize) -> Vec<CapturedData> {
    let chunk_size = chunk_size.max(1);
    if data.is_empty() {
        return Vec::new();
    }
    if data.len() <= chunk_size {
        return vec![data.clone()];
    }

    let mut chunks = Vec::with_capacity(data.len().div_ceil(chunk_size));
    let mut current = CapturedData::default();
    let mut room = chunk_size;
    for kind in crate::model::PointKind::ALL {
        let mut rest: &[Point3D] = data.of_kind(kind);
        while !rest.is_empty() {
            let take = room.min(rest.len());
            let (head, tail) = rest.split_at(take);
            for sample in head {
                current.push(sample.clone());
            }
            rest = tail;
            room -= take;
            if room == 0 {
                chunks.push(std::mem::take(&mut current));
                room = chunk_size;
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
