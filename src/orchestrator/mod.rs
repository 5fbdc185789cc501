//! Long-lived capture service.
//!
//! The service runs as one tokio task that owns the capture process, the session state
//! and the write path into the store. Callers talk to it through a cloneable
//! [`CaptureService`] handle; every request is a control message answered by a
//! one-shot acknowledgement, and the handle bounds each wait with a timeout.
//!
//! Capture events are handled on the same task as control messages, so storage and
//! observers see a single writer: every record is persisted first and then delivered.

mod completion;
mod session;

pub use completion::{StopConfirmation, StopReport};
pub use session::{Session, SessionState, SessionStats};

use crate::capture::{CaptureEvent, CaptureProcess, FixSource, SampleSource};
use crate::config::CaptureConfig;
use crate::delivery::{chunk_captured_data, CaptureMessage, DeliveryChannel, Observer};
use crate::error::{CaptureError, CaptureResult};
use crate::model::{CapturedData, GeoLocation, MeasurementId, MeasurementStatus};
use crate::storage::MeasurementStore;
use completion::{stop_channel, StopNotifier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const CONTROL_QUEUE: usize = 32;

/// Hands out fresh hardware subscriptions for every start and resume
pub trait HardwareProvider: Send {
    fn fix_source(&mut self) -> CaptureResult<Box<dyn FixSource>>;
    fn sample_sources(&mut self) -> CaptureResult<Vec<Box<dyn SampleSource>>>;
}

/// Resource keeping the device awake while capturing
pub trait KeepAlive: Send {
    fn acquire(&mut self);
    fn release(&mut self);
}

#[derive(Debug, Default)]
pub struct NoKeepAlive;

impl KeepAlive for NoKeepAlive {
    fn acquire(&mut self) {}
    fn release(&mut self) {}
}

/// Answer to a ping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: SessionState,
    pub measurement_id: Option<MeasurementId>,
    pub stats: SessionStats,
}

enum Control {
    RegisterObserver(Arc<dyn Observer>, oneshot::Sender<bool>),
    UnregisterObserver(String, oneshot::Sender<bool>),
    Start(MeasurementId, oneshot::Sender<CaptureResult<()>>),
    Stop(StopNotifier),
    Pause(oneshot::Sender<CaptureResult<()>>),
    Resume(oneshot::Sender<CaptureResult<()>>),
    Ping(oneshot::Sender<ServiceStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running capture service
#[derive(Clone)]
pub struct CaptureService {
    control: mpsc::Sender<Control>,
    timeout: Duration,
}

impl CaptureService {
    /// Spawn the service task on the current runtime
    pub fn spawn(
        store: Arc<MeasurementStore>,
        delivery: Arc<DeliveryChannel>,
        hardware: Box<dyn HardwareProvider>,
        keep_alive: Box<dyn KeepAlive>,
        config: CaptureConfig,
    ) -> (Self, JoinHandle<()>) {
        let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let timeout = config.pause_resume_timeout();
        let orchestrator = Orchestrator {
            store,
            delivery,
            hardware,
            keep_alive,
            config,
            session: Session::new(),
            stats: SessionStats::default(),
            capture: None,
            events: None,
        };
        let handle = tokio::spawn(orchestrator.run(control_rx));
        (Self { control, timeout }, handle)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
        timeout: Duration,
    ) -> CaptureResult<T> {
        let (tx, rx) = oneshot::channel();
        let exchange = async {
            self.control
                .send(make(tx))
                .await
                .map_err(|_| CaptureError::ServiceGone)?;
            rx.await.map_err(|_| CaptureError::ServiceGone)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| CaptureError::Timeout(timeout.as_millis() as u64))?
    }

    /// Returns false if an observer with that id is already registered
    pub async fn register_observer(&self, observer: Arc<dyn Observer>) -> CaptureResult<bool> {
        self.request(|tx| Control::RegisterObserver(observer, tx), self.timeout)
            .await
    }

    pub async fn unregister_observer(&self, id: &str) -> CaptureResult<bool> {
        let id = id.to_string();
        self.request(|tx| Control::UnregisterObserver(id, tx), self.timeout)
            .await
    }

    /// Start capturing into an OPEN measurement
    pub async fn start(&self, id: MeasurementId) -> CaptureResult<()> {
        self.request(|tx| Control::Start(id, tx), self.timeout).await?
    }

    /// Ask the service to stop; the returned confirmation fires once the stop completed
    pub async fn stop(&self) -> CaptureResult<StopConfirmation> {
        let (notifier, confirmation) = stop_channel();
        tokio::time::timeout(self.timeout, self.control.send(Control::Stop(notifier)))
            .await
            .map_err(|_| CaptureError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|_| CaptureError::ServiceGone)?;
        Ok(confirmation)
    }

    pub async fn pause(&self) -> CaptureResult<()> {
        self.pause_within(self.timeout).await
    }

    pub async fn pause_within(&self, timeout: Duration) -> CaptureResult<()> {
        self.request(Control::Pause, timeout).await?
    }

    pub async fn resume(&self) -> CaptureResult<()> {
        self.resume_within(self.timeout).await
    }

    pub async fn resume_within(&self, timeout: Duration) -> CaptureResult<()> {
        self.request(Control::Resume, timeout).await?
    }

    /// Liveness check; fails with `ServiceGone` or `Timeout` if the task is not answering
    pub async fn ping(&self, timeout: Duration) -> CaptureResult<ServiceStatus> {
        self.request(Control::Ping, timeout).await
    }

    /// Stop any running session and end the task
    pub async fn shutdown(&self) -> CaptureResult<()> {
        self.request(Control::Shutdown, self.timeout).await
    }
}

struct Orchestrator {
    store: Arc<MeasurementStore>,
    delivery: Arc<DeliveryChannel>,
    hardware: Box<dyn HardwareProvider>,
    keep_alive: Box<dyn KeepAlive>,
    config: CaptureConfig,
    session: Session,
    stats: SessionStats,
    capture: Option<CaptureProcess>,
    events: Option<UnboundedReceiver<CaptureEvent>>,
}

impl Orchestrator {
    async fn run(mut self, mut control_rx: mpsc::Receiver<Control>) {
        log::debug!("Capture service running");
        loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(Control::Shutdown(ack)) => {
                        self.shut_down().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(control) => self.handle_control(control).await,
                    None => {
                        self.shut_down().await;
                        break;
                    }
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.on_capture_event(event),
                    None => {
                        log::warn!("Capture process ended without being closed");
                        self.events = None;
                    }
                },
            }
        }
        log::debug!("Capture service stopped");
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::RegisterObserver(observer, ack) => {
                let _ = ack.send(self.delivery.register(observer));
            }
            Control::UnregisterObserver(id, ack) => {
                let _ = ack.send(self.delivery.unregister(&id));
            }
            Control::Start(id, ack) => {
                let result = self.start(id);
                if let Err(e) = &result {
                    log::warn!("Failed to start capture for measurement {}: {}", id, e);
                }
                let _ = ack.send(result);
            }
            Control::Stop(mut notifier) => {
                let result = self.stop().await;
                notifier.fire(result);
            }
            Control::Pause(ack) => {
                let result = self.pause().await;
                let _ = ack.send(result);
            }
            Control::Resume(ack) => {
                let result = self.resume();
                let _ = ack.send(result);
            }
            Control::Ping(ack) => {
                let _ = ack.send(ServiceStatus {
                    state: self.session.state(),
                    measurement_id: self.session.measurement(),
                    stats: self.stats.clone(),
                });
            }
            Control::Shutdown(ack) => {
                self.shut_down().await;
                let _ = ack.send(());
            }
        }
    }

    fn start(&mut self, id: MeasurementId) -> CaptureResult<()> {
        self.session.begin_start(id)?;
        if let Err(e) = self.ensure_open(id).and_then(|_| self.attach()) {
            self.session.abort_start();
            return Err(e);
        }
        self.stats = SessionStats::default();
        self.keep_alive.acquire();
        self.session.confirm_start()?;
        log::info!("Capturing measurement {}", id);
        self.delivery
            .deliver(&CaptureMessage::CaptureStarted { measurement_id: id });
        Ok(())
    }

    fn ensure_open(&self, id: MeasurementId) -> CaptureResult<()> {
        let measurement = self
            .store
            .load_measurement(id)
            .map_err(|e| CaptureError::Setup(e.to_string()))?;
        if measurement.status != MeasurementStatus::Open {
            return Err(CaptureError::Setup(format!(
                "measurement {} is {}",
                id,
                measurement.status.as_str()
            )));
        }
        Ok(())
    }

    fn attach(&mut self) -> CaptureResult<()> {
        let fix_source = self.hardware.fix_source()?;
        let sample_sources = self.hardware.sample_sources()?;
        let (process, events) = CaptureProcess::start(&self.config, fix_source, sample_sources)?;
        self.capture = Some(process);
        self.events = Some(events);
        Ok(())
    }

    /// Close the capture process and handle every event it still emitted
    async fn detach(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.close().await;
        }
        if let Some(mut events) = self.events.take() {
            while let Some(event) = events.recv().await {
                self.on_capture_event(event);
            }
        }
    }

    async fn pause(&mut self) -> CaptureResult<()> {
        let id = self.session.pause()?;
        self.detach().await;
        self.keep_alive.release();
        log::info!("Paused measurement {}", id);
        Ok(())
    }

    fn resume(&mut self) -> CaptureResult<()> {
        let id = match self.session.measurement() {
            Some(id) if self.session.state() == SessionState::Paused => id,
            _ => return self.session.resume().map(|_| ()),
        };
        self.ensure_open(id)?;
        self.attach()?;
        self.session.resume()?;
        self.keep_alive.acquire();
        log::info!("Resumed measurement {}", id);
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<StopReport> {
        let id = self.session.begin_stop()?;
        self.detach().await;
        self.keep_alive.release();

        let success = match self.store.set_status(id, MeasurementStatus::Finished) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to finish measurement {}: {}", id, e);
                false
            }
        };
        self.session.finish_stop();
        log::info!(
            "Stopped measurement {} ({} locations, {} samples, {} persistence failures)",
            id,
            self.stats.locations_captured,
            self.stats.samples_captured,
            self.stats.persistence_failures
        );
        self.delivery.deliver(&CaptureMessage::CaptureStopped {
            measurement_id: id,
            success,
        });
        Ok(StopReport {
            measurement_id: id,
            success,
            persistence_failures: self.stats.persistence_failures,
        })
    }

    async fn shut_down(&mut self) {
        if self.session.is_active() {
            if let Err(e) = self.stop().await {
                log::warn!("Failed to stop capture on shutdown: {}", e);
            }
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        let Some(id) = self.session.measurement() else {
            log::debug!("Dropping capture event outside of a session");
            return;
        };
        match event {
            CaptureEvent::LocationCaptured(location) => self.on_location(id, location),
            CaptureEvent::DataCaptured(data) => self.on_data(id, data),
            CaptureEvent::FixAcquired => {
                self.delivery.deliver(&CaptureMessage::FixAcquired);
            }
            CaptureEvent::FixLost => {
                self.delivery.deliver(&CaptureMessage::FixLost);
            }
            CaptureEvent::CaptureFailed(e) => {
                self.stats.capture_failures += 1;
                self.delivery.deliver(&CaptureMessage::CaptureError {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_location(&mut self, id: MeasurementId, location: GeoLocation) {
        self.stats.locations_captured += 1;
        if let Err(e) = self.store.append_locations(id, std::slice::from_ref(&location)) {
            self.stats.persistence_failures += 1;
            log::warn!("Failed to store location for measurement {}: {}", id, e);
        }
        self.delivery.deliver(&CaptureMessage::LocationCaptured(location));
    }

    fn on_data(&mut self, id: MeasurementId, data: CapturedData) {
        for chunk in chunk_captured_data(&data, self.config.chunk_size) {
            self.stats.samples_captured += chunk.len() as u64;
            if let Err(e) = self.store.append_samples(id, chunk.iter()) {
                self.stats.persistence_failures += 1;
                log::warn!(
                    "Failed to store {} samples for measurement {}: {}",
                    chunk.len(),
                    id,
                    e
                );
            }
            self.stats.chunks_delivered += 1;
            self.delivery.deliver(&CaptureMessage::DataCaptured(chunk));
        }
    }
}

/// Next capture event, or pending forever while nothing is attached
async fn next_event(events: &mut Option<UnboundedReceiver<CaptureEvent>>) -> Option<CaptureEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
