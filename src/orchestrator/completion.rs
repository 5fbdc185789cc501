use crate::error::{CaptureError, CaptureResult};
use crate::model::MeasurementId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

/// What a finished stop reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    pub measurement_id: MeasurementId,
    /// False if the measurement could not be marked finished
    pub success: bool,
    pub persistence_failures: u64,
}

/// Create a linked notifier/confirmation pair
pub(crate) fn stop_channel() -> (StopNotifier, StopConfirmation) {
    let (tx, rx) = oneshot::channel();
    (
        StopNotifier { tx: Some(tx) },
        StopConfirmation {
            rx: Some(rx),
            cancelled: false,
        },
    )
}

/// Sending half, held by the service until the stop completed
pub(crate) struct StopNotifier {
    tx: Option<oneshot::Sender<CaptureResult<StopReport>>>,
}

impl StopNotifier {
    /// Fires at most once. Returns false if it already fired or nobody is listening anymore.
    pub(crate) fn fire(&mut self, result: CaptureResult<StopReport>) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let delivered = tx.send(result).is_ok();
                if !delivered {
                    log::debug!("Stop confirmation was cancelled before the stop finished");
                }
                delivered
            }
            None => {
                log::warn!("Stop confirmation already fired");
                false
            }
        }
    }
}

/// Single-fire completion of one stop request
pub struct StopConfirmation {
    rx: Option<oneshot::Receiver<CaptureResult<StopReport>>>,
    cancelled: bool,
}

impl StopConfirmation {
    /// Wait until the service finished stopping
    pub async fn wait(mut self) -> CaptureResult<StopReport> {
        match self.rx.take() {
            Some(rx) => rx.await.map_err(|_| CaptureError::ServiceGone)?,
            None => Err(CaptureError::InvalidState(
                "stop confirmation was cancelled".to_string(),
            )),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> CaptureResult<StopReport> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| CaptureError::Timeout(timeout.as_millis() as u64))?
    }

    /// Stop listening. The stop itself still completes and observers are still told.
    /// Cancelling again only logs.
    pub fn cancel(&mut self) -> bool {
        if self.cancelled {
            log::warn!("Stop confirmation cancelled twice");
            return false;
        }
        self.cancelled = true;
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
        true
    }
}
