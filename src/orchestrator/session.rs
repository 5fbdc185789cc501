use crate::error::{CaptureError, CaptureResult};
use crate::model::MeasurementId;
use serde::{Deserialize, Serialize};

/// Capture session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No measurement attached
    Idle,
    /// Measurement validated, hardware being attached
    Starting,
    Running,
    /// Hardware detached, measurement still open
    Paused,
    /// Flushing and finalizing
    Stopping,
}

/// Counters of one capture session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub locations_captured: u64,
    pub samples_captured: u64,
    pub chunks_delivered: u64,
    /// Records (a location or a chunk of samples) that could not be stored
    pub persistence_failures: u64,
    pub capture_failures: u64,
}

/// Session lifecycle bookkeeping
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    measurement: Option<MeasurementId>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            measurement: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn measurement(&self) -> Option<MeasurementId> {
        self.measurement
    }

    /// Idle → Starting
    pub fn begin_start(&mut self, id: MeasurementId) -> CaptureResult<()> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::Starting;
                self.measurement = Some(id);
                Ok(())
            }
            other => Err(invalid("start", other)),
        }
    }

    /// Starting → Running
    pub fn confirm_start(&mut self) -> CaptureResult<MeasurementId> {
        match (self.state, self.measurement) {
            (SessionState::Starting, Some(id)) => {
                self.state = SessionState::Running;
                Ok(id)
            }
            (other, _) => Err(invalid("confirm start", other)),
        }
    }

    /// Starting → Idle, after attaching failed
    pub fn abort_start(&mut self) {
        if self.state == SessionState::Starting {
            self.state = SessionState::Idle;
            self.measurement = None;
        }
    }

    /// Running → Paused
    pub fn pause(&mut self) -> CaptureResult<MeasurementId> {
        match (self.state, self.measurement) {
            (SessionState::Running, Some(id)) => {
                self.state = SessionState::Paused;
                Ok(id)
            }
            (other, _) => Err(invalid("pause", other)),
        }
    }

    /// Paused → Running
    pub fn resume(&mut self) -> CaptureResult<MeasurementId> {
        match (self.state, self.measurement) {
            (SessionState::Paused, Some(id)) => {
                self.state = SessionState::Running;
                Ok(id)
            }
            (other, _) => Err(invalid("resume", other)),
        }
    }

    /// Running | Paused → Stopping
    pub fn begin_stop(&mut self) -> CaptureResult<MeasurementId> {
        match (self.state, self.measurement) {
            (SessionState::Running | SessionState::Paused, Some(id)) => {
                self.state = SessionState::Stopping;
                Ok(id)
            }
            (other, _) => Err(invalid("stop", other)),
        }
    }

    /// Stopping → Idle
    pub fn finish_stop(&mut self) {
        if self.state == SessionState::Stopping {
            self.state = SessionState::Idle;
            self.measurement = None;
        }
    }

    /// A measurement is attached and has to be finished before the service exits
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Paused)
    }
}

fn invalid(action: &str, state: SessionState) -> CaptureError {
    CaptureError::InvalidState(format!("cannot {} while {:?}", action, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut session = Session::new();
        let id = MeasurementId(4);

        session.begin_start(id).unwrap();
        assert_eq!(session.state(), SessionState::Starting);
        assert_eq!(session.confirm_start().unwrap(), id);
        assert!(session.is_active());

        session.pause().unwrap();
        assert_eq!(session.state(), SessionState::Paused);
        assert!(session.is_active());
        session.resume().unwrap();

        assert_eq!(session.begin_stop().unwrap(), id);
        assert!(!session.is_active());
        session.finish_stop();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.measurement(), None);
    }

    #[test]
    fn test_stop_from_paused() {
        let mut session = Session::new();
        session.begin_start(MeasurementId(1)).unwrap();
        session.confirm_start().unwrap();
        session.pause().unwrap();
        assert!(session.begin_stop().is_ok());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut session = Session::new();
        assert!(matches!(session.pause(), Err(CaptureError::InvalidState(_))));
        assert!(matches!(session.resume(), Err(CaptureError::InvalidState(_))));
        assert!(matches!(session.begin_stop(), Err(CaptureError::InvalidState(_))));

        session.begin_start(MeasurementId(1)).unwrap();
        assert!(session.begin_start(MeasurementId(2)).is_err());
        assert!(session.pause().is_err());
        session.confirm_start().unwrap();
        assert!(session.resume().is_err());
    }

    #[test]
    fn test_abort_start_returns_to_idle() {
        let mut session = Session::new();
        session.begin_start(MeasurementId(1)).unwrap();
        session.abort_start();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.begin_start(MeasurementId(2)).is_ok());
    }
}
