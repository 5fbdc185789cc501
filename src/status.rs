use crate::model::MeasurementId;
use crate::orchestrator::{ServiceStatus, SessionState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Snapshot of the capture service written for external dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub timestamp: String,
    pub state: SessionState,
    pub measurement_id: Option<MeasurementId>,
    pub uptime_seconds: u64,
    pub locations_captured: u64,
    pub samples_captured: u64,
    pub chunks_delivered: u64,
    pub persistence_failures: u64,
    pub capture_failures: u64,
}

impl CaptureStatus {
    pub fn from_service(status: &ServiceStatus, uptime_seconds: u64) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            state: status.state,
            measurement_id: status.measurement_id,
            uptime_seconds,
            locations_captured: status.stats.locations_captured,
            samples_captured: status.stats.samples_captured,
            chunks_delivered: status.stats.chunks_delivered,
            persistence_failures: status.stats.persistence_failures,
            capture_failures: status.stats.capture_failures,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.persistence_failures == 0 && self.capture_failures == 0
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SessionStats;

    #[test]
    fn test_status_snapshot_saves_as_json() {
        let service = ServiceStatus {
            state: SessionState::Running,
            measurement_id: Some(MeasurementId(4)),
            stats: SessionStats {
                samples_captured: 900,
                chunks_delivered: 3,
                ..SessionStats::default()
            },
        };
        let status = CaptureStatus::from_service(&service, 12);
        assert!(status.is_healthy());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        status.save(&path).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["state"], "Running");
        assert_eq!(saved["measurement_id"], 4);
        assert_eq!(saved["samples_captured"], 900);
        assert_eq!(saved["uptime_seconds"], 12);
    }

    #[test]
    fn test_failures_mark_status_unhealthy() {
        let service = ServiceStatus {
            state: SessionState::Running,
            measurement_id: Some(MeasurementId(1)),
            stats: SessionStats {
                persistence_failures: 1,
                ..SessionStats::default()
            },
        };
        assert!(!CaptureStatus::from_service(&service, 1).is_healthy());
    }
}
