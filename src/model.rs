use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one capture session, assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementId(pub u64);

impl fmt::Display for MeasurementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Modality the measurement was captured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vehicle {
    Bicycle,
    Car,
    Motorbike,
    Bus,
    Train,
    Walking,
    Unknown,
}

impl Vehicle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vehicle::Bicycle => "BICYCLE",
            Vehicle::Car => "CAR",
            Vehicle::Motorbike => "MOTORBIKE",
            Vehicle::Bus => "BUS",
            Vehicle::Train => "TRAIN",
            Vehicle::Walking => "WALKING",
            Vehicle::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Vehicle {
        match value {
            "BICYCLE" => Vehicle::Bicycle,
            "CAR" => Vehicle::Car,
            "MOTORBIKE" => Vehicle::Motorbike,
            "BUS" => Vehicle::Bus,
            "TRAIN" => Vehicle::Train,
            "WALKING" => Vehicle::Walking,
            _ => Vehicle::Unknown,
        }
    }
}

/// Measurement lifecycle. Ordered: a measurement only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementStatus {
    Open,
    Finished,
    Synced,
}

impl MeasurementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementStatus::Open => "OPEN",
            MeasurementStatus::Finished => "FINISHED",
            MeasurementStatus::Synced => "SYNCED",
        }
    }

    pub fn parse(value: &str) -> Option<MeasurementStatus> {
        match value {
            "OPEN" => Some(MeasurementStatus::Open),
            "FINISHED" => Some(MeasurementStatus::Finished),
            "SYNCED" => Some(MeasurementStatus::Synced),
            _ => None,
        }
    }

    /// Setting the current status again is allowed and has no effect
    pub fn can_transition_to(&self, next: MeasurementStatus) -> bool {
        next >= *self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: MeasurementId,
    pub vehicle: Vehicle,
    pub status: MeasurementStatus,
    pub device_id: Option<String>,
}

/// One position fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    /// Metres per second
    pub speed: f64,
    /// Metres
    pub accuracy: f64,
}

impl GeoLocation {
    pub fn new(timestamp_ms: i64, lat: f64, lon: f64, speed: f64, accuracy: f64) -> Self {
        Self {
            timestamp_ms,
            lat,
            lon,
            speed,
            accuracy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    Acceleration,
    Rotation,
    Direction,
}

impl PointKind {
    pub const ALL: [PointKind; 3] = [
        PointKind::Acceleration,
        PointKind::Rotation,
        PointKind::Direction,
    ];
}

/// One 3-axis sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub kind: PointKind,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp_ms: i64,
}

impl Point3D {
    pub fn new(kind: PointKind, x: f64, y: f64, z: f64, timestamp_ms: i64) -> Self {
        Self {
            kind,
            x,
            y,
            z,
            timestamp_ms,
        }
    }
}

/// A bounded group of samples produced together. Never stored as its own entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedData {
    pub accelerations: Vec<Point3D>,
    pub rotations: Vec<Point3D>,
    pub directions: Vec<Point3D>,
}

impl CapturedData {
    pub fn new(accelerations: Vec<Point3D>, rotations: Vec<Point3D>, directions: Vec<Point3D>) -> Self {
        Self {
            accelerations,
            rotations,
            directions,
        }
    }

    /// Bucket mixed samples by kind, keeping their relative order
    pub fn from_samples(samples: impl IntoIterator<Item = Point3D>) -> Self {
        let mut data = CapturedData::default();
        for sample in samples {
            data.push(sample);
        }
        data
    }

    pub fn push(&mut self, sample: Point3D) {
        match sample.kind {
            PointKind::Acceleration => self.accelerations.push(sample),
            PointKind::Rotation => self.rotations.push(sample),
            PointKind::Direction => self.directions.push(sample),
        }
    }

    pub fn of_kind(&self, kind: PointKind) -> &[Point3D] {
        match kind {
            PointKind::Acceleration => &self.accelerations,
            PointKind::Rotation => &self.rotations,
            PointKind::Direction => &self.directions,
        }
    }

    /// Combined sample count across all three kinds
    pub fn len(&self) -> usize {
        self.accelerations.len() + self.rotations.len() + self.directions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All samples in kind order: accelerations, then rotations, then directions
    pub fn iter(&self) -> impl Iterator<Item = &Point3D> {
        self.accelerations
            .iter()
            .chain(self.rotations.iter())
            .chain(self.directions.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_monotonic() {
        assert!(MeasurementStatus::Open.can_transition_to(MeasurementStatus::Finished));
        assert!(MeasurementStatus::Finished.can_transition_to(MeasurementStatus::Synced));
        assert!(MeasurementStatus::Finished.can_transition_to(MeasurementStatus::Finished));
        assert!(!MeasurementStatus::Synced.can_transition_to(MeasurementStatus::Finished));
        assert!(!MeasurementStatus::Synced.can_transition_to(MeasurementStatus::Open));
    }

    #[test]
    fn test_captured_data_buckets_by_kind() {
        let data = CapturedData::from_samples(vec![
            Point3D::new(PointKind::Rotation, 0.1, 0.2, 0.3, 1),
            Point3D::new(PointKind::Acceleration, 1.0, 2.0, 3.0, 2),
            Point3D::new(PointKind::Rotation, 0.4, 0.5, 0.6, 3),
        ]);

        assert_eq!(data.len(), 3);
        assert_eq!(data.accelerations.len(), 1);
        assert_eq!(data.rotations[1].timestamp_ms, 3);
        assert!(data.directions.is_empty());
    }

    #[test]
    fn test_vehicle_round_trips_through_column_value() {
        assert_eq!(Vehicle::parse(Vehicle::Bicycle.as_str()), Vehicle::Bicycle);
        assert_eq!(Vehicle::parse("SKATEBOARD"), Vehicle::Unknown);
    }
}
