use crate::capture::{
    select_fix_source, FixSource, LocationTimeoutFix, SampleSink, SampleSource,
    SatelliteFixSource, SatelliteStatus,
};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::model::{GeoLocation, Point3D, PointKind};
use crate::orchestrator::HardwareProvider;
use crossbeam::channel::{self, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub sample_interval_ms: u64,
    pub gps_interval_ms: u64,
    pub gyroscope: bool,
    /// Satellites reported per GPS tick; `None` simulates a device without a satellite feed
    pub satellites: Option<u32>,
    pub start_lat: f64,
    pub start_lon: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 20, // ~50Hz
            gps_interval_ms: 1_000,
            gyroscope: true,
            satellites: Some(7),
            start_lat: 51.0504,
            start_lon: 13.7373,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn spawn_on_runtime<F>(name: &str, task: F) -> CaptureResult<JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        CaptureError::CapabilityUnavailable(format!("{} needs a running tokio runtime", name))
    })?;
    Ok(handle.spawn(task))
}

/// Accelerometer, gyroscope and magnetometer at a fixed rate
pub struct MotionSensors {
    interval: Duration,
    gyroscope: bool,
    task: Option<JoinHandle<()>>,
}

impl MotionSensors {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.sample_interval_ms.max(1)),
            gyroscope: config.gyroscope,
            task: None,
        }
    }
}

impl SampleSource for MotionSensors {
    fn name(&self) -> &'static str {
        "motion-sensors"
    }

    fn attach(&mut self, sink: SampleSink) -> CaptureResult<()> {
        if self.task.is_some() {
            return Err(CaptureError::InvalidState("motion sensors already attached".to_string()));
        }
        let task = motion_loop(sink, self.interval, self.gyroscope);
        self.task = Some(spawn_on_runtime(self.name(), task)?);
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn motion_loop(sink: SampleSink, period: Duration, gyroscope: bool) {
    let mut ticker = interval(period);
    let mut seq = 0u64;

    loop {
        ticker.tick().await;
        let t = seq as f64 * period.as_secs_f64();
        let timestamp = now_ms();

        let mut delivered = sink.sample(mock_acceleration(t, timestamp));
        if gyroscope {
            delivered &= sink.sample(mock_rotation(t, timestamp));
        }
        delivered &= sink.sample(mock_direction(t, timestamp));
        if !delivered {
            log::debug!("[motion] Capture closed after {} ticks", seq);
            break;
        }

        seq += 1;
        if seq % 500 == 0 {
            log::trace!("[motion] {} ticks", seq);
        }
    }
}

fn mock_acceleration(t: f64, timestamp: i64) -> Point3D {
    Point3D::new(
        PointKind::Acceleration,
        (t * 2.0 * PI).sin() * 0.5,
        (t * 2.0 * PI).cos() * 0.3,
        9.81 + (t * PI).sin() * 0.1,
        timestamp,
    )
}

fn mock_rotation(t: f64, timestamp: i64) -> Point3D {
    Point3D::new(
        PointKind::Rotation,
        (t * 0.5).sin() * 0.05,
        (t * 0.3).cos() * 0.03,
        t.sin() * 0.1,
        timestamp,
    )
}

fn mock_direction(t: f64, timestamp: i64) -> Point3D {
    // Earth field of roughly 48 µT, slowly turning
    let heading = t * 0.1;
    Point3D::new(
        PointKind::Direction,
        heading.cos() * 20.0,
        heading.sin() * 20.0,
        -43.0,
        timestamp,
    )
}

/// Position receiver that also drives the fix feeds
pub struct GpsReceiver {
    interval: Duration,
    start: (f64, f64),
    satellites: Option<(u32, Sender<SatelliteStatus>)>,
    location_ticks: Option<Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl GpsReceiver {
    pub fn new(
        config: &SimulationConfig,
        satellite_feed: Option<Sender<SatelliteStatus>>,
        location_ticks: Option<Sender<()>>,
    ) -> Self {
        Self {
            interval: Duration::from_millis(config.gps_interval_ms.max(1)),
            start: (config.start_lat, config.start_lon),
            satellites: config.satellites.zip(satellite_feed),
            location_ticks,
            task: None,
        }
    }
}

impl SampleSource for GpsReceiver {
    fn name(&self) -> &'static str {
        "gps"
    }

    fn attach(&mut self, sink: SampleSink) -> CaptureResult<()> {
        if self.task.is_some() {
            return Err(CaptureError::InvalidState("gps already attached".to_string()));
        }
        let task = gps_loop(
            sink,
            self.interval,
            self.start,
            self.satellites.clone(),
            self.location_ticks.clone(),
        );
        self.task = Some(spawn_on_runtime(self.name(), task)?);
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn gps_loop(
    sink: SampleSink,
    period: Duration,
    start: (f64, f64),
    satellites: Option<(u32, Sender<SatelliteStatus>)>,
    location_ticks: Option<Sender<()>>,
) {
    let mut ticker = interval(period);
    let mut fixes = 0u64;

    loop {
        ticker.tick().await;

        if let Some((count, feed)) = &satellites {
            let status = SatelliteStatus {
                visible: count + 3,
                used_in_fix: *count,
            };
            if let Err(TrySendError::Disconnected(_)) = feed.try_send(status) {
                log::debug!("[gps] Satellite feed closed");
            }
        }

        if !sink.location(mock_location(start, fixes, now_ms())) {
            log::debug!("[gps] Capture closed after {} fixes", fixes);
            break;
        }
        if let Some(ticks) = &location_ticks {
            // Full means the fix source already knows a reading arrived
            let _ = ticks.try_send(());
        }
        fixes += 1;
    }
}

fn mock_location(start: (f64, f64), seq: u64, timestamp: i64) -> GeoLocation {
    let seq = seq as f64;
    GeoLocation::new(
        timestamp,
        start.0 + seq * 0.00001,
        start.1 + seq * 0.00001,
        10.0 + (seq * 0.5).sin() * 5.0,
        5.0 + (seq * 0.1).sin() * 2.0,
    )
}

/// Hardware provider backed by mock sensor loops
pub struct SimulatedHardware {
    simulation: SimulationConfig,
    min_satellites: u32,
    location_fix_timeout: Duration,
    pending_feeds: Option<(Sender<SatelliteStatus>, Sender<()>)>,
}

impl SimulatedHardware {
    pub fn new(simulation: SimulationConfig, capture: &CaptureConfig) -> Self {
        Self {
            simulation,
            min_satellites: capture.min_satellites_for_fix,
            location_fix_timeout: Duration::from_millis(capture.location_fix_timeout_ms),
            pending_feeds: None,
        }
    }
}

impl HardwareProvider for SimulatedHardware {
    fn fix_source(&mut self) -> CaptureResult<Box<dyn FixSource>> {
        let (satellite_tx, satellite_rx) = channel::bounded(16);
        let (tick_tx, tick_rx) = channel::bounded(1);
        self.pending_feeds = Some((satellite_tx, tick_tx));

        let satellite_feed = self.simulation.satellites.map(|_| satellite_rx);
        let candidates: Vec<Box<dyn FixSource>> = vec![
            Box::new(SatelliteFixSource::new(satellite_feed, self.min_satellites)),
            Box::new(LocationTimeoutFix::new(Some(tick_rx), self.location_fix_timeout)),
        ];
        select_fix_source(candidates)
            .ok_or_else(|| CaptureError::CapabilityUnavailable("no fix source".to_string()))
    }

    fn sample_sources(&mut self) -> CaptureResult<Vec<Box<dyn SampleSource>>> {
        let (satellite_tx, tick_tx) = match self.pending_feeds.take() {
            Some((satellites, ticks)) => (Some(satellites), Some(ticks)),
            None => (None, None),
        };
        Ok(vec![
            Box::new(MotionSensors::new(&self.simulation)),
            Box::new(GpsReceiver::new(&self.simulation, satellite_tx, tick_tx)),
        ])
    }
}
