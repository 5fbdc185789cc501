//! Fuses fix status and raw readings into capture events.
//!
//! Hardware sources run on their own threads or tasks and push into a [`SampleSink`] or
//! [`FixSink`]. A single pump task owns the [`CaptureCore`] and turns those readings
//! into [`CaptureEvent`]s in arrival order, so downstream consumers see one serialized
//! stream regardless of how many sources feed it.

use crate::capture::fix_status::{FixSink, FixSource, FixStatusMachine, FixTransition};
use crate::capture::SourceEvent;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::model::{CapturedData, GeoLocation, Point3D};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Recent locations remembered for de-duplication across sources
const DEDUP_WINDOW: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    LocationCaptured(GeoLocation),
    DataCaptured(CapturedData),
    FixAcquired,
    FixLost,
    CaptureFailed(CaptureError),
}

/// Handle a raw sample source pushes readings through
#[derive(Clone)]
pub struct SampleSink {
    source: &'static str,
    tx: UnboundedSender<SourceEvent>,
}

impl SampleSink {
    pub(crate) fn new(source: &'static str, tx: UnboundedSender<SourceEvent>) -> Self {
        Self { source, tx }
    }

    /// Returns false once the capture process stopped listening
    pub fn location(&self, location: GeoLocation) -> bool {
        self.tx.send(SourceEvent::Location(location)).is_ok()
    }

    pub fn sample(&self, sample: Point3D) -> bool {
        self.tx.send(SourceEvent::Sample(sample)).is_ok()
    }

    /// Report that the capability went away, e.g. a revoked permission
    pub fn unavailable(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(SourceEvent::Unavailable {
                source: self.source.to_string(),
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// A producer of raw locations and 3-axis samples
pub trait SampleSource: Send {
    fn name(&self) -> &'static str;

    fn attach(&mut self, sink: SampleSink) -> CaptureResult<()>;

    /// Release the hardware subscription. Calling it while detached does nothing.
    fn detach(&mut self);
}

/// Synchronous capture state: fix tracking, de-duplication and sample buffering
pub struct CaptureCore {
    fix: FixStatusMachine,
    seen: HashSet<(i64, u64, u64)>,
    seen_order: VecDeque<(i64, u64, u64)>,
    buffer: CapturedData,
    flush_threshold: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl CaptureCore {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            fix: FixStatusMachine::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::with_capacity(DEDUP_WINDOW),
            buffer: CapturedData::default(),
            flush_threshold: config.flush_threshold.max(1),
            flush_interval: config.flush_interval(),
            last_flush: Instant::now(),
        }
    }

    pub(crate) fn handle(&mut self, event: SourceEvent, now: Instant) -> Vec<CaptureEvent> {
        match event {
            SourceEvent::FixAcquired => self.fix.on_fix_acquired().map(transition_event).into_iter().collect(),
            SourceEvent::FixLost => self.fix.on_fix_lost().map(transition_event).into_iter().collect(),
            SourceEvent::Location(location) => {
                if self.remember(&location) {
                    vec![CaptureEvent::LocationCaptured(location)]
                } else {
                    log::trace!("Dropped duplicate location at {}", location.timestamp_ms);
                    Vec::new()
                }
            }
            SourceEvent::Sample(sample) => {
                self.buffer.push(sample);
                if self.buffer.len() >= self.flush_threshold {
                    self.flush(now).into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            SourceEvent::Unavailable { source, reason } => {
                log::warn!("Capture source {} unavailable: {}", source, reason);
                vec![CaptureEvent::CaptureFailed(CaptureError::CapabilityUnavailable(
                    format!("{}: {}", source, reason),
                ))]
            }
        }
    }

    /// Flush if the buffering interval elapsed
    pub fn tick(&mut self, now: Instant) -> Option<CaptureEvent> {
        if now.duration_since(self.last_flush) >= self.flush_interval {
            self.flush(now)
        } else {
            None
        }
    }

    pub fn flush(&mut self, now: Instant) -> Option<CaptureEvent> {
        self.last_flush = now;
        if self.buffer.is_empty() {
            return None;
        }
        Some(CaptureEvent::DataCaptured(std::mem::take(&mut self.buffer)))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.fix.reset();
        self.seen.clear();
        self.seen_order.clear();
    }

    fn remember(&mut self, location: &GeoLocation) -> bool {
        let key = (location.timestamp_ms, location.lat.to_bits(), location.lon.to_bits());
        if !self.seen.insert(key) {
            return false;
        }
        self.seen_order.push_back(key);
        if self.seen_order.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

fn transition_event(transition: FixTransition) -> CaptureEvent {
    match transition {
        FixTransition::Acquired => CaptureEvent::FixAcquired,
        FixTransition::Lost => CaptureEvent::FixLost,
    }
}

/// A running capture: attached sources plus the pump task
pub struct CaptureProcess {
    fix_source: Box<dyn FixSource>,
    sample_sources: Vec<Box<dyn SampleSource>>,
    close_tx: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl CaptureProcess {
    /// Attach every source and start pumping. Fails if any source cannot attach,
    /// in which case nothing stays attached.
    pub fn start(
        config: &CaptureConfig,
        mut fix_source: Box<dyn FixSource>,
        mut sample_sources: Vec<Box<dyn SampleSource>>,
    ) -> CaptureResult<(Self, UnboundedReceiver<CaptureEvent>)> {
        let (source_tx, source_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        fix_source.attach(FixSink::new(source_tx.clone()))?;
        for index in 0..sample_sources.len() {
            let source = &mut sample_sources[index];
            let sink = SampleSink::new(source.name(), source_tx.clone());
            if let Err(e) = source.attach(sink) {
                log::warn!("Failed to attach {}: {}", source.name(), e);
                for attached in &mut sample_sources[..index] {
                    attached.detach();
                }
                fix_source.detach();
                return Err(e);
            }
        }
        drop(source_tx);

        let core = CaptureCore::new(config);
        let pump = tokio::spawn(pump(core, config.flush_interval(), source_rx, close_rx, event_tx));
        log::debug!(
            "Capture started with {} and {} sample sources",
            fix_source.name(),
            sample_sources.len()
        );

        Ok((
            Self {
                fix_source,
                sample_sources,
                close_tx: Some(close_tx),
                pump: Some(pump),
            },
            event_rx,
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.pump.is_none()
    }

    /// Detach all sources, flush buffered samples and wait for the pump to finish.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        for source in &mut self.sample_sources {
            source.detach();
        }
        self.fix_source.detach();
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Err(e) = pump.await {
            log::error!("Capture pump ended abnormally: {}", e);
        }
        log::debug!("Capture closed");
    }
}

async fn pump(
    mut core: CaptureCore,
    flush_interval: Duration,
    mut source_rx: UnboundedReceiver<SourceEvent>,
    mut close_rx: oneshot::Receiver<()>,
    event_tx: UnboundedSender<CaptureEvent>,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = source_rx.recv() => match event {
                Some(event) => {
                    for out in core.handle(event, Instant::now()) {
                        let _ = event_tx.send(out);
                    }
                }
                None => break,
            },
            now = ticker.tick() => {
                if let Some(out) = core.tick(now) {
                    let _ = event_tx.send(out);
                }
            }
            _ = &mut close_rx => break,
        }
    }

    // Readings already queued before the close still belong to this capture
    while let Ok(event) = source_rx.try_recv() {
        for out in core.handle(event, Instant::now()) {
            let _ = event_tx.send(out);
        }
    }
    if let Some(out) = core.flush(Instant::now()) {
        let _ = event_tx.send(out);
    }
    core.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PointKind;
    use std::sync::{Arc, Mutex};

    fn config(flush_threshold: usize) -> CaptureConfig {
        CaptureConfig {
            flush_threshold,
            flush_interval_ms: 60_000,
            ..CaptureConfig::default()
        }
    }

    fn accel(t: i64) -> Point3D {
        Point3D::new(PointKind::Acceleration, 0.0, 0.0, 9.81, t)
    }

    #[test]
    fn test_duplicate_location_is_forwarded_once() {
        let mut core = CaptureCore::new(&config(10));
        let location = GeoLocation::new(1_000, 51.0, 13.0, 1.0, 3.0);
        let now = Instant::now();

        let first = core.handle(SourceEvent::Location(location.clone()), now);
        let second = core.handle(SourceEvent::Location(location.clone()), now);
        let moved = core.handle(
            SourceEvent::Location(GeoLocation::new(1_000, 51.0, 13.1, 1.0, 3.0)),
            now,
        );

        assert_eq!(first, vec![CaptureEvent::LocationCaptured(location)]);
        assert!(second.is_empty());
        assert_eq!(moved.len(), 1);
    }

    #[test]
    fn test_samples_flush_at_threshold() {
        let mut core = CaptureCore::new(&config(3));
        let now = Instant::now();
        assert!(core.handle(SourceEvent::Sample(accel(1)), now).is_empty());
        assert!(core.handle(SourceEvent::Sample(accel(2)), now).is_empty());

        let flushed = core.handle(SourceEvent::Sample(accel(3)), now);
        match &flushed[..] {
            [CaptureEvent::DataCaptured(data)] => assert_eq!(data.accelerations.len(), 3),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(core.buffered(), 0);
    }

    #[test]
    fn test_samples_flush_after_interval() {
        let mut core = CaptureCore::new(&CaptureConfig {
            flush_interval_ms: 100,
            ..config(1_000)
        });
        let start = Instant::now();
        core.handle(SourceEvent::Sample(accel(1)), start);

        assert!(core.tick(start + Duration::from_millis(50)).is_none());
        assert!(matches!(
            core.tick(start + Duration::from_millis(150)),
            Some(CaptureEvent::DataCaptured(_))
        ));
    }

    #[test]
    fn test_fix_events_follow_transitions() {
        let mut core = CaptureCore::new(&config(10));
        let now = Instant::now();
        assert_eq!(core.handle(SourceEvent::FixAcquired, now), vec![CaptureEvent::FixAcquired]);
        assert!(core.handle(SourceEvent::FixAcquired, now).is_empty());
        assert_eq!(core.handle(SourceEvent::FixLost, now), vec![CaptureEvent::FixLost]);
    }

    #[test]
    fn test_unavailable_source_becomes_failure_event() {
        let mut core = CaptureCore::new(&config(10));
        let events = core.handle(
            SourceEvent::Unavailable {
                source: "gyroscope".to_string(),
                reason: "permission revoked".to_string(),
            },
            Instant::now(),
        );
        assert!(matches!(
            &events[..],
            [CaptureEvent::CaptureFailed(CaptureError::CapabilityUnavailable(_))]
        ));
    }

    /// Source that hands its sink to the test so readings can be injected directly
    struct ManualSource {
        sink: Arc<Mutex<Option<SampleSink>>>,
        detached: Arc<Mutex<usize>>,
        fail_attach: bool,
    }

    impl SampleSource for ManualSource {
        fn name(&self) -> &'static str {
            "manual"
        }

        fn attach(&mut self, sink: SampleSink) -> CaptureResult<()> {
            if self.fail_attach {
                return Err(CaptureError::CapabilityUnavailable("manual".to_string()));
            }
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn detach(&mut self) {
            self.sink.lock().unwrap().take();
            *self.detached.lock().unwrap() += 1;
        }
    }

    struct NoFix;

    impl FixSource for NoFix {
        fn name(&self) -> &'static str {
            "none"
        }
        fn is_supported(&self) -> bool {
            true
        }
        fn attach(&mut self, _sink: FixSink) -> CaptureResult<()> {
            Ok(())
        }
        fn detach(&mut self) {}
    }

    fn manual(fail_attach: bool) -> (ManualSource, Arc<Mutex<Option<SampleSink>>>, Arc<Mutex<usize>>) {
        let sink = Arc::new(Mutex::new(None));
        let detached = Arc::new(Mutex::new(0));
        (
            ManualSource {
                sink: sink.clone(),
                detached: detached.clone(),
                fail_attach,
            },
            sink,
            detached,
        )
    }

    #[tokio::test]
    async fn test_close_flushes_buffered_samples_and_is_idempotent() {
        let (source, sink, detached) = manual(false);
        let (mut process, mut events) =
            CaptureProcess::start(&config(1_000), Box::new(NoFix), vec![Box::new(source)]).unwrap();

        {
            let guard = sink.lock().unwrap();
            let sink = guard.as_ref().unwrap();
            assert!(sink.sample(accel(1)));
            assert!(sink.sample(accel(2)));
        }

        process.close().await;
        process.close().await;

        assert!(process.is_closed());
        assert_eq!(*detached.lock().unwrap(), 1);
        match events.recv().await {
            Some(CaptureEvent::DataCaptured(data)) => assert_eq!(data.len(), 2),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_attach_detaches_earlier_sources() {
        let (good, _, good_detached) = manual(false);
        let (bad, _, _) = manual(true);

        let result = CaptureProcess::start(
            &config(10),
            Box::new(NoFix),
            vec![Box::new(good), Box::new(bad)],
        );

        assert!(matches!(result, Err(CaptureError::CapabilityUnavailable(_))));
        assert_eq!(*good_detached.lock().unwrap(), 1);
    }
}
