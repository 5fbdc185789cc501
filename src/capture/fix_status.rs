use crate::capture::SourceEvent;
use crate::error::{CaptureError, CaptureResult};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Position fix availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixState {
    NoFix,
    Fix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixTransition {
    Acquired,
    Lost,
}

/// Two-state fix tracker that only reports actual changes
#[derive(Debug)]
pub struct FixStatusMachine {
    state: FixState,
}

impl Default for FixStatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FixStatusMachine {
    pub fn new() -> Self {
        Self {
            state: FixState::NoFix,
        }
    }

    pub fn state(&self) -> FixState {
        self.state
    }

    pub fn on_fix_acquired(&mut self) -> Option<FixTransition> {
        match self.state {
            FixState::NoFix => {
                self.state = FixState::Fix;
                Some(FixTransition::Acquired)
            }
            FixState::Fix => None,
        }
    }

    pub fn on_fix_lost(&mut self) -> Option<FixTransition> {
        match self.state {
            FixState::Fix => {
                self.state = FixState::NoFix;
                Some(FixTransition::Lost)
            }
            FixState::NoFix => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = FixState::NoFix;
    }
}

/// Handle a fix source reports through. It can signal nothing but acquired and lost.
#[derive(Clone)]
pub struct FixSink {
    tx: UnboundedSender<SourceEvent>,
}

impl FixSink {
    pub(crate) fn new(tx: UnboundedSender<SourceEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the capture process stopped listening
    pub fn acquired(&self) -> bool {
        self.tx.send(SourceEvent::FixAcquired).is_ok()
    }

    pub fn lost(&self) -> bool {
        self.tx.send(SourceEvent::FixLost).is_ok()
    }
}

/// A way of observing whether a position fix is available
pub trait FixSource: Send {
    fn name(&self) -> &'static str;

    /// Runtime check whether this source can work on the current device
    fn is_supported(&self) -> bool;

    fn attach(&mut self, sink: FixSink) -> CaptureResult<()>;

    /// Stop reporting. Calling it while detached does nothing.
    fn detach(&mut self);
}

/// First candidate that reports itself supported
pub fn select_fix_source(candidates: Vec<Box<dyn FixSource>>) -> Option<Box<dyn FixSource>> {
    let selected = candidates.into_iter().find(|source| source.is_supported());
    match &selected {
        Some(source) => log::debug!("Selected fix source {}", source.name()),
        None => log::warn!("No supported fix source"),
    }
    selected
}

/// One report of a satellite-status feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteStatus {
    pub visible: u32,
    pub used_in_fix: u32,
}

/// Worker thread bound to a stop channel; dropping the sender wakes it
struct Watcher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Watcher {
    fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            log::error!("Fix watcher thread panicked");
        }
    }
}

/// Fix while enough satellites contribute to the position solution
pub struct SatelliteFixSource {
    feed: Option<Receiver<SatelliteStatus>>,
    min_satellites: u32,
    watcher: Option<Watcher>,
}

impl SatelliteFixSource {
    pub fn new(feed: Option<Receiver<SatelliteStatus>>, min_satellites: u32) -> Self {
        Self {
            feed,
            min_satellites,
            watcher: None,
        }
    }
}

impl FixSource for SatelliteFixSource {
    fn name(&self) -> &'static str {
        "satellite-status"
    }

    fn is_supported(&self) -> bool {
        self.feed.is_some()
    }

    fn attach(&mut self, sink: FixSink) -> CaptureResult<()> {
        if self.watcher.is_some() {
            return Err(CaptureError::InvalidState(
                "satellite fix source already attached".to_string(),
            ));
        }
        let feed = self.feed.clone().ok_or_else(|| {
            CaptureError::CapabilityUnavailable("no satellite status feed".to_string())
        })?;
        let min_satellites = self.min_satellites;
        let (stop, stopped) = channel::bounded::<()>(0);

        let handle = std::thread::spawn(move || loop {
            channel::select! {
                recv(feed) -> status => {
                    let Ok(status) = status else { break };
                    let delivered = if status.used_in_fix >= min_satellites {
                        sink.acquired()
                    } else {
                        sink.lost()
                    };
                    if !delivered {
                        break;
                    }
                }
                recv(stopped) -> _ => break,
            }
        });

        self.watcher = Some(Watcher { stop, handle });
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

/// Fix while location readings keep arriving, for devices without a satellite feed
pub struct LocationTimeoutFix {
    feed: Option<Receiver<()>>,
    timeout: Duration,
    watcher: Option<Watcher>,
}

impl LocationTimeoutFix {
    /// `feed` receives one message per location reading
    pub fn new(feed: Option<Receiver<()>>, timeout: Duration) -> Self {
        Self {
            feed,
            timeout,
            watcher: None,
        }
    }
}

impl FixSource for LocationTimeoutFix {
    fn name(&self) -> &'static str {
        "location-timeout"
    }

    fn is_supported(&self) -> bool {
        self.feed.is_some()
    }

    fn attach(&mut self, sink: FixSink) -> CaptureResult<()> {
        if self.watcher.is_some() {
            return Err(CaptureError::InvalidState(
                "location fix source already attached".to_string(),
            ));
        }
        let feed = self.feed.clone().ok_or_else(|| {
            CaptureError::CapabilityUnavailable("no location feed".to_string())
        })?;
        let timeout = self.timeout;
        let (stop, stopped) = channel::bounded::<()>(0);

        let handle = std::thread::spawn(move || {
            let mut has_fix = false;
            loop {
                channel::select! {
                    recv(feed) -> reading => {
                        if reading.is_err() || !sink.acquired() {
                            break;
                        }
                        has_fix = true;
                    }
                    recv(stopped) -> _ => break,
                    default(timeout) => {
                        if has_fix && !sink.lost() {
                            break;
                        }
                        has_fix = false;
                    }
                }
            }
        });

        self.watcher = Some(Watcher { stop, handle });
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_machine_emits_only_on_change() {
        let mut machine = FixStatusMachine::new();
        assert_eq!(machine.state(), FixState::NoFix);
        assert_eq!(machine.on_fix_lost(), None);
        assert_eq!(machine.on_fix_acquired(), Some(FixTransition::Acquired));
        assert_eq!(machine.on_fix_acquired(), None);
        assert_eq!(machine.on_fix_lost(), Some(FixTransition::Lost));
        assert_eq!(machine.on_fix_lost(), None);
    }

    #[test]
    fn test_reset_returns_to_no_fix() {
        let mut machine = FixStatusMachine::new();
        machine.on_fix_acquired();
        machine.reset();
        assert_eq!(machine.state(), FixState::NoFix);
        assert_eq!(machine.on_fix_acquired(), Some(FixTransition::Acquired));
    }

    #[test]
    fn test_selection_checks_support_at_runtime() {
        let (_location_tx, location_rx) = channel::unbounded();
        let candidates: Vec<Box<dyn FixSource>> = vec![
            Box::new(SatelliteFixSource::new(None, 4)),
            Box::new(LocationTimeoutFix::new(Some(location_rx), Duration::from_secs(2))),
        ];

        let selected = select_fix_source(candidates).unwrap();
        assert_eq!(selected.name(), "location-timeout");
        assert!(select_fix_source(vec![Box::new(SatelliteFixSource::new(None, 4))]).is_none());
    }

    #[test]
    fn test_unsupported_source_refuses_attach() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut source = SatelliteFixSource::new(None, 4);
        let err = source.attach(FixSink::new(tx)).unwrap_err();
        assert!(matches!(err, CaptureError::CapabilityUnavailable(_)));
    }

    #[test]
    fn test_satellite_source_reports_threshold_crossings() {
        let (feed_tx, feed_rx) = channel::unbounded();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = SatelliteFixSource::new(Some(feed_rx), 4);
        source.attach(FixSink::new(tx)).unwrap();

        feed_tx.send(SatelliteStatus { visible: 9, used_in_fix: 5 }).unwrap();
        feed_tx.send(SatelliteStatus { visible: 9, used_in_fix: 2 }).unwrap();

        assert!(matches!(rx.blocking_recv(), Some(SourceEvent::FixAcquired)));
        assert!(matches!(rx.blocking_recv(), Some(SourceEvent::FixLost)));

        source.detach();
        source.detach();
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn test_location_source_loses_fix_after_silence() {
        let (feed_tx, feed_rx) = channel::unbounded();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = LocationTimeoutFix::new(Some(feed_rx), Duration::from_millis(20));
        feed_tx.send(()).unwrap();
        source.attach(FixSink::new(tx)).unwrap();

        assert!(matches!(rx.blocking_recv(), Some(SourceEvent::FixAcquired)));
        assert!(matches!(rx.blocking_recv(), Some(SourceEvent::FixLost)));

        source.detach();
    }
}
