use crate::sync::engine::{ProgressListener, SyncEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs sync cycles periodically, independent of any capture session
pub struct SyncScheduler {
    trigger: Arc<Notify>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl SyncScheduler {
    /// First cycle runs immediately, then once per `interval`
    pub fn spawn(
        engine: Arc<SyncEngine>,
        account: String,
        interval: Duration,
        progress: ProgressListener,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let (shutdown, mut stopped) = oneshot::channel();
        let wake = trigger.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut cycles = 0u64;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                    _ = &mut stopped => break,
                }

                cycles += 1;
                match engine.run_cycle(&account, progress.clone()).await {
                    Ok(report) if report.is_complete() => {
                        log::info!("Sync cycle {} synced {} measurements", cycles, report.synced.len())
                    }
                    Ok(report) => log::warn!(
                        "Sync cycle {} synced {} measurements before stopping",
                        cycles,
                        report.synced.len()
                    ),
                    Err(e) => log::warn!("Sync cycle {} did not run: {}", cycles, e),
                }
            }
            cycles
        });

        Self {
            trigger,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Run a cycle now instead of waiting for the next tick
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop after the running cycle, if any; returns the number of cycles run
    pub async fn shutdown(mut self) -> u64 {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.await {
            Ok(cycles) => cycles,
            Err(e) => {
                log::error!("Sync scheduler task failed: {}", e);
                0
            }
        }
    }
}
