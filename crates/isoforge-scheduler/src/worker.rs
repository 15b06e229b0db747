//! Background loops: launch recovery, ingestion, monitoring and retention.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::service::Scheduler;

/// Period of each background loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopIntervals {
    pub launch: Duration,
    pub ingest: Duration,
    pub monitor: Duration,
    pub retention: Duration,
}

/// Handles of the running loops. Dropping this does not stop them.
pub struct BackgroundLoops {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundLoops {
    pub fn spawn(scheduler: &Scheduler, intervals: LoopIntervals) -> Self {
        let launcher = scheduler.launcher.clone();
        let ingestor = scheduler.ingestor.clone();
        let monitor = scheduler.monitor.clone();
        let retention = scheduler.retention.clone();

        let handles = vec![
            tokio::spawn(run_periodic("launch", intervals.launch, move || {
                let launcher = launcher.clone();
                async move { launcher.launch_queued().await }
            })),
            tokio::spawn(run_periodic("ingest", intervals.ingest, move || {
                let ingestor = ingestor.clone();
                async move { ingestor.ingest_all(Utc::now()).await }
            })),
            tokio::spawn(run_periodic("monitor", intervals.monitor, move || {
                let monitor = monitor.clone();
                async move { monitor.sweep_at(Utc::now()).await.map(|failed| failed.len()) }
            })),
            tokio::spawn(run_periodic("retention", intervals.retention, move || {
                let retention = retention.clone();
                async move {
                    retention
                        .sweep_at(Utc::now())
                        .await
                        .map(|report| report.purged + report.recovered)
                }
            })),
        ];

        Self { handles }
    }

    /// Stop all loops.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Run `tick` every `period` until the task is aborted. Errors are logged
/// and the loop carries on.
async fn run_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = isoforge_core::Result<usize>>,
{
    info!(task = name, period_ms = period.as_millis() as u64, "Starting background loop");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match tick().await {
            Ok(0) => {}
            Ok(changed) => debug!(task = name, changed, "Background pass finished"),
            Err(e) => warn!(task = name, error = %e, "Background pass failed"),
        }
    }
}
