//! Periodic training and detection.
//!
//! Two independent timers: a full training pass every
//! `training_interval_minutes` and a detection pass every
//! `detection_interval_minutes`. A pass always runs to completion; shutdown
//! only stops further ticks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    jobs: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for any in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for job in self.jobs {
            if let Err(e) = job.await {
                warn!(error = %e, "scheduler job ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

pub fn start(orchestrator: Arc<Orchestrator>) -> SchedulerHandle {
    let training_every = Duration::from_secs(orchestrator.config().training_interval_minutes * 60);
    let detection_every = Duration::from_secs(orchestrator.config().detection_interval_minutes * 60);
    let (shutdown, rx) = watch::channel(false);

    let trainer = Arc::clone(&orchestrator);
    let training = spawn_job("training", training_every, rx.clone(), move || {
        let orchestrator = Arc::clone(&trainer);
        async move {
            orchestrator.train_all().await;
        }
    });

    let detector = orchestrator;
    let detection = spawn_job("detection", detection_every, rx, move || {
        let orchestrator = Arc::clone(&detector);
        async move {
            orchestrator.detect_all(None).await;
        }
    });

    info!(?training_every, ?detection_every, "scheduler started");
    SchedulerHandle {
        shutdown,
        jobs: vec![training, detection],
    }
}

/// Run `pass` every `period`, starting one period from now. Ticks that fall
/// due while a pass is still running are skipped, not queued.
pub(crate) fn spawn_job<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    pass: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            tracing::debug!(job = name, "scheduled pass starting");
            pass().await;
        }
        tracing::debug!(job = name, "job loop exited");
    })
}
