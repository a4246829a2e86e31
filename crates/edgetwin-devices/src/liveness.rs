//! Liveness monitor - marks silent devices offline
//!
//! A background tokio task that periodically asks the twin service which
//! collecting devices have gone quiet and feeds them a liveness timeout.

use std::sync::Arc;
use std::time::Duration;

use edgetwin_core::config::LivenessSettings;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::service::TwinService;

/// Periodic offline detection for a [`TwinService`].
#[derive(Clone)]
pub struct LivenessMonitor {
    service: Arc<TwinService>,
    check_interval: Duration,
    /// Offline window in milliseconds, matching twin timestamps
    offline_timeout_ms: i64,
}

impl LivenessMonitor {
    pub fn new(service: Arc<TwinService>, check_interval: Duration, offline_timeout: Duration) -> Self {
        Self {
            service,
            check_interval,
            offline_timeout_ms: i64::try_from(offline_timeout.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn from_settings(service: Arc<TwinService>, settings: &LivenessSettings) -> Self {
        Self {
            service,
            check_interval: settings.check_interval(),
            offline_timeout_ms: settings.offline_timeout_millis(),
        }
    }

    /// One sweep: mark every silent device offline and return their ids.
    pub fn check_once(&self) -> Vec<String> {
        let now = edgetwin_core::now_millis();
        let stale = self.service.stale_devices(now, self.offline_timeout_ms);

        let mut marked = Vec::with_capacity(stale.len());
        for device_id in stale {
            match self.service.mark_offline(&device_id) {
                Ok(t) if t.changed() => marked.push(device_id),
                Ok(_) => {}
                // Removed between the sweep and the mark
                Err(e) => tracing::debug!(device_id = %device_id, error = %e, "Liveness mark skipped"),
            }
        }
        marked
    }

    /// Run sweeps on the current tokio runtime until stopped.
    pub fn spawn(self) -> LivenessHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tracing::info!(
            interval_ms = self.check_interval.as_millis() as u64,
            timeout_ms = self.offline_timeout_ms,
            "Starting liveness monitor"
        );

        let task = tokio::spawn(async move {
            let mut timer = interval(self.check_interval.max(Duration::from_millis(1)));
            timer.tick().await; // Skip first tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let marked = self.check_once();
                        if !marked.is_empty() {
                            tracing::info!(count = marked.len(), "Marked silent devices offline");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Liveness monitor stopped");
        });

        LivenessHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running [`LivenessMonitor`].
pub struct LivenessHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LivenessHandle {
    /// Stop the monitor and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
