use super::manager::ProjectionManager;
use std::sync::Arc;
use std::time::Duration;

/// Recognised daemon options.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Tick rate. Each tick runs one update cycle per registered
    /// projection.
    pub polling_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(5),
        }
    }
}

/// Polls a [`ProjectionManager`] at a fixed interval to drive
/// incremental updates. Ticks never overlap: the
/// loop awaits one full `update_all` cycle before considering the
/// next tick or a stop request.
pub struct ProjectionDaemon {
    manager: Arc<ProjectionManager>,
    config: DaemonConfig,
}

impl ProjectionDaemon {
    pub fn new(manager: Arc<ProjectionManager>, config: DaemonConfig) -> Self {
        Self { manager, config }
    }

    /// Spawns the polling loop on the current runtime. Cancellation
    /// (via [`DaemonHandle::stop`]) is honoured only between ticks:
    /// once a tick's `update_all` begins, it runs to completion.
    pub fn spawn(self) -> DaemonHandle {
        let stop = Arc::new(tokio::sync::Notify::new());
        let stop_signal = stop.clone();
        let manager = self.manager;
        let polling_interval = self.config.polling_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(polling_interval);
            tracing::info!(?polling_interval, "projection daemon started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(error) = manager.update_all().await {
                            tracing::error!(%error, "projection daemon tick failed");
                        }
                    }
                    _ = stop_signal.notified() => {
                        tracing::info!("projection daemon stopped");
                        break;
                    }
                }
            }
        });

        DaemonHandle { stop, task }
    }
}

/// Handle to a running [`ProjectionDaemon`].
pub struct DaemonHandle {
    stop: Arc<tokio::sync::Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl DaemonHandle {
    /// Signals the daemon to stop after its current tick (if any) and
    /// waits for the task to finish.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}
