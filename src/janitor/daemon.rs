use super::{Janitor, SweepReport};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Totals since the daemon started
#[derive(Debug, Clone, Default)]
pub struct JanitorStats {
    pub sweeps: usize,
    pub totals: SweepReport,
    pub last: Option<SweepReport>,
}

/// Runs [`Janitor::sweep`] on a tokio task every interval until stopped.
pub struct JanitorDaemon {
    janitor: Arc<Janitor>,
    interval: Duration,
    /// Wakes the loop early, for shutdown
    notify: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
    stats: Arc<RwLock<JanitorStats>>,
}

impl JanitorDaemon {
    pub fn new(janitor: Arc<Janitor>) -> Self {
        let interval = janitor.config().interval();
        Self::with_interval(janitor, interval)
    }

    pub fn with_interval(janitor: Arc<Janitor>, interval: Duration) -> Self {
        Self {
            janitor,
            interval,
            notify: Arc::new(Notify::new()),
            worker: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
            stats: Arc::new(RwLock::new(JanitorStats::default())),
        }
    }

    /// Spawn the sweep loop. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.write();
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let janitor = Arc::clone(&self.janitor);
        let notify = Arc::clone(&self.notify);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            Self::sweep_loop(janitor, interval, notify, running, stats).await;
        });
        *self.worker.lock() = Some(handle);

        info!(interval_ms = interval.as_millis() as u64, "Started janitor");
    }

    /// Stop the loop and wait for an in-flight sweep to finish.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        self.notify.notify_one();

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Janitor task ended abnormally");
            }
        }
        info!("Stopped janitor");
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn stats(&self) -> JanitorStats {
        self.stats.read().clone()
    }

    async fn sweep_loop(
        janitor: Arc<Janitor>,
        interval: Duration,
        notify: Arc<Notify>,
        running: Arc<RwLock<bool>>,
        stats: Arc<RwLock<JanitorStats>>,
    ) {
        debug!("Janitor loop started");

        while *running.read() {
            let sweeper = Arc::clone(&janitor);
            match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                Ok(report) => {
                    let mut stats = stats.write();
                    stats.sweeps += 1;
                    stats.totals.absorb(&report);
                    stats.last = Some(report);
                }
                Err(e) => warn!(error = %e, "Janitor sweep panicked"),
            }

            if !*running.read() {
                break;
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = sleep(interval) => {}
            }
        }

        debug!("Janitor loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlowConfig, JanitorConfig};
    use crate::flow::{FlowCoordinator, RegistrationStatus, WaitRequest};
    use crate::store::{DurableStore, SledStore};

    fn janitor() -> (Arc<Janitor>, Arc<FlowCoordinator>) {
        let store: Arc<dyn DurableStore> = Arc::new(SledStore::temporary().unwrap());
        let flow = Arc::new(FlowCoordinator::new(store.clone(), FlowConfig::default()));
        let janitor = Arc::new(Janitor::new(store, flow.clone(), JanitorConfig::default()));
        (janitor, flow)
    }

    #[tokio::test]
    async fn test_daemon_expires_and_stops() {
        let (janitor, flow) = janitor();
        let reg = flow
            .register_waiting(WaitRequest::new("b", "agent-b").with_timeout(Duration::from_millis(20)))
            .unwrap();

        let daemon = JanitorDaemon::with_interval(janitor, Duration::from_millis(10));
        daemon.start();
        assert!(daemon.is_running());

        let mut expired = false;
        for _ in 0..200 {
            if flow.get(&reg.id).unwrap().status == RegistrationStatus::TimedOut {
                expired = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        daemon.stop().await;

        assert!(expired);
        assert!(!daemon.is_running());
        let stats = daemon.stats();
        assert!(stats.sweeps >= 1);
        assert_eq!(stats.totals.expired, 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let (janitor, _) = janitor();
        let daemon = JanitorDaemon::new(janitor);
        daemon.stop().await;
        assert_eq!(daemon.stats().sweeps, 0);
    }
}
