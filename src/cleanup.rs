//! Retention sweep over durable storage
//!
//! Deletes inventories that have not been synced within the inactivity
//! threshold. This works on the database directly and is unrelated to the
//! buffer's own stale sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::db::{InventoryRepository, StorageError};

/// Upper bound for a single retention run
const RUN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub inactive_threshold: Duration,
    pub interval: Duration,
    /// Delay before the first run, so startup traffic is not competing with it
    pub initial_delay: Duration,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            inactive_threshold: Duration::from_secs(60 * 60),
            interval: Duration::from_secs(10 * 60),
            initial_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

pub struct CleanupScheduler {
    repo: Arc<dyn InventoryRepository>,
    settings: CleanupSettings,
    state: Mutex<SchedulerState>,
    stop_once: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupScheduler {
    /// Zero durations fall back to 30 days of inactivity and a daily run
    pub fn new(repo: Arc<dyn InventoryRepository>, mut settings: CleanupSettings) -> Self {
        if settings.inactive_threshold.is_zero() {
            settings.inactive_threshold = Duration::from_secs(30 * 24 * 60 * 60);
        }
        if settings.interval.is_zero() {
            settings.interval = Duration::from_secs(24 * 60 * 60);
        }

        Self {
            repo,
            settings,
            state: Mutex::new(SchedulerState::Idle),
            stop_once: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &CleanupSettings {
        &self.settings
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule the delayed first run and the periodic loop. Only has an
    /// effect while idle.
    pub fn start(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SchedulerState::Idle {
                return;
            }
            *state = SchedulerState::Running;
        }

        info!(
            "Cleanup scheduler started (interval={:?}, threshold={:?})",
            self.settings.interval, self.settings.inactive_threshold
        );

        let repo = self.repo.clone();
        let settings = self.settings.clone();
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(run_loop(repo, settings, shutdown));

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the periodic loop. Idempotent.
    pub async fn stop(&self) {
        if self.stop_once.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SchedulerState::Stopped;
        let _ = self.shutdown.send(true);

        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Cleanup scheduler task ended abnormally: {}", e);
            }
        }
        info!("Cleanup scheduler stopped");
    }

    /// Run the retention sweep immediately, outside the schedule
    pub async fn run_now(&self) -> Result<u64, StorageError> {
        timeout(RUN_TIMEOUT, self.repo.delete_inactive(self.settings.inactive_threshold))
            .await
            .map_err(|_| StorageError::Timeout(RUN_TIMEOUT))?
    }
}

async fn run_loop(
    repo: Arc<dyn InventoryRepository>,
    settings: CleanupSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = sleep(settings.initial_delay) => run_cleanup(repo.as_ref(), &settings).await,
        _ = shutdown.changed() => return,
    }

    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_cleanup(repo.as_ref(), &settings).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_cleanup(repo: &dyn InventoryRepository, settings: &CleanupSettings) {
    info!(
        "Running cleanup for inactive inventories (threshold: {:?})",
        settings.inactive_threshold
    );

    match timeout(RUN_TIMEOUT, repo.delete_inactive(settings.inactive_threshold)).await {
        Ok(Ok(0)) => info!("No inactive inventories to clean up"),
        Ok(Ok(deleted)) => info!("Cleaned up {} inactive inventories", deleted),
        Ok(Err(e)) => error!("Inventory cleanup failed: {}", e),
        Err(_) => error!("Inventory cleanup timed out after {:?}", RUN_TIMEOUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_repo;
    use crate::model::BufferedRecord;
    use chrono::Utc;

    async fn seeded_repo() -> Arc<dyn InventoryRepository> {
        let repo = memory_repo().await;
        repo.batch_upsert(&[
            BufferedRecord {
                owner_id: None,
                entity_id: "idle".to_string(),
                payload: b"{}".to_vec(),
                updated_at: Utc::now() - chrono::Duration::hours(2),
            },
            BufferedRecord::new(None, "active".to_string(), b"{}".to_vec()),
        ])
        .await
        .unwrap();
        Arc::new(repo)
    }

    #[tokio::test]
    async fn zero_settings_use_conservative_defaults() {
        let settings = CleanupSettings {
            inactive_threshold: Duration::ZERO,
            interval: Duration::ZERO,
            initial_delay: Duration::ZERO,
        };
        let scheduler = CleanupScheduler::new(Arc::new(memory_repo().await), settings);

        assert_eq!(scheduler.settings().inactive_threshold, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(scheduler.settings().interval, Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn run_now_returns_deleted_count() {
        let repo = seeded_repo().await;
        let scheduler = CleanupScheduler::new(repo.clone(), CleanupSettings::default());

        assert_eq!(scheduler.run_now().await.unwrap(), 1);
        assert!(repo.get("idle").await.unwrap().is_none());
        assert!(repo.get("active").await.unwrap().is_some());
        assert_eq!(scheduler.run_now().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lifecycle_is_idle_running_stopped() {
        let scheduler = CleanupScheduler::new(seeded_repo().await, CleanupSettings::default());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start();
        scheduler.start();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.stop().await;
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        scheduler.start();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn first_run_happens_after_initial_delay() {
        let repo = seeded_repo().await;
        let scheduler = CleanupScheduler::new(
            repo.clone(),
            CleanupSettings {
                initial_delay: Duration::from_millis(10),
                ..CleanupSettings::default()
            },
        );
        scheduler.start();

        for _ in 0..50 {
            if repo.get("idle").await.unwrap().is_none() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(repo.get("idle").await.unwrap().is_none());
        assert!(repo.get("active").await.unwrap().is_some());

        scheduler.stop().await;
    }
}
