//! Background loops for the inventory buffer
//!
//! The drain loop flushes one batch per tick and, once told to stop, keeps
//! flushing until the buffer is empty. The sweeper evicts records that were
//! never flushed. Neither loop ever propagates an error; everything is logged
//! and retried on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{BufferCore, CLEANUP_TIMEOUT, FLUSH_TIMEOUT, SHUTDOWN_TIMEOUT};

/// Lifecycle of the drain loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

pub(crate) struct BufferWorker {
    shutdown: watch::Sender<bool>,
    state: Arc<watch::Sender<LoopState>>,
    stop_once: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BufferWorker {
    /// Spawn the drain loop and the staleness sweeper
    pub fn spawn(core: Arc<BufferCore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(watch::channel(LoopState::Running).0);

        let tasks = vec![
            tokio::spawn(drain_loop(core.clone(), shutdown.subscribe(), state.clone())),
            tokio::spawn(sweep_loop(core, shutdown.subscribe())),
        ];

        Self {
            shutdown,
            state,
            stop_once: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Signal both loops and wait for the final drain.
    ///
    /// Only the first call does anything; later calls wait until the buffer
    /// has reached `Stopped`.
    pub async fn stop(&self) {
        if self.stop_once.swap(true, Ordering::SeqCst) {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|s| *s == LoopState::Stopped).await;
            return;
        }

        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!("Inventory buffer task ended abnormally: {}", e);
            }
        }

        self.state.send_replace(LoopState::Stopped);
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn drain_loop(
    core: Arc<BufferCore>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<watch::Sender<LoopState>>,
) {
    let mut flush_interval = ticker(core.settings.flush_interval);

    loop {
        tokio::select! {
            _ = flush_interval.tick() => {
                match timeout(FLUSH_TIMEOUT, core.flush_batch()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Background flush failed: {}", e),
                    Err(_) => warn!("Background flush timed out after {:?}", FLUSH_TIMEOUT),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    state.send_replace(LoopState::Stopping);
    drain(&core).await;
    state.send_replace(LoopState::Stopped);
}

/// Flush until a batch comes back empty, a flush fails, or the shutdown
/// deadline passes
async fn drain(core: &BufferCore) {
    info!("Shutdown: flushing remaining inventory updates...");

    let mut total = 0;
    let outcome = timeout(SHUTDOWN_TIMEOUT, async {
        loop {
            match core.flush_batch().await {
                Ok(0) => break,
                Ok(flushed) => total += flushed,
                Err(e) => {
                    error!("Shutdown flush failed: {}", e);
                    break;
                }
            }
        }
    })
    .await;

    if outcome.is_err() {
        warn!(
            "Shutdown flush gave up after {:?} ({} records flushed)",
            SHUTDOWN_TIMEOUT, total
        );
    } else {
        info!("Shutdown flush complete ({} records flushed)", total);
    }
}

async fn sweep_loop(core: Arc<BufferCore>, mut shutdown: watch::Receiver<bool>) {
    let mut cleanup_interval = ticker(core.settings.cleanup_interval);

    loop {
        tokio::select! {
            _ = cleanup_interval.tick() => {
                match timeout(CLEANUP_TIMEOUT, core.cleanup_stale()).await {
                    Ok(Ok(removed)) => debug!("Stale sweep removed {} records", removed),
                    Ok(Err(e)) => error!("Stale sweep failed: {}", e),
                    Err(_) => warn!("Stale sweep timed out after {:?}", CLEANUP_TIMEOUT),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
