//! Background scheduling of sync cycles.

use crate::sync::config::SyncConfig;
use crate::sync::engine::SyncEngine;
use crate::sync::events::{EventBus, SyncEvent};
use crate::sync::models::ImportResult;
use crate::sync::pairing::{poll_inits, PairingReport};
use crate::{Result, SyncError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timer settings for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub pull_interval: Duration,
    /// Minimum spacing between two pulls.
    pub pull_throttle: Duration,
}

impl From<&SyncConfig> for OrchestratorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            pull_interval: config.pull_interval(),
            pull_throttle: config.pull_throttle(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub imported: ImportResult,
    /// `None` when the init poll failed.
    pub pairing: Option<PairingReport>,
}

struct Inner {
    engine: Arc<SyncEngine>,
    events: Arc<EventBus>,
    config: OrchestratorConfig,
    cycle: tokio::sync::Mutex<()>,
    last_pull: Mutex<Option<Instant>>,
    in_flight: Mutex<Vec<AbortHandle>>,
    stopped: AtomicBool,
}

/// Runs sync cycles on a timer and on demand, one at a time.
///
/// Must be started from within a tokio runtime.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(engine: Arc<SyncEngine>, events: Arc<EventBus>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                events,
                config,
                cycle: tokio::sync::Mutex::new(()),
                last_pull: Mutex::new(None),
                in_flight: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Spawn the pull timer. The first tick fires immediately.
    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut timer) = self.timer.lock() else {
            return;
        };
        if timer.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = interval(inner.config.pull_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                Inner::request_pull(&inner);
            }
        }));
        info!(
            "Sync orchestrator started (every {:?}, throttle {:?})",
            self.inner.config.pull_interval, self.inner.config.pull_throttle
        );
    }

    /// Schedule a background cycle unless one ran within the throttle window.
    pub fn request_pull(&self) -> Option<JoinHandle<()>> {
        Inner::request_pull(&self.inner)
    }

    /// Push, pull, poll inits, push. Cycles never overlap.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.inner.run_cycle().await
    }

    /// Cancel the timer and any running cycle. No event is delivered after
    /// this returns.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.close();
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            for handle in in_flight.drain(..) {
                handle.abort();
            }
        }
        info!("Sync orchestrator stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn request_pull(this: &Arc<Self>) -> Option<JoinHandle<()>> {
        if this.stopped.load(Ordering::SeqCst) {
            return None;
        }
        {
            let mut last = this.last_pull.lock().ok()?;
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < this.config.pull_throttle {
                    debug!("Pull throttled");
                    return None;
                }
            }
            *last = Some(now);
        }

        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            match inner.run_cycle().await {
                Ok(_) | Err(SyncError::Stopped) => {}
                Err(e) => warn!("Background sync cycle failed: {}", e),
            }
        });
        if let Ok(mut in_flight) = this.in_flight.lock() {
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(handle.abort_handle());
        }
        Some(handle)
    }

    async fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        self.events.emit(SyncEvent::CycleStarted);

        if let Err(e) = self.engine.push().await {
            warn!("Push before pull failed: {}", e);
        }
        let pulled = self.engine.pull().await;

        let pairing = match poll_inits(&self.engine).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Init poll failed: {}", e);
                None
            }
        };

        // Local edits may still be due even when nothing arrived
        if let Err(e) = self.engine.push().await {
            warn!("Push after pull failed: {}", e);
        }

        let imported = match pulled {
            Ok(imported) => imported,
            Err(e) => {
                warn!("Sync cycle failed: {}", e);
                self.events.emit(SyncEvent::CycleFailed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        if let Some(report) = &pairing {
            if !report.linked.is_empty() {
                self.events.emit(SyncEvent::DevicesLinked {
                    installation_ids: report.linked.clone(),
                });
            }
        }
        if imported.changed_anything() {
            self.events.emit(SyncEvent::DataRefreshed {
                imported: imported.total_imported(),
            });
        }
        if let Err(e) = self.finish_initial_sync(&imported) {
            warn!("Clearing initial sync flag failed: {}", e);
            self.events.emit(SyncEvent::CycleFailed {
                message: e.to_string(),
            });
            return Err(e);
        }

        Ok(CycleReport { imported, pairing })
    }

    fn finish_initial_sync(&self, imported: &ImportResult) -> Result<()> {
        if imported.transactions_imported() == 0 {
            return Ok(());
        }
        let cleared = self.engine.with_db("initial sync", |db| {
            if !SyncConfig::load(db)?.initial_sync_pending {
                return Ok(false);
            }
            SyncConfig::set_initial_sync_pending(db, false)?;
            Ok(true)
        })?;
        if cleared {
            info!("Initial sync complete");
            self.events.emit(SyncEvent::InitialSyncComplete);
        }
        Ok(())
    }
}
