use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::model::VaultItem;
use crate::vault_client::{VaultApi, VaultError};

/// Shared, immutable view of one vault listing.
pub type Snapshot = Arc<[VaultItem]>;

#[derive(Debug)]
pub struct CacheEntry {
    pub items: Snapshot,
    pub fetched_at: Instant,
    pub generation: u64,
}

impl CacheEntry {
    /// `None` budgets never expire.
    pub fn is_fresh(&self, stale_time: Option<Duration>) -> bool {
        match stale_time {
            None => true,
            Some(budget) => self.fetched_at.elapsed() < budget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Running { period: Duration },
}

struct RefreshTask {
    period: Duration,
    port: u16,
    handle: JoinHandle<()>,
}

/// Single-entry cache over the vault item listing.
///
/// The entry is swapped whole, so readers see either the previous listing
/// or the new one. Fetches go through `fetch_gate`: callers that find the
/// entry cold while another fetch is running wait for it and reuse its
/// outcome, success or failure, instead of issuing their own request.
/// `attempts` counts finished fetches, `generation` counts stored listings
/// and `epoch` counts invalidations; a listing fetched across an
/// invalidation is handed to its caller but never stored.
pub struct ResultCache {
    source: Arc<dyn VaultApi>,
    entry: Mutex<Option<Arc<CacheEntry>>>,
    fetch_gate: AsyncMutex<()>,
    attempts: AtomicU64,
    last_failure: Mutex<Option<Arc<VaultError>>>,
    generation: AtomicU64,
    epoch: AtomicU64,
    refresh: Mutex<Option<RefreshTask>>,
}

impl ResultCache {
    pub fn new(source: Arc<dyn VaultApi>) -> Self {
        Self {
            source,
            entry: Mutex::new(None),
            fetch_gate: AsyncMutex::new(()),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            refresh: Mutex::new(None),
        }
    }

    pub async fn get(&self, port: u16, stale_time: Option<Duration>) -> Result<Snapshot, VaultError> {
        let seen_attempt = self.attempts.load(Ordering::Acquire);
        if let Some(entry) = self.current() {
            if entry.is_fresh(stale_time) {
                return Ok(entry.items.clone());
            }
        }

        let _gate = self.fetch_gate.lock().await;
        if self.attempts.load(Ordering::Acquire) != seen_attempt {
            if let Some(err) = self.failure_slot().clone() {
                debug!(%err, "joined a failed listing fetch");
                return Err(VaultError::Shared(err));
            }
            if let Some(entry) = self.current() {
                debug!(generation = entry.generation, "joined an in-flight listing fetch");
                return Ok(entry.items.clone());
            }
        }

        self.fetch_locked(port).await
    }

    /// Fetches unconditionally, replacing the entry on success. A failed
    /// refresh leaves the previous listing in place.
    pub async fn refresh(&self, port: u16) -> Result<Snapshot, VaultError> {
        let _gate = self.fetch_gate.lock().await;
        self.fetch_locked(port).await
    }

    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *self.entry_slot() = None;
        debug!("vault listing cache invalidated");
    }

    pub fn current(&self) -> Option<Arc<CacheEntry>> {
        self.entry_slot().clone()
    }

    /// Starts, reschedules or stops the background refresh so that it runs
    /// every `period` against `port`. Calling again with the same values is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn configure_refresh(self: &Arc<Self>, period: Option<Duration>, port: u16) -> RefreshState {
        let period = period.filter(|p| !p.is_zero());
        let mut slot = self.refresh_slot();

        if let (Some(period), Some(task)) = (period, slot.as_ref()) {
            if task.period == period && task.port == port && !task.handle.is_finished() {
                return RefreshState::Running { period };
            }
        }

        if let Some(task) = slot.take() {
            task.handle.abort();
            debug!(period_secs = task.period.as_secs(), "background refresh cancelled");
        }

        let Some(period) = period else {
            return RefreshState::Idle;
        };

        let cache = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match cache.refresh(port).await {
                    Ok(items) => debug!(count = items.len(), "background refresh complete"),
                    Err(err) => warn!(%err, "background refresh failed; keeping previous listing"),
                }
            }
        });

        info!(period_secs = period.as_secs(), port, "background refresh scheduled");
        *slot = Some(RefreshTask {
            period,
            port,
            handle,
        });
        RefreshState::Running { period }
    }

    pub fn refresh_state(&self) -> RefreshState {
        match self.refresh_slot().as_ref() {
            Some(task) if !task.handle.is_finished() => RefreshState::Running {
                period: task.period,
            },
            _ => RefreshState::Idle,
        }
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.refresh_slot().take() {
            task.handle.abort();
            info!("background refresh stopped");
        }
    }

    async fn fetch_locked(&self, port: u16) -> Result<Snapshot, VaultError> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let fetched = self.source.list_items(port).await;
        let outcome = match fetched {
            Ok(items) => {
                *self.failure_slot() = None;
                Ok(self.store(items.into(), epoch))
            }
            Err(err) => {
                let err = Arc::new(err);
                *self.failure_slot() = Some(Arc::clone(&err));
                Err(VaultError::Shared(err))
            }
        };
        self.attempts.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    fn store(&self, items: Snapshot, epoch: u64) -> Snapshot {
        if self.epoch.load(Ordering::Acquire) == epoch {
            let generation = self.generation.load(Ordering::Acquire) + 1;
            *self.entry_slot() = Some(Arc::new(CacheEntry {
                items: items.clone(),
                fetched_at: Instant::now(),
                generation,
            }));
            self.generation.store(generation, Ordering::Release);
            debug!(count = items.len(), generation, "vault listing cached");
        } else {
            debug!("listing fetched across an invalidation; not cached");
        }
        items
    }

    fn entry_slot(&self) -> MutexGuard<'_, Option<Arc<CacheEntry>>> {
        self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn failure_slot(&self) -> MutexGuard<'_, Option<Arc<VaultError>>> {
        self.last_failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh_slot(&self) -> MutexGuard<'_, Option<RefreshTask>> {
        self.refresh.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ResultCache {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_slot().take() {
            task.handle.abort();
        }
    }
}
