use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{RuntimeError, RuntimeResult};

/// A held run slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct RunPermit {
    _permit: OwnedSemaphorePermit,
}

/// Process-wide bound on simultaneous runs. Waiters are served FIFO.
///
/// One permit pool lives for the whole process; shutdown only gates who may
/// take from it, so permits still held by cancelled runs keep counting
/// after a reopen.
pub struct ConcurrencySemaphore {
    capacity: usize,
    permits: Arc<Semaphore>,
    gate: Mutex<Gate>,
}

struct Gate {
    shutdown: CancellationToken,
    reason: Option<String>,
}

impl ConcurrencySemaphore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            gate: Mutex::new(Gate {
                shutdown: CancellationToken::new(),
                reason: None,
            }),
        }
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, Gate> {
        match self.gate.lock() {
            Ok(gate) => gate,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn shutdown_error(&self) -> RuntimeError {
        let reason = self
            .gate()
            .reason
            .clone()
            .unwrap_or_else(|| "run slots closed".to_string());
        RuntimeError::ShuttingDown(reason)
    }

    pub fn try_acquire(&self) -> Option<RunPermit> {
        if self.is_closed() {
            return None;
        }
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| RunPermit { _permit: permit })
    }

    /// Wait for a slot. Fails with `ShuttingDown` once [`Self::reject_all`] runs.
    pub async fn acquire(&self) -> RuntimeResult<RunPermit> {
        let shutdown = self.gate().shutdown.clone();
        if shutdown.is_cancelled() {
            return Err(self.shutdown_error());
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(self.shutdown_error()),
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => Ok(RunPermit { _permit: permit }),
                Err(_) => Err(self.shutdown_error()),
            },
        }
    }

    /// Fail every queued and future waiter. Held permits stay valid.
    pub fn reject_all(&self, reason: &str) {
        let mut gate = self.gate();
        gate.reason = Some(reason.to_string());
        gate.shutdown.cancel();
    }

    /// Accept waiters again after [`Self::reject_all`].
    pub fn reopen(&self) {
        let mut gate = self.gate();
        if gate.shutdown.is_cancelled() {
            gate.shutdown = CancellationToken::new();
            gate.reason = None;
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.gate().shutdown.is_cancelled()
    }
}

/// Queued-or-running attempt count per app.
#[derive(Clone, Default)]
pub struct PendingTriggers {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

/// Decrements the app's pending count when dropped.
#[derive(Debug)]
pub struct PendingGuard {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    app_id: String,
}

impl PendingTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        match self.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn guard(&self, app_id: &str) -> PendingGuard {
        PendingGuard {
            counts: self.counts.clone(),
            app_id: app_id.to_string(),
        }
    }

    /// Count an attempt unconditionally.
    pub fn enter(&self, app_id: &str) -> PendingGuard {
        *self.lock().entry(app_id.to_string()).or_insert(0) += 1;
        self.guard(app_id)
    }

    /// Count an attempt only if none is queued or running for this app.
    /// Check and increment happen under one lock.
    pub fn try_enter_exclusive(&self, app_id: &str) -> Option<PendingGuard> {
        let mut counts = self.lock();
        if counts.get(app_id).copied().unwrap_or(0) > 0 {
            return None;
        }
        counts.insert(app_id.to_string(), 1);
        drop(counts);
        Some(self.guard(app_id))
    }

    pub fn count(&self, app_id: &str) -> usize {
        self.lock().get(app_id).copied().unwrap_or(0)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut counts = match self.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(count) = counts.get_mut(&self.app_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.app_id);
            }
        }
    }
}
