// device_lease.rs
// Purpose: Per-device mutual exclusion for retraining runs within one process

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::errors::{ForecastError, ForecastResult, SafeLock};

#[derive(Default)]
struct LeaseTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Registry of devices that currently have a run in flight.
///
/// Cloning shares the same table.
#[derive(Clone, Default)]
pub struct DeviceLeases {
    inner: Arc<LeaseTable>,
}

/// Held lease; dropping it releases the device.
pub struct LeaseGuard {
    table: Arc<LeaseTable>,
    device_id: String,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard").field("device_id", &self.device_id).finish()
    }
}

impl LeaseGuard {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // A poisoned table still has to give the device back.
        let mut held = match self.table.held.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.device_id);
        drop(held);
        self.table.released.notify_all();
        debug!(device_id = %self.device_id, "device lease released");
    }
}

impl DeviceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive use of `device_id`.
    pub fn acquire(&self, device_id: &str, timeout: Duration) -> ForecastResult<LeaseGuard> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.inner.held.safe_lock()?;

        while held.contains(device_id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(ForecastError::RetrainInProgress {
                    device_id: device_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            let (guard, _) = self
                .inner
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| ForecastError::MutexPoisoned {
                    resource: "device_leases".to_string(),
                })?;
            held = guard;
        }

        held.insert(device_id.to_string());
        debug!(device_id = %device_id, "device lease acquired");
        Ok(LeaseGuard {
            table: Arc::clone(&self.inner),
            device_id: device_id.to_string(),
        })
    }

    pub fn is_held(&self, device_id: &str) -> bool {
        self.inner
            .held
            .lock()
            .map(|h| h.contains(device_id))
            .unwrap_or(false)
    }
}
