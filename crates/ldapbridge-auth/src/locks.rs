//! Per-principal serialization
//!
//! Attempts for the same principal run one at a time from resolution through
//! the last mutation. Distinct principals never contend. A principal's mutex
//! is dropped from the map once no attempt holds or waits on it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct PrincipalLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl PrincipalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `principal`
    pub async fn lock(&self, principal: &str) -> PrincipalGuard {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(principal.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = slot.lock_owned().await;
        PrincipalGuard {
            principal: principal.to_string(),
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Principals with a live slot
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }
}

pub struct PrincipalGuard {
    principal: String,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PrincipalGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        // Release first so the count below only sees the map and waiters
        self.guard.take();
        if let Some(slot) = slots.get(&self.principal) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.principal);
            }
        }
    }
}
