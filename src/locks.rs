//! Advisory async locks keyed by name.
//!
//! Every operation that touches VBoxManage state for a machine holds the
//! machine's lock for its whole duration, so two control commands against
//! the same name run one after the other while different names proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct NameLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of a guarded operation.
pub struct NameGuard {
    _guard: OwnedMutexGuard<()>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> NameGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Drop slots nobody holds or waits on.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        NameGuard {
            _guard: slot.lock_owned().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_name_is_serialized() {
        let locks = NameLocks::new();
        let guard = locks.lock("web").await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock("web")).await;
        assert!(second.is_err(), "second lock should wait");
        drop(guard);
        let third = tokio::time::timeout(Duration::from_millis(50), locks.lock("web")).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn different_names_do_not_block() {
        let locks = NameLocks::new();
        let _web = locks.lock("web").await;
        let db = tokio::time::timeout(Duration::from_millis(50), locks.lock("db")).await;
        assert!(db.is_ok());
    }
}
