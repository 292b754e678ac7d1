//! Single-flight lease per mirror target.
//!
//! Reconcile, push and pull all rewrite the mirror; at most one of them may
//! run against a given target at a time. Contenders are rejected, not queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::error::SyncError;

#[derive(Debug, Clone, Default)]
pub struct MirrorLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MirrorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, target: &str) -> Result<MirrorLease, SyncError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(target.to_string()) {
            debug!(mirror = target, "mirror lease contended");
            return Err(SyncError::Busy {
                target: target.to_string(),
            });
        }
        Ok(MirrorLease {
            held: self.held.clone(),
            target: target.to_string(),
        })
    }

    pub fn is_held(&self, target: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(target))
            .unwrap_or(true)
    }
}

/// Held for the duration of one sync run; released on drop.
#[derive(Debug)]
pub struct MirrorLease {
    held: Arc<Mutex<HashSet<String>>>,
    target: String,
}

impl Drop for MirrorLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_drop() {
        let locks = MirrorLocks::new();
        let lease = locks.try_acquire("sheet").unwrap();

        assert!(matches!(locks.try_acquire("sheet"), Err(SyncError::Busy { .. })));
        assert!(locks.try_acquire("other-sheet").is_ok());

        drop(lease);
        assert!(!locks.is_held("sheet"));
        assert!(locks.try_acquire("sheet").is_ok());
    }
}
