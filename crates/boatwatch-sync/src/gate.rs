//! Cross-request cooldown around the refresh cycle.

use std::sync::Arc;

use boatwatch_storage::{GateStore, StoreError};
use chrono::Utc;
use thiserror::Error;

/// Key of the persisted last-run mark.
pub const GATE_KEY: &str = "boats_refresh_last";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Locked,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("refresh gate unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Admits at most one cycle per cooldown window across every caller that
/// shares the same [`GateStore`]. The mark expires after `ttl_secs`, so a
/// stale mark never locks the gate forever.
pub struct RefreshGate {
    store: Arc<dyn GateStore>,
    key: String,
    ttl_secs: i64,
}

impl RefreshGate {
    pub fn new(store: Arc<dyn GateStore>, ttl_secs: i64) -> Self {
        Self {
            store,
            key: GATE_KEY.to_string(),
            ttl_secs,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub async fn try_admit(&self, cooldown_secs: i64) -> Result<Admission, GateError> {
        self.try_admit_at(Utc::now().timestamp(), cooldown_secs).await
    }

    /// Check-and-set at `now` (epoch seconds). Admitted iff no live mark is
    /// younger than `cooldown_secs`; an admitted call writes `now`.
    pub async fn try_admit_at(&self, now: i64, cooldown_secs: i64) -> Result<Admission, GateError> {
        // the mark has to outlive the window it enforces
        let ttl_secs = self.ttl_secs.max(cooldown_secs + 1);
        let written = self
            .store
            .put_if_cooled(&self.key, now, cooldown_secs, ttl_secs)
            .await?;
        Ok(if written {
            Admission::Admitted
        } else {
            Admission::Locked
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boatwatch_storage::MemoryGateStore;

    fn gate(ttl_secs: i64) -> RefreshGate {
        RefreshGate::new(Arc::new(MemoryGateStore::new()), ttl_secs)
    }

    #[tokio::test]
    async fn cooldown_window_admits_then_locks_then_admits() {
        let gate = gate(120);
        assert_eq!(gate.try_admit_at(0, 30).await.unwrap(), Admission::Admitted);
        assert_eq!(gate.try_admit_at(10, 30).await.unwrap(), Admission::Locked);
        assert_eq!(gate.try_admit_at(31, 30).await.unwrap(), Admission::Admitted);
        assert_eq!(gate.try_admit_at(40, 30).await.unwrap(), Admission::Locked);
    }

    #[tokio::test]
    async fn zero_cooldown_admits_every_call() {
        let gate = gate(120);
        for now in [5, 5, 6] {
            assert_eq!(gate.try_admit_at(now, 0).await.unwrap(), Admission::Admitted);
        }
    }

    #[tokio::test]
    async fn short_ttl_is_stretched_past_the_cooldown() {
        let gate = gate(1);
        assert_eq!(gate.try_admit_at(100, 30).await.unwrap(), Admission::Admitted);
        assert_eq!(gate.try_admit_at(120, 30).await.unwrap(), Admission::Locked);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store: Arc<dyn GateStore> = Arc::new(MemoryGateStore::new());
        let a = RefreshGate::new(Arc::clone(&store), 120);
        let b = RefreshGate::new(store, 120).with_key("other");
        assert_eq!(a.try_admit_at(0, 30).await.unwrap(), Admission::Admitted);
        assert_eq!(b.try_admit_at(1, 30).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_get_exactly_one_admission() {
        let gate = Arc::new(gate(120));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.try_admit_at(500, 30).await.unwrap() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
