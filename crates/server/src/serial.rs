//! Cooperative serialization for RPC methods that share mutable state.
//!
//! Both gates hand out the lock in arrival order, so queued operations run
//! in the order they were issued.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-manager async mutex, acquired by the session around exclusive RPCs.
#[derive(Debug, Clone, Default)]
pub struct SerialGate {
    inner: Arc<Mutex<()>>,
}

impl SerialGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.inner.clone().lock_owned().await
    }

    /// Run `fut` once every earlier holder has finished.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _guard = self.acquire().await;
        fut.await
    }
}

/// Async mutexes keyed by string, for managers that serialize per item
/// rather than per manager. Entries are dropped once nobody holds or waits
/// on them.
#[derive(Debug, Default)]
pub struct KeyedGate {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> KeyedGuard<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyedGuard {
            gate: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

pub struct KeyedGuard<'a> {
    gate: &'a KeyedGate,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the last reference when idle.
        drop(self.guard.take());
        self.gate
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn serial_gate_runs_in_arrival_order() {
        let gate = SerialGate::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = {
            let gate = gate.clone();
            let log = log.clone();
            tokio::spawn(async move {
                gate.run(async {
                    log.lock().push("first:start");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    log.lock().push("first:end");
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let gate = gate.clone();
            let log = log.clone();
            tokio::spawn(async move {
                gate.run(async {
                    log.lock().push("second:start");
                    log.lock().push("second:end");
                })
                .await
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["first:start", "first:end", "second:start", "second:end"]
        );
    }

    #[tokio::test]
    async fn keyed_gate_isolates_keys_and_prunes_idle_entries() {
        let gate = KeyedGate::new();

        let a = gate.acquire("folder-a").await;
        // A different key is not blocked by the first.
        let b = tokio::time::timeout(Duration::from_millis(50), gate.acquire("folder-b"))
            .await
            .expect("independent key should not wait");
        assert_eq!(gate.active_keys(), 2);

        // The same key waits.
        let blocked =
            tokio::time::timeout(Duration::from_millis(20), gate.acquire("folder-a")).await;
        assert!(blocked.is_err());

        drop(a);
        drop(b);
        assert_eq!(gate.active_keys(), 0);
    }
}
