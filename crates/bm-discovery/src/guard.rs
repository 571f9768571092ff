//! Bounded-wait mutual exclusion
//!
//! The engine owns two guards:
//! - `lifecycle`: subscribe/unsubscribe and scan-and-reconcile
//! - `mutation`: every inventory Add/Remove
//!
//! Reconciliation takes `mutation` while holding `lifecycle`. The reverse never
//! happens, so the nesting cannot deadlock. Guards are not reentrant.

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{DiscoveryError, Result};

pub const LIFECYCLE_GUARD: &str = "lifecycle";
pub const MUTATION_GUARD: &str = "mutation";

pub struct ConcurrencyGuard {
    name: &'static str,
    timeout: Duration,
    lock: Mutex<()>,
}

impl ConcurrencyGuard {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn lifecycle(timeout: Duration) -> Self {
        Self::new(LIFECYCLE_GUARD, timeout)
    }

    pub fn mutation(timeout: Duration) -> Self {
        Self::new(MUTATION_GUARD, timeout)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `critical_section` once the guard is held.
    ///
    /// Waiting is bounded by the guard's timeout; expiry yields
    /// [`DiscoveryError::LockTimeout`] and the section never runs. Once
    /// acquired the section runs to completion, whatever its duration.
    pub async fn run_exclusive<F, Fut, T>(&self, critical_section: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _held = match tokio::time::timeout(self.timeout, self.lock.lock()).await {
            Ok(held) => held,
            Err(_) => {
                warn!(guard = self.name, timeout_ms = self.timeout.as_millis() as u64, "Guard acquisition timed out");
                return Err(DiscoveryError::LockTimeout {
                    guard: self.name,
                    timeout: self.timeout,
                });
            }
        };

        critical_section().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_returns_section_result() {
        let guard = ConcurrencyGuard::mutation(Duration::from_millis(100));
        let value = guard.run_exclusive(|| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_sections_never_overlap() {
        let guard = Arc::new(ConcurrencyGuard::mutation(Duration::from_secs(5)));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                guard
                    .run_exclusive(|| async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_times_out_while_held() {
        let guard = Arc::new(ConcurrencyGuard::lifecycle(Duration::from_millis(20)));
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .run_exclusive(|| async {
                        let _ = entered_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();

        let ran = AtomicUsize::new(0);
        let result = guard
            .run_exclusive(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        match result {
            Err(DiscoveryError::LockTimeout { guard, timeout }) => {
                assert_eq!(guard, LIFECYCLE_GUARD);
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("expected LockTimeout, got {:?}", other),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_guards_nest() {
        let lifecycle = ConcurrencyGuard::lifecycle(Duration::from_millis(100));
        let mutation = ConcurrencyGuard::mutation(Duration::from_millis(100));

        let value = lifecycle
            .run_exclusive(|| async { mutation.run_exclusive(|| async { Ok("nested") }).await })
            .await
            .unwrap();
        assert_eq!(value, "nested");
    }
}
