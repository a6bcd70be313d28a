//! Bounded pool for blocking external calls.
//!
//! Each call takes a pool slot, runs on tokio's blocking threads and is raced
//! against its own timeout. A call that times out is abandoned, not killed:
//! it keeps its slot until the underlying function returns, so the pool
//! bound also covers calls nobody waits for anymore.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::ProvisionError;
use crate::lifecycle::Step;

#[derive(Debug, Clone)]
pub struct Executor {
    slots: Arc<Semaphore>,
    size: usize,
}

impl Executor {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held by a running call.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run `call` on the pool. Exceeding `limit` is a hard step failure.
    pub async fn run<T, F>(&self, step: Step, limit: Duration, call: F) -> Result<T, ProvisionError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ProvisionError> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProvisionError::PoolClosed)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _slot = permit;
            call()
        });

        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ProvisionError::Panicked {
                step,
                message: join.to_string(),
            }),
            Err(_) => {
                tracing::warn!(%step, timeout_ms = limit.as_millis() as u64, "external call timed out");
                Err(ProvisionError::Timeout { step, after: limit })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_call_result() {
        let pool = Executor::new(2);
        let value = pool
            .run(Step::AllocateStorage, Duration::from_secs(1), || Ok(41 + 1))
            .await
            .expect("call");
        assert_eq!(value, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn timed_out_call_keeps_its_slot_until_it_returns() {
        let pool = Executor::new(1);
        let err = pool
            .run(Step::CreateNamespace, Duration::from_millis(20), || {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }), "got: {err}");
        assert_eq!(err.kind(), FailureKind::TransientExternal);
        assert_eq!(pool.available(), 0, "abandoned call still holds the slot");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_pool_size() {
        let pool = Executor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..6).map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                pool.run(Step::CreateWorkload, Duration::from_secs(5), move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        });
        for result in futures_join_all(calls).await {
            result.expect("call");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    async fn futures_join_all<F>(futures: impl IntoIterator<Item = F>) -> Vec<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.await.expect("join"));
        }
        out
    }
}
