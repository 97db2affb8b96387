use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Semaphore;

use super::shape::Invocation;

/// Bounded pool for blocking invocations. Synchronous methods run on the
/// blocking thread pool, asynchronous ones on their own task. At most `size`
/// run at once.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs an invocation once a worker is free. A panicking invocation is
    /// reported as a failed one.
    pub async fn run(&self, invocation: Invocation) -> anyhow::Result<()> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("worker pool {} is closed", self.name))?;

        let handle = match invocation {
            Invocation::Sync(call) => tokio::task::spawn_blocking(call),
            Invocation::Async(future) => tokio::spawn(future),
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("invocation on worker pool {} failed: {e}", self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn limits_concurrent_invocations() {
        let pool = WorkerPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..6).map(|_| {
            let (running, peak) = (running.clone(), peak.clone());
            pool.run(Invocation::Sync(Box::new(move || -> anyhow::Result<()> {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })))
        });
        let results = join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let pool = WorkerPool::new("test", 1);

        let result = pool
            .run(Invocation::Sync(Box::new(|| -> anyhow::Result<()> {
                panic!("boom")
            })))
            .await;

        assert!(result.is_err());
    }
}
