use crate::cache_key::CacheKey;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    AlreadyRunning,
    AtCapacity,
}

/// Single-flight, bounded background job admission keyed by cache key.
///
/// A job occupies its key and one of `capacity` slots from admission until
/// it completes or the watchdog bound elapses, whichever comes first. The
/// watchdog frees the slot but does not cancel the job itself; a late
/// finisher still writes its object.
///
/// The ceiling is inclusive: with `capacity` jobs running the next distinct
/// key is declined, so at most `capacity` jobs ever hold a slot. This is one
/// fewer than a "decline once the count exceeds the ceiling" check would let
/// through.
#[derive(Clone)]
pub struct JobCoordinator {
    running: Arc<DashMap<CacheKey, u64>>,
    slots: Arc<Semaphore>,
    capacity: usize,
    watchdog: Duration,
    next_id: Arc<AtomicU64>,
}

impl JobCoordinator {
    pub fn new(capacity: usize, watchdog: Duration) -> Self {
        Self {
            running: Arc::new(DashMap::new()),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            watchdog,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Starts `job` in the background unless a job for `key` is already
    /// running or every slot is taken. Never waits.
    pub fn try_admit<F>(&self, key: CacheKey, job: F) -> Admission
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slot = match self.running.entry(key.clone()) {
            Entry::Occupied(_) => return Admission::AlreadyRunning,
            Entry::Vacant(entry) => {
                let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                    return Admission::AtCapacity;
                };
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                entry.insert(id);
                JobSlot {
                    key,
                    id,
                    running: self.running.clone(),
                    _permit: permit,
                }
            }
        };

        let watchdog = self.watchdog;
        let handle = tokio::spawn(job);
        tokio::spawn(async move {
            match tokio::time::timeout(watchdog, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(key = %slot.key, error = %err, "transform job aborted");
                }
                Err(_) => {
                    warn!(
                        key = %slot.key,
                        timeout_secs = watchdog.as_secs(),
                        "transform job exceeded watchdog bound; releasing slot"
                    );
                }
            }
            drop(slot);
        });
        Admission::Started
    }

    #[cfg(test)]
    pub fn is_running(&self, key: &CacheKey) -> bool {
        self.running.contains_key(key)
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Releases the key and the concurrency slot exactly once.
struct JobSlot {
    key: CacheKey,
    id: u64,
    running: Arc<DashMap<CacheKey, u64>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        let id = self.id;
        if self.running.remove_if(&self.key, |_, owner| *owner == id).is_some() {
            debug!(key = %self.key, "transform job released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformSpec;
    use tokio::sync::oneshot;

    fn key(url: &str) -> CacheKey {
        CacheKey::derive(&TransformSpec::default(), 1, None, url)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admission_is_single_flight_per_key() {
        let jobs = JobCoordinator::new(4, Duration::from_secs(30));
        let (release, wait) = oneshot::channel::<()>();
        let first = jobs.try_admit(key("a"), async move {
            let _ = wait.await;
        });
        assert_eq!(first, Admission::Started);
        for _ in 0..5 {
            assert_eq!(jobs.try_admit(key("a"), async {}), Admission::AlreadyRunning);
        }
        assert_eq!(jobs.running(), 1);

        release.send(()).unwrap();
        settle().await;
        assert_eq!(jobs.running(), 0);
        assert_eq!(jobs.try_admit(key("a"), async {}), Admission::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_bounds_concurrent_jobs() {
        let jobs = JobCoordinator::new(2, Duration::from_secs(30));
        let mut releases = Vec::new();
        for name in ["a", "b"] {
            let (release, wait) = oneshot::channel::<()>();
            releases.push(release);
            let admitted = jobs.try_admit(key(name), async move {
                let _ = wait.await;
            });
            assert_eq!(admitted, Admission::Started);
        }
        assert_eq!(jobs.try_admit(key("c"), async {}), Admission::AtCapacity);
        assert!(!jobs.is_running(&key("c")));

        releases.pop().unwrap().send(()).unwrap();
        settle().await;
        assert_eq!(jobs.running(), 1);
        assert_eq!(jobs.try_admit(key("c"), async {}), Admission::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_releases_hung_job() {
        let jobs = JobCoordinator::new(1, Duration::from_secs(30));
        let admitted = jobs.try_admit(key("stuck"), std::future::pending());
        assert_eq!(admitted, Admission::Started);
        assert_eq!(jobs.try_admit(key("other"), async {}), Admission::AtCapacity);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(jobs.is_running(&key("stuck")));

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(!jobs.is_running(&key("stuck")));
        assert_eq!(jobs.try_admit(key("stuck"), async {}), Admission::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_job_watchdog_does_not_touch_later_job() {
        let jobs = JobCoordinator::new(1, Duration::from_secs(30));
        assert_eq!(jobs.try_admit(key("k"), async {}), Admission::Started);
        settle().await;
        assert!(!jobs.is_running(&key("k")));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let admitted = jobs.try_admit(key("k"), std::future::pending());
        assert_eq!(admitted, Admission::Started);

        tokio::time::sleep(Duration::from_secs(25)).await;
        settle().await;
        assert!(jobs.is_running(&key("k")));
        assert_eq!(jobs.running(), 1);
    }
}
