use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Successes in a row before the pool grows by one worker.
const GROWTH_STREAK: usize = 8;

/// Additive-increase / multiplicative-decrease worker pool. Saturation
/// signals halve the effective concurrency; success streaks recover it one
/// permit at a time up to the configured ceiling.
pub struct AdaptiveWorkers {
    semaphore: Arc<Semaphore>,
    target: AtomicUsize,
    max: usize,
    successes: AtomicUsize,
}

impl AdaptiveWorkers {
    pub fn new(initial: usize) -> Arc<Self> {
        let initial = initial.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(initial)),
            target: AtomicUsize::new(initial),
            max: initial,
            successes: AtomicUsize::new(0),
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        let streak = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
        if streak < GROWTH_STREAK {
            return;
        }
        self.successes.store(0, Ordering::Relaxed);

        let current = self.target.load(Ordering::Relaxed);
        if current < self.max
            && self
                .target
                .compare_exchange(current, current + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.semaphore.add_permits(1);
            debug!(workers = current + 1, "worker pool grew after success streak");
        }
    }

    /// Saturation signal (timeout, transient backend failure): halve the
    /// pool. Excess permits are reclaimed as they free up.
    pub fn record_pressure(self: &Arc<Self>) {
        self.successes.store(0, Ordering::Relaxed);

        let current = self.target.load(Ordering::Relaxed);
        let reduced = (current / 2).max(1);
        if reduced == current
            || self
                .target
                .compare_exchange(current, reduced, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            return;
        }

        debug!(workers = reduced, "worker pool halved under backend pressure");
        for _ in 0..(current - reduced) {
            match self.semaphore.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    // Permit currently held by a worker; retire it once the
                    // worker finishes.
                    let semaphore = Arc::clone(&self.semaphore);
                    tokio::spawn(async move {
                        if let Ok(permit) = semaphore.acquire_owned().await {
                            permit.forget();
                        }
                    });
                }
            }
        }
    }
}
