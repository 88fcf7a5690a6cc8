//! Fixed-size worker pool for detector jobs
//!
//! Backed by a rayon thread pool. The queue is unbounded; callers keep it short by
//! allowing at most one queued or running job per detector.

use crate::error::{Result, VisionError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Decrements the outstanding count when a job ends, unwinding included
struct Outstanding(Arc<AtomicUsize>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    pool: Option<ThreadPool>,
    outstanding: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(VisionError::Pool("Pool size must be at least 1".to_string()));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("vigil-worker-{}", i))
            .panic_handler(|_| warn!("Job panicked; worker continues"))
            .build()
            .map_err(|e| VisionError::Pool(format!("Failed to create worker pool: {}", e)))?;

        debug!("Worker pool started with {} threads", size);
        Ok(Self {
            pool: Some(pool),
            outstanding: Arc::new(AtomicUsize::new(0)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued or running
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Queue a job without blocking. Fails only once the pool is shut down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| VisionError::Pool("Pool is shut down".to_string()))?;

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let counter = Outstanding(self.outstanding.clone());
        pool.spawn(move || {
            let _counter = counter;
            job();
        });
        Ok(())
    }

    /// Stop accepting jobs and wait up to `grace` for outstanding ones to finish.
    ///
    /// Jobs still running after the grace period are left to finish on their own; the
    /// worker threads exit once idle. Returns the number left behind.
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        let pool = match self.pool.take() {
            Some(pool) => pool,
            None => return 0,
        };

        let deadline = Instant::now() + grace;
        while self.outstanding() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(pool);

        let left = self.outstanding();
        if left > 0 {
            warn!("{} job(s) still running after {:?}", left, grace);
        }
        left
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.pool.is_some() {
            self.shutdown(Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_zero_size_rejected() {
        assert!(WorkerPool::new(0).is_err());
    }

    #[test]
    fn test_runs_jobs_on_all_workers() {
        let pool = WorkerPool::new(3).unwrap();
        let (tx, rx) = unbounded();
        for i in 0..6 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap()).unwrap();
        }
        let mut results: Vec<i32> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();
        pool.execute(|| panic!("boom")).unwrap();

        let (tx, rx) = unbounded();
        pool.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_single_worker_queues_many_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        let (release_tx, release_rx) = unbounded::<()>();
        let (done_tx, done_rx) = unbounded();

        for i in 0..16 {
            let release_rx = release_rx.clone();
            let done_tx = done_tx.clone();
            pool.execute(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                done_tx.send(i).unwrap();
            })
            .unwrap();
        }
        assert_eq!(pool.outstanding(), 16);

        drop(release_tx);
        let finished = (0..16)
            .filter(|_| done_rx.recv_timeout(Duration::from_secs(5)).is_ok())
            .count();
        assert_eq!(finished, 16);
    }

    #[test]
    fn test_outstanding_drops_after_panic() {
        let pool = WorkerPool::new(1).unwrap();
        pool.execute(|| panic!("boom")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.outstanding() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_shutdown_leaves_stuck_job_behind() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.execute(|| thread::sleep(Duration::from_secs(2))).unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let left = pool.shutdown(Duration::from_millis(100));
        assert_eq!(left, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(pool.execute(|| {}).is_err());
    }

    #[test]
    fn test_shutdown_waits_for_quick_jobs() {
        let mut pool = WorkerPool::new(1).unwrap();
        pool.execute(|| thread::sleep(Duration::from_millis(30))).unwrap();
        assert_eq!(pool.shutdown(Duration::from_secs(2)), 0);
    }
}
