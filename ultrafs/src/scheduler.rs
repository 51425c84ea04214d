use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::errors::{EngineError, EngineResult};
use crate::metrics::OperationKind;

/// Cooperative cancellation flag.
///
/// Tokens form a tree: cancelling a token cancels every token derived from it
/// with [`child_token`](Self::child_token), never its parent. Work checks
/// [`is_cancelled`](Self::is_cancelled) at safe points.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// `Err(Cancelled)` once cancelled, for use with `?` inside work loops
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    running: AtomicUsize,
}

/// Scheduler statistics snapshot
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStats {
    pub parallel_ops: usize,
    pub queue_bound: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub in_flight: usize,
    pub running: usize,
}

/// Releases an admission slot when the task finishes, however it finishes
struct Permit(Arc<AtomicUsize>);

impl Drop for Permit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded work queue in front of a fixed rayon pool.
///
/// At most `parallel_ops` tasks run at once and at most `queue_bound` more
/// wait behind them. A submission past that is rejected immediately with
/// `Overloaded` instead of blocking the caller. Tasks must not submit and
/// wait on further tasks; fan-out belongs on the calling thread.
pub struct TaskScheduler {
    pool: ThreadPool,
    parallel_ops: usize,
    queue_bound: usize,
    admitted: Arc<AtomicUsize>,
    counters: Arc<SchedulerCounters>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new(parallel_ops: usize, queue_bound: usize) -> EngineResult<Self> {
        if parallel_ops == 0 {
            return Err(EngineError::config_error(
                "parallel_ops must be at least 1",
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(parallel_ops)
            .thread_name(|i| format!("ultrafs-worker-{i}"))
            .build()
            .map_err(|e| EngineError::config_error(format!("failed to start worker pool: {e}")))?;

        debug!(
            "Task scheduler started with {} workers and queue bound {}",
            parallel_ops, queue_bound
        );
        Ok(Self {
            pool,
            parallel_ops,
            queue_bound,
            admitted: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(SchedulerCounters::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn parallel_ops(&self) -> usize {
        self.parallel_ops
    }

    /// Running plus queued tasks the scheduler will accept
    pub fn capacity(&self) -> usize {
        self.parallel_ops + self.queue_bound
    }

    /// Queues `work` and returns a handle to its result.
    ///
    /// If `token` is cancelled before a worker picks the task up, the work is
    /// skipped and the handle yields `Cancelled`. Once running, `work` sees the
    /// token and decides for itself where to stop.
    pub fn submit<T, F>(
        &self,
        kind: OperationKind,
        token: &CancellationToken,
        work: F,
    ) -> EngineResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> EngineResult<T> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let permit = self.admit()?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::sync_channel(1);
        let task_token = token.clone();
        let shutdown = self.shutdown.clone();
        let counters = Arc::clone(&self.counters);

        self.pool.spawn(move || {
            if task_token.is_cancelled() || shutdown.is_cancelled() {
                trace!("Skipping cancelled {} task", kind.name());
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                drop(permit);
                let _ = tx.send(Err(EngineError::Cancelled));
                return;
            }

            counters.running.fetch_add(1, Ordering::AcqRel);
            let result = panic::catch_unwind(AssertUnwindSafe(|| work(&task_token)))
                .unwrap_or_else(|_| {
                    error!("Worker panicked while running {} task", kind.name());
                    Err(EngineError::io(
                        Path::new(kind.name()),
                        io::Error::new(io::ErrorKind::Other, "worker panicked"),
                    ))
                });
            counters.running.fetch_sub(1, Ordering::AcqRel);

            match &result {
                Ok(_) => counters.completed.fetch_add(1, Ordering::Relaxed),
                Err(EngineError::Cancelled) => counters.cancelled.fetch_add(1, Ordering::Relaxed),
                Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
            };

            drop(permit);
            // The caller may have dropped its handle
            let _ = tx.send(result);
        });

        Ok(TaskHandle {
            rx,
            token: token.clone(),
            kind,
        })
    }

    /// Cancels `token` and everything derived from it
    pub fn cancel(&self, token: &CancellationToken) {
        token.cancel();
    }

    /// Stops accepting work and cancels everything not yet started
    pub fn shutdown(&self) {
        debug!("Task scheduler shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            parallel_ops: self.parallel_ops,
            queue_bound: self.queue_bound,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            in_flight: self.admitted.load(Ordering::Acquire),
            running: self.counters.running.load(Ordering::Acquire),
        }
    }

    fn admit(&self) -> EngineResult<Permit> {
        let limit = self.capacity();
        let mut current = self.admitted.load(Ordering::Acquire);
        loop {
            if current >= limit {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Rejecting task: {} in flight, limit {}", current, limit);
                return Err(EngineError::Overloaded {
                    in_flight: current,
                    limit,
                });
            }
            match self.admitted.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Permit(Arc::clone(&self.admitted))),
                Err(actual) => current = actual,
            }
        }
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("parallel_ops", &self.parallel_ops)
            .field("queue_bound", &self.queue_bound)
            .field("in_flight", &self.admitted.load(Ordering::Relaxed))
            .finish()
    }
}

/// Result slot for a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<EngineResult<T>>,
    token: CancellationToken,
    kind: OperationKind,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task produces its result
    pub fn wait(self) -> EngineResult<T> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(EngineError::io(
                Path::new(self.kind.name()),
                io::Error::new(io::ErrorKind::Other, "worker dropped task result"),
            ))
        })
    }

    /// Requests cancellation through the token the task was submitted with
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_results_come_back() {
        let scheduler = TaskScheduler::new(4, 16).unwrap();
        let token = CancellationToken::new();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                scheduler
                    .submit(OperationKind::Read, &token, move |_| Ok(i * 2))
                    .unwrap()
            })
            .collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());

        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_overloaded_when_queue_is_full() {
        let scheduler = TaskScheduler::new(2, 2).unwrap();
        let token = CancellationToken::new();
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            handles.push(
                scheduler
                    .submit(OperationKind::Search, &token, move |_| {
                        started.fetch_add(1, Ordering::SeqCst);
                        while !release.load(Ordering::SeqCst) {
                            thread::sleep(Duration::from_millis(1));
                        }
                        Ok(())
                    })
                    .unwrap(),
            );
        }
        wait_until(|| started.load(Ordering::SeqCst) == 2);

        let err = scheduler
            .submit(OperationKind::Search, &token, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overloaded);
        assert!(matches!(
            err,
            EngineError::Overloaded {
                in_flight: 4,
                limit: 4
            }
        ));
        assert_eq!(scheduler.stats().rejected, 1);

        release.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.wait().unwrap();
        }

        // Capacity frees up again once the backlog drains
        let handle = scheduler
            .submit(OperationKind::Search, &token, |_| Ok(7))
            .unwrap();
        assert_eq!(handle.wait().unwrap(), 7);
    }

    #[test]
    fn test_cancel_before_start_skips_work() {
        let scheduler = TaskScheduler::new(1, 4).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicBool::new(false));

        let blocker_token = CancellationToken::new();
        let blocker = {
            let release = Arc::clone(&release);
            scheduler
                .submit(OperationKind::Read, &blocker_token, move |_| {
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                })
                .unwrap()
        };

        let token = CancellationToken::new();
        let queued = {
            let ran = Arc::clone(&ran);
            scheduler
                .submit(OperationKind::Read, &token, move |_| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
        };
        scheduler.cancel(&token);
        release.store(true, Ordering::SeqCst);

        blocker.wait().unwrap();
        let err = queued.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.stats().cancelled, 1);
    }

    #[test]
    fn test_running_task_observes_cancellation() {
        let scheduler = TaskScheduler::new(1, 1).unwrap();
        let token = CancellationToken::new();
        let started = Arc::new(AtomicBool::new(false));

        let handle = {
            let started = Arc::clone(&started);
            scheduler
                .submit(OperationKind::Search, &token, move |token| -> EngineResult<()> {
                    started.store(true, Ordering::SeqCst);
                    loop {
                        token.check()?;
                        thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap()
        };
        wait_until(|| started.load(Ordering::SeqCst));
        handle.cancel();
        let err = handle.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_child_tokens_follow_parent() {
        let root = CancellationToken::new();
        let child = root.child_token();
        let grandchild = child.child_token();
        let sibling = root.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());

        root.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_panicking_task_reports_error() {
        let scheduler = TaskScheduler::new(1, 1).unwrap();
        let token = CancellationToken::new();
        let handle = scheduler
            .submit(OperationKind::Read, &token, |_| -> EngineResult<()> {
                panic!("boom")
            })
            .unwrap();
        assert_eq!(handle.wait().unwrap_err().kind(), ErrorKind::Io);

        // The pool survives
        let handle = scheduler
            .submit(OperationKind::Read, &token, |_| Ok(1))
            .unwrap();
        assert_eq!(handle.wait().unwrap(), 1);
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let scheduler = TaskScheduler::new(1, 1).unwrap();
        scheduler.shutdown();
        let err = scheduler
            .submit(OperationKind::Read, &CancellationToken::new(), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(TaskScheduler::new(0, 1).is_err());
    }
}
