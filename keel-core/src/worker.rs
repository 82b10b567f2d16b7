//! Supervised background workers.
//!
//! A [`Worker`] is a long-running `run(ctx)` loop. The [`Supervisor`] owns one
//! task per worker: panics are recovered, failures restart the worker under a
//! [`BackoffPolicy`], a clean exit retires it. The supervisor itself is a
//! lifecycle-managed service, so workers start after their dependencies and
//! stop before them.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app::App;
use crate::error::CoreError;
use crate::lifecycle::{HookCtx, HookError, Lifecycle};
use crate::module::Module;

/// A supervised background task.
pub trait Worker: Send + Sync + 'static {
    /// Name used in restart and panic logs.
    fn name(&self) -> &str;

    /// The worker body. Runs until completion, failure, or cancellation via
    /// `ctx`. Returning `Ok(())` retires the worker; returning an error asks
    /// the supervisor for a restart.
    fn run(&self, ctx: HookCtx) -> impl Future<Output = Result<(), HookError>> + Send;
}

/// Object-safe wrapper for [`Worker`].
trait WorkerErased: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn run_owned(
        self: Arc<Self>,
        ctx: HookCtx,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), HookError>> + Send + 'static>>;
}

impl<T: Worker> WorkerErased for T {
    fn name(&self) -> &str {
        Worker::name(self)
    }

    fn run_owned(
        self: Arc<Self>,
        ctx: HookCtx,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), HookError>> + Send + 'static>> {
        Box::pin(async move { self.run(ctx).await })
    }
}

/// Exponential restart backoff.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay between restarts.
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
        }
    }

    /// The delay before restart attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

struct SupervisorInner {
    workers: Mutex<Vec<Arc<dyn WorkerErased>>>,
    policy: BackoffPolicy,
    running: Mutex<Option<(CancellationToken, TaskTracker)>>,
}

/// Supervises registered workers; itself a [`Lifecycle`] service.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl Supervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                workers: Mutex::new(Vec::new()),
                policy,
                running: Mutex::new(None),
            }),
        }
    }

    /// Register a worker. Takes effect at the next start.
    pub fn add<W: Worker>(&self, worker: W) {
        self.inner
            .workers
            .lock()
            .expect("worker list poisoned")
            .push(Arc::new(worker));
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .expect("supervisor state poisoned")
            .is_some()
    }

    async fn supervise(
        worker: Arc<dyn WorkerErased>,
        policy: BackoffPolicy,
        cancel: CancellationToken,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let name = worker.name().to_string();
            let ctx = HookCtx::new(cancel.child_token(), None);
            let began = std::time::Instant::now();
            // Run in its own task so a panic is caught as a JoinError
            // instead of taking the supervisor down.
            let handle = tokio::spawn(worker.clone().run_owned(ctx));

            let outcome = tokio::select! {
                joined = handle => joined,
                _ = cancel.cancelled() => {
                    tracing::debug!(worker = %name, "worker cancelled");
                    return;
                }
            };

            match outcome {
                Ok(Ok(())) => {
                    tracing::info!(worker = %name, "worker finished");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(worker = %name, error = %e, "worker failed");
                }
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!(worker = %name, "worker panicked");
                }
                Err(_) => return,
            }

            // A run that stayed healthy for a while resets the backoff.
            if began.elapsed() >= Duration::from_secs(30) {
                attempt = 0;
            }
            let delay = policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(worker = %name, delay = ?delay, "restarting worker");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

impl Lifecycle for Supervisor {
    async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let workers: Vec<Arc<dyn WorkerErased>> = self
            .inner
            .workers
            .lock()
            .expect("worker list poisoned")
            .clone();

        tracing::info!(count = workers.len(), "starting supervised workers");
        for worker in workers {
            tracker.spawn(Supervisor::supervise(
                worker,
                self.inner.policy,
                cancel.clone(),
            ));
        }

        let mut running = self
            .inner
            .running
            .lock()
            .expect("supervisor state poisoned");
        *running = Some((cancel, tracker));
        Ok(())
    }

    async fn stop(&self, _ctx: HookCtx) -> Result<(), HookError> {
        let state = {
            let mut running = self
                .inner
                .running
                .lock()
                .expect("supervisor state poisoned");
            running.take()
        };
        if let Some((cancel, tracker)) = state {
            cancel.cancel();
            tracker.close();
            tracker.wait().await;
        }
        Ok(())
    }
}

/// Installs a [`Supervisor`] with the default backoff policy.
pub struct WorkerModule;

impl Module for WorkerModule {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn register(&self, app: &mut App) -> Result<(), CoreError> {
        app.container()
            .register::<Supervisor>()
            .managed()
            .instance(Supervisor::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        runs: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl Worker for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, _ctx: HookCtx) -> Result<(), HookError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.fail_first {
                Err(format!("failure {run}").into())
            } else {
                Ok(())
            }
        }
    }

    struct Panicky {
        runs: Arc<AtomicUsize>,
    }

    impl Worker for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn run(&self, _ctx: HookCtx) -> Result<(), HookError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("worker exploded");
            }
            Ok(())
        }
    }

    struct Sleeper {
        stopped: Arc<AtomicUsize>,
    }

    impl Worker for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        async fn run(&self, ctx: HookCtx) -> Result<(), HookError> {
            ctx.cancelled().await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_worker_is_restarted_until_clean_exit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(BackoffPolicy::constant(Duration::from_millis(5)));
        supervisor.add(Flaky {
            runs: runs.clone(),
            fail_first: 2,
        });

        supervisor.start(HookCtx::background()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop(HookCtx::background()).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_worker_is_recovered_and_restarted() {
        let runs = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(BackoffPolicy::constant(Duration::from_millis(5)));
        supervisor.add(Panicky { runs: runs.clone() });

        supervisor.start(HookCtx::background()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop(HookCtx::background()).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_cancels_blocked_workers() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::default();
        supervisor.add(Sleeper {
            stopped: stopped.clone(),
        });

        supervisor.start(HookCtx::background()).await.unwrap();
        assert!(supervisor.is_running());
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.stop(HookCtx::background()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!supervisor.is_running());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
    }
}
