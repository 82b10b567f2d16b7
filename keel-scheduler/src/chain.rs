//! Composable job wrappers.
//!
//! Every job launched by the scheduler is wrapped by the configured
//! [`Chain`], by default [`Recover`] then [`SkipIfStillRunning`]. Wrappers
//! are applied per entry, so non-overlap state (the busy mutex) is owned by
//! the entry, not shared across jobs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Boxed future returned by [`Job::run`].
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A schedulable unit of work.
///
/// Implemented by hand for struct jobs, or via any `Fn() -> Future` closure
/// through [`Cron::add_fn`](crate::Cron::add_fn).
pub trait Job: Send + Sync + 'static {
    fn run(&self) -> JobFuture;
}

/// Closure adapter for [`Job`].
pub(crate) struct FnJob<F>(pub(crate) F);

impl<F, Fut> Job for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn run(&self) -> JobFuture {
        Box::pin((self.0)())
    }
}

/// Decorates a job at entry-registration time. `name` is the entry name,
/// used for log attribution.
pub trait JobWrapper: Send + Sync + 'static {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job>;
}

/// An ordered set of wrappers; the first listed is outermost.
#[derive(Clone)]
pub struct Chain {
    wrappers: Vec<Arc<dyn JobWrapper>>,
}

impl Default for Chain {
    /// `Recover` around `SkipIfStillRunning`.
    fn default() -> Self {
        Self::new(vec![Arc::new(Recover), Arc::new(SkipIfStillRunning)])
    }
}

impl Chain {
    pub fn new(wrappers: Vec<Arc<dyn JobWrapper>>) -> Self {
        Self { wrappers }
    }

    /// A chain that applies no wrappers.
    pub fn bare() -> Self {
        Self::new(Vec::new())
    }

    /// Wrap `job` with every wrapper, first listed outermost.
    pub fn apply(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        self.wrappers
            .iter()
            .rev()
            .fold(job, |job, wrapper| wrapper.wrap(name, job))
    }
}

// ── Recover ────────────────────────────────────────────────────────────────

/// Catches panics raised by the inner job, logging them with the entry name.
pub struct Recover;

impl JobWrapper for Recover {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        Arc::new(RecoverJob {
            name: name.to_string(),
            inner: job,
        })
    }
}

struct RecoverJob {
    name: String,
    inner: Arc<dyn Job>,
}

impl Job for RecoverJob {
    fn run(&self) -> JobFuture {
        let name = self.name.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            // The inner job runs in its own task so a panic surfaces as a
            // JoinError instead of unwinding through the scheduler.
            let handle = tokio::spawn(inner.run());
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    let payload = panic_message(join_err.into_panic());
                    tracing::error!(job = %name, panic = %payload, "job panicked");
                }
            }
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── SkipIfStillRunning ─────────────────────────────────────────────────────

/// Drops a tick when the previous invocation of the same entry has not
/// finished yet.
pub struct SkipIfStillRunning;

impl JobWrapper for SkipIfStillRunning {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        Arc::new(SkipJob {
            name: name.to_string(),
            inner: job,
            busy: Arc::new(tokio::sync::Mutex::new(())),
        })
    }
}

struct SkipJob {
    name: String,
    inner: Arc<dyn Job>,
    busy: Arc<tokio::sync::Mutex<()>>,
}

impl Job for SkipJob {
    fn run(&self) -> JobFuture {
        let name = self.name.clone();
        let inner = self.inner.clone();
        let busy = self.busy.clone();
        Box::pin(async move {
            match busy.try_lock() {
                Ok(_guard) => inner.run().await,
                Err(_) => {
                    tracing::debug!(job = %name, "previous invocation still running, skipping");
                }
            }
        })
    }
}

// ── DelayIfStillRunning ────────────────────────────────────────────────────

/// Serializes overlapping invocations of the same entry, logging the wait.
pub struct DelayIfStillRunning;

impl JobWrapper for DelayIfStillRunning {
    fn wrap(&self, name: &str, job: Arc<dyn Job>) -> Arc<dyn Job> {
        Arc::new(DelayJob {
            name: name.to_string(),
            inner: job,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }
}

struct DelayJob {
    name: String,
    inner: Arc<dyn Job>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Job for DelayJob {
    fn run(&self) -> JobFuture {
        let name = self.name.clone();
        let inner = self.inner.clone();
        let lock = self.lock.clone();
        Box::pin(async move {
            let begin = Instant::now();
            let _guard = lock.lock().await;
            let waited = begin.elapsed();
            if waited > Duration::from_millis(1) {
                tracing::info!(job = %name, delay = ?waited, "job delayed by previous invocation");
            }
            inner.run().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: Arc<AtomicUsize>, hold: Duration) -> Arc<dyn Job> {
        Arc::new(FnJob(move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(hold).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
    }

    #[tokio::test]
    async fn recover_swallows_panics() {
        let job: Arc<dyn Job> = Arc::new(FnJob(|| async {
            panic!("job blew up");
        }));
        let wrapped = Chain::new(vec![Arc::new(Recover)]).apply("boomer", job);
        wrapped.run().await;
    }

    #[tokio::test]
    async fn skip_drops_overlapping_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let wrapped = Chain::new(vec![Arc::new(SkipIfStillRunning)]).apply(
            "slow",
            counting_job(counter.clone(), Duration::from_millis(60)),
        );

        let first = wrapped.run();
        let second = wrapped.run();
        tokio::join!(first, second);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delay_serializes_overlapping_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let wrapped = Chain::new(vec![Arc::new(DelayIfStillRunning)]).apply(
            "slow",
            counting_job(counter.clone(), Duration::from_millis(30)),
        );

        let first = wrapped.run();
        let second = wrapped.run();
        tokio::join!(first, second);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wrappers_do_not_share_state_across_entries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = Chain::new(vec![Arc::new(SkipIfStillRunning)]);
        let a = chain.apply("a", counting_job(counter.clone(), Duration::from_millis(40)));
        let b = chain.apply("b", counting_job(counter.clone(), Duration::from_millis(40)));

        tokio::join!(a.run(), b.run());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
