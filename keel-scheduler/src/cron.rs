//! The scheduler core: entries, the control channel, and the run loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use keel_core::container::Container;
use keel_core::lifecycle::{HookCtx, HookError, Lifecycle};

use crate::chain::{Chain, FnJob, Job};
use crate::parser::{parse, ParseError};
use crate::schedule::Schedule;

/// Identifier of a scheduled entry, unique per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

/// Inspection snapshot of one entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub id: EntryId,
    pub name: String,
    pub expression: String,
    pub next: Option<DateTime<Utc>>,
    pub prev: Option<DateTime<Utc>>,
}

struct Entry {
    id: EntryId,
    name: String,
    expression: String,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
    prev: Option<DateTime<Utc>>,
    job: Arc<dyn Job>,
}

impl Entry {
    fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id,
            name: self.name.clone(),
            expression: self.expression.clone(),
            next: self.next,
            prev: self.prev,
        }
    }
}

enum Control {
    Add(Entry),
    Remove(EntryId),
    Snapshot(oneshot::Sender<Vec<EntryInfo>>),
}

struct RunHandles {
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    run_loop: JoinHandle<Vec<Entry>>,
}

struct CronInner {
    tz: Tz,
    chain: Chain,
    next_id: AtomicU64,
    /// Entries added while stopped; drained into the loop at start.
    seed: Mutex<Vec<Entry>>,
    running: Mutex<Option<RunHandles>>,
}

/// Cron scheduler.
///
/// Entries can be added before or after start; while running, mutations go
/// through the loop's control channel so the entry set is only ever touched
/// by the loop task. The scheduler participates in container lifecycle via
/// its [`Lifecycle`] impl: start enters the run loop (a scheduler without
/// entries still starts and stops normally), stop drains in-flight jobs.
#[derive(Clone)]
pub struct Cron {
    inner: Arc<CronInner>,
}

impl Default for Cron {
    fn default() -> Self {
        Self::new()
    }
}

impl Cron {
    /// A scheduler in UTC with the default wrapper chain
    /// (`Recover` + `SkipIfStillRunning`).
    pub fn new() -> Self {
        Self::with_options(chrono_tz::UTC, Chain::default())
    }

    /// A scheduler whose expressions without a `CRON_TZ=` prefix evaluate in
    /// `tz`.
    pub fn with_timezone(tz: Tz) -> Self {
        Self::with_options(tz, Chain::default())
    }

    pub fn with_options(tz: Tz, chain: Chain) -> Self {
        Self {
            inner: Arc::new(CronInner {
                tz,
                chain,
                next_id: AtomicU64::new(1),
                seed: Mutex::new(Vec::new()),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.tz
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .expect("scheduler state poisoned")
            .is_some()
    }

    // ── Entry management ───────────────────────────────────────────────────

    /// Parse `expression` and schedule `job` under it.
    pub fn add_job<J: Job>(
        &self,
        name: &str,
        expression: &str,
        job: J,
    ) -> Result<EntryId, ParseError> {
        let schedule = parse(expression)?;
        Ok(self.schedule_job(name, expression, schedule, Arc::new(job)))
    }

    /// Schedule an async closure.
    pub fn add_fn<F, Fut>(
        &self,
        name: &str,
        expression: &str,
        job: F,
    ) -> Result<EntryId, ParseError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.add_job(name, expression, FnJob(job))
    }

    /// Schedule a job resolved from the container on every fire.
    ///
    /// With a transient registration, each tick runs a freshly-constructed
    /// `J`; with a singleton, each tick runs the shared one.
    pub fn add_service_job<J>(
        &self,
        name: &str,
        expression: &str,
        container: &Container,
    ) -> Result<EntryId, ParseError>
    where
        J: Job + Clone,
    {
        let container = container.clone();
        let entry_name = name.to_string();
        self.add_fn(name, expression, move || {
            let container = container.clone();
            let entry_name = entry_name.clone();
            async move {
                match container.resolve::<J>() {
                    Ok(job) => job.run().await,
                    Err(e) => {
                        tracing::error!(job = %entry_name, error = %e, "cannot resolve job service");
                    }
                }
            }
        })
    }

    /// Schedule under an already-built [`Schedule`].
    pub fn schedule_job(
        &self,
        name: &str,
        expression: &str,
        mut schedule: Schedule,
        job: Arc<dyn Job>,
    ) -> EntryId {
        schedule.apply_default_timezone(self.inner.tz);
        let id = EntryId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = Entry {
            id,
            name: name.to_string(),
            expression: expression.to_string(),
            schedule,
            next: None,
            prev: None,
            job: self.inner.chain.apply(name, job),
        };

        let running = self
            .inner
            .running
            .lock()
            .expect("scheduler state poisoned");
        match running.as_ref() {
            Some(handles) => {
                let _ = handles.control.send(Control::Add(entry));
            }
            None => {
                self.inner
                    .seed
                    .lock()
                    .expect("scheduler seed poisoned")
                    .push(entry);
            }
        }
        id
    }

    /// Remove an entry. Removing an unknown id is a no-op.
    pub fn remove(&self, id: EntryId) {
        let running = self
            .inner
            .running
            .lock()
            .expect("scheduler state poisoned");
        match running.as_ref() {
            Some(handles) => {
                let _ = handles.control.send(Control::Remove(id));
            }
            None => {
                self.inner
                    .seed
                    .lock()
                    .expect("scheduler seed poisoned")
                    .retain(|e| e.id != id);
            }
        }
    }

    /// A defensive snapshot of every entry.
    pub async fn entries(&self) -> Vec<EntryInfo> {
        let reply = {
            let running = self
                .inner
                .running
                .lock()
                .expect("scheduler state poisoned");
            match running.as_ref() {
                Some(handles) => {
                    let (tx, rx) = oneshot::channel();
                    let _ = handles.control.send(Control::Snapshot(tx));
                    Some(rx)
                }
                None => None,
            }
        };
        match reply {
            Some(rx) => rx.await.unwrap_or_default(),
            None => self
                .inner
                .seed
                .lock()
                .expect("scheduler seed poisoned")
                .iter()
                .map(Entry::info)
                .collect(),
        }
    }

    // ── Run loop ───────────────────────────────────────────────────────────

    /// Enter the run loop. Idempotent: a second call while running is a
    /// no-op.
    pub fn start_loop(&self) {
        let mut running = self
            .inner
            .running
            .lock()
            .expect("scheduler state poisoned");
        if running.is_some() {
            return;
        }

        let entries = std::mem::take(
            &mut *self
                .inner
                .seed
                .lock()
                .expect("scheduler seed poisoned"),
        );
        let (control, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let run_loop = tokio::spawn(run_loop(entries, rx, cancel.clone(), tracker.clone()));

        tracing::info!(timezone = %self.inner.tz, "scheduler started");
        *running = Some(RunHandles {
            control,
            cancel,
            tracker,
            run_loop,
        });
    }

    /// Leave the run loop and wait for in-flight jobs to finish.
    ///
    /// The returned future completes only when every launched job has
    /// drained; the caller (normally the lifecycle engine) bounds the wait
    /// with its own deadline.
    pub async fn shutdown(&self) {
        let handles = {
            let mut running = self
                .inner
                .running
                .lock()
                .expect("scheduler state poisoned");
            running.take()
        };
        let Some(handles) = handles else {
            return;
        };

        handles.cancel.cancel();
        if let Ok(entries) = handles.run_loop.await {
            // Keep the entry set so the scheduler can start again.
            let mut seed = self
                .inner
                .seed
                .lock()
                .expect("scheduler seed poisoned");
            *seed = entries;
        }
        handles.tracker.close();
        handles.tracker.wait().await;
        tracing::info!("scheduler stopped");
    }
}

impl Lifecycle for Cron {
    async fn start(&self, _ctx: HookCtx) -> Result<(), HookError> {
        self.start_loop();
        Ok(())
    }

    async fn stop(&self, _ctx: HookCtx) -> Result<(), HookError> {
        self.shutdown().await;
        Ok(())
    }
}

async fn run_loop(
    mut entries: Vec<Entry>,
    mut control: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Vec<Entry> {
    let now = Utc::now();
    for entry in &mut entries {
        entry.next = entry.schedule.next(now);
        if entry.next.is_none() {
            tracing::warn!(entry = %entry.name, "schedule has no future fire time");
        }
    }

    loop {
        // Sleep until the earliest pending fire; control traffic re-arms the
        // timer, so an idle scheduler just parks here.
        let wake = entries.iter().filter_map(|e| e.next).min();
        let sleep = match wake {
            Some(at) => {
                let pause = (at - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(pause)
            }
            None => tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)),
        };

        tokio::select! {
            _ = sleep => {
                let now = Utc::now();
                for entry in entries.iter_mut() {
                    let Some(at) = entry.next else { continue };
                    if at > now {
                        continue;
                    }
                    tracing::debug!(entry = %entry.name, fire = %at, "launching job");
                    tracker.spawn(entry.job.run());
                    entry.prev = Some(at);
                    entry.next = entry.schedule.next(now);
                }
            }
            message = control.recv() => match message {
                Some(Control::Add(mut entry)) => {
                    entry.next = entry.schedule.next(Utc::now());
                    if entry.next.is_none() {
                        tracing::warn!(entry = %entry.name, "schedule has no future fire time");
                    }
                    entries.push(entry);
                }
                Some(Control::Remove(id)) => {
                    entries.retain(|e| e.id != id);
                }
                Some(Control::Snapshot(reply)) => {
                    let _ = reply.send(entries.iter().map(Entry::info).collect());
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    entries
}
