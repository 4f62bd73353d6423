// src/engine/manager.rs - Job scheduling, state tracking, event publication
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::events::{EventBus, ScanEvent, Subscription};
use crate::engine::job::{JobId, JobState, ScanJob};
use crate::engine::parser::{OutputParser, ParseEvent};
use crate::engine::runner::{NmapRunner, ProcessRunner};
use crate::error::{ScanError, ScanResult};
use crate::options::ScanOptions;
use crate::target::TargetResolver;

/// Trailing output lines attached to a failed job for diagnosis.
const DIAGNOSTIC_LINES: usize = 10;

/// Interval of the terminal-job retention sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Cooperative cancellation signal shared between `cancel()` and the job's
/// owning worker.
struct CancelFlag {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

struct JobEntry {
    /// Copy-on-publish snapshot. Readers always see a consistent job; the
    /// worker replaces the whole Arc after each mutation batch.
    snapshot: Arc<ScanJob>,
    cancel: Arc<CancelFlag>,
}

struct Inner {
    config: Config,
    runner: Arc<dyn ProcessRunner>,
    registry: RwLock<HashMap<JobId, JobEntry>>,
    bus: EventBus,
    semaphore: Arc<Semaphore>,
}

/// How a worker run ended.
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Orchestrates scan jobs: resolves specs, schedules jobs FIFO onto a
/// bounded worker pool, owns the job registry, and broadcasts lifecycle
/// events. All job mutation happens inside the owning worker.
pub struct ScanManager {
    inner: Arc<Inner>,
    resolver: TargetResolver,
    queue_tx: mpsc::UnboundedSender<JobId>,
}

impl ScanManager {
    /// Manager driving the real scanner binary from the configuration.
    pub fn new(config: Config) -> Self {
        let runner = Arc::new(NmapRunner::new(config.runner.grace()));
        Self::with_runner(config, runner)
    }

    /// Manager with an injected process runner.
    pub fn with_runner(config: Config, runner: Arc<dyn ProcessRunner>) -> Self {
        let workers = config.manager.effective_workers();
        info!("Scan manager starting with {} workers", workers);

        let inner = Arc::new(Inner {
            registry: RwLock::new(HashMap::new()),
            bus: EventBus::new(config.manager.subscriber_buffer),
            semaphore: Arc::new(Semaphore::new(workers)),
            runner,
            config,
        });

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(scheduler(inner.clone(), queue_rx));
        spawn_sweeper(&inner);

        Self {
            resolver: TargetResolver::new(inner.config.resolver.max_targets),
            inner,
            queue_tx,
        }
    }

    /// Submit a target spec for scanning. Each resolved target becomes one
    /// job; ids are returned in target order. Validation failures are
    /// synchronous and create no jobs.
    pub fn submit(&self, spec: &str, options: ScanOptions) -> ScanResult<Vec<JobId>> {
        options.validate()?;
        let targets = self.resolver.resolve(spec)?;

        let mut ids = Vec::with_capacity(targets.len());
        for target in targets {
            let job = ScanJob::new(target, options.clone());
            let job_id = job.id;
            let target_form = job.target.to_string();

            self.inner.registry.write().insert(
                job_id,
                JobEntry {
                    snapshot: Arc::new(job),
                    cancel: Arc::new(CancelFlag::new()),
                },
            );
            self.inner.bus.publish(&ScanEvent::JobQueued {
                job_id,
                target: target_form,
            });
            self.queue_tx
                .send(job_id)
                .map_err(|_| ScanError::UnexpectedError("scheduler is not running".to_string()))?;
            ids.push(job_id);
        }

        debug!("Submitted {} jobs for spec '{}'", ids.len(), spec);
        Ok(ids)
    }

    /// Request cancellation. A queued job goes straight to Cancelled; a
    /// running one is signalled and its worker performs the transition.
    /// Whichever terminal transition happens first wins.
    pub fn cancel(&self, job_id: JobId) -> ScanResult<()> {
        let mut registry = self.inner.registry.write();
        let entry = registry
            .get_mut(&job_id)
            .ok_or(ScanError::UnknownJob(job_id))?;

        match entry.snapshot.state {
            JobState::Queued => {
                let mut job = (*entry.snapshot).clone();
                job.mark_terminal(JobState::Cancelled);
                entry.snapshot = Arc::new(job);
                entry.cancel.request();
                drop(registry);
                info!("Job {} cancelled while queued", job_id);
                self.inner.bus.publish(&ScanEvent::JobCancelled { job_id });
                Ok(())
            }
            JobState::Running => {
                entry.cancel.request();
                debug!("Cancellation requested for running job {}", job_id);
                Ok(())
            }
            _ => Err(ScanError::AlreadyTerminal(job_id)),
        }
    }

    /// Subscribe to the event stream from this point forward.
    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    /// Latest published snapshot of one job.
    pub fn job(&self, job_id: JobId) -> ScanResult<Arc<ScanJob>> {
        self.inner
            .registry
            .read()
            .get(&job_id)
            .map(|entry| entry.snapshot.clone())
            .ok_or(ScanError::UnknownJob(job_id))
    }

    /// Snapshots of all registered jobs, oldest first.
    pub fn jobs(&self) -> Vec<Arc<ScanJob>> {
        let registry = self.inner.registry.read();
        let mut jobs: Vec<_> = registry.values().map(|e| e.snapshot.clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Evict terminal jobs older than the retention window. Runs on a timer
    /// too; exposed for deterministic callers.
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired()
    }
}

impl Drop for ScanManager {
    /// Dropping the manager ends the event stream: subscribers drain what is
    /// queued, then see end of stream.
    fn drop(&mut self) {
        self.inner.bus.close();
    }
}

impl Inner {
    fn evict_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.manager.retention())
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let now = Utc::now();
        let mut registry = self.registry.write();
        let before = registry.len();
        registry.retain(|_, entry| {
            if !entry.snapshot.state.is_terminal() {
                return true;
            }
            match entry.snapshot.finished_at {
                Some(finished) => now - finished < retention,
                None => true,
            }
        });
        let evicted = before - registry.len();
        if evicted > 0 {
            debug!("Evicted {} terminal jobs", evicted);
        }
        evicted
    }
}

/// FIFO scheduler. Acquiring the pool permit before dispatch keeps start
/// order equal to submission order.
async fn scheduler(inner: Arc<Inner>, mut queue_rx: mpsc::UnboundedReceiver<JobId>) {
    while let Some(job_id) = queue_rx.recv().await {
        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let state = inner
            .registry
            .read()
            .get(&job_id)
            .map(|entry| entry.snapshot.state);
        match state {
            Some(JobState::Queued) => {
                tokio::spawn(run_job(inner.clone(), job_id, permit));
            }
            // Cancelled while queued, or evicted; never spawn a process.
            _ => drop(permit),
        }
    }
    debug!("Scheduler stopped");
}

fn spawn_sweeper(inner: &Arc<Inner>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            inner.evict_expired();
        }
    });
}

/// Worker loop for one job. Owns all mutation of the job; the registry only
/// ever holds published snapshots.
async fn run_job(inner: Arc<Inner>, job_id: JobId, _permit: OwnedSemaphorePermit) {
    // Queued -> Running happens under the registry write lock, so a racing
    // cancel() observes either Queued (and performs the terminal transition
    // itself) or Running (and sets the flag). A terminal snapshot is never
    // overwritten here.
    let (mut job, cancel) = {
        let mut registry = inner.registry.write();
        let Some(entry) = registry.get_mut(&job_id) else {
            return;
        };
        if entry.snapshot.state != JobState::Queued {
            return;
        }
        let mut job = (*entry.snapshot).clone();
        job.mark_running();
        entry.snapshot = Arc::new(job.clone());
        (job, entry.cancel.clone())
    };
    inner.bus.publish(&ScanEvent::JobStarted { job_id });
    info!("Job {} running against {}", job_id, job.target);

    // A cancel that saw Running lands here before anything is spawned.
    if cancel.is_requested() {
        finish_job(&inner, &mut job, Outcome::Cancelled, Vec::new());
        return;
    }

    let args = job.options.to_args(&job.target);
    let timeout = inner.config.runner.timeout();
    let mut handle = match inner
        .runner
        .start(&inner.config.runner.binary, &args, timeout)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Job {} failed to launch: {}", job_id, e);
            finish_job(&inner, &mut job, Outcome::Failed(e.to_string()), Vec::new());
            return;
        }
    };

    let mut parser = OutputParser::new();
    let mut diagnostics: VecDeque<String> = VecDeque::new();
    let mut cancelled = false;
    let mut timed_out = false;

    loop {
        if cancel.is_requested() {
            cancelled = true;
            if let Err(e) = handle.cancel().await {
                warn!("Job {} cancel error: {}", job_id, e);
            }
            break;
        }

        tokio::select! {
            _ = cancel.notify.notified() => {
                cancelled = true;
                if let Err(e) = handle.cancel().await {
                    warn!("Job {} cancel error: {}", job_id, e);
                }
                break;
            }
            line = handle.next_line() => match line {
                Ok(Some(line)) => {
                    if diagnostics.len() == DIAGNOSTIC_LINES {
                        diagnostics.pop_front();
                    }
                    diagnostics.push_back(line.clone());

                    let mut results_changed = false;
                    for event in parser.feed(&line) {
                        match &event {
                            ParseEvent::Progress { percent } => {
                                inner.bus.publish(&ScanEvent::JobProgress {
                                    job_id,
                                    percent: *percent,
                                });
                            }
                            ParseEvent::UnparsedLine { line, truncated } => {
                                debug!(
                                    "Job {} unparsed line{}: {}",
                                    job_id,
                                    if *truncated { " (truncated)" } else { "" },
                                    line
                                );
                            }
                            _ => {}
                        }
                        if let Some(host) = job.apply_parse_event(&event) {
                            results_changed = true;
                            inner.bus.publish(&ScanEvent::HostDiscovered { job_id, host });
                        }
                    }
                    if results_changed {
                        publish_snapshot(&inner, &job);
                    }
                }
                Ok(None) => break,
                Err(ScanError::TimeoutExceeded { seconds }) => {
                    warn!("Job {} exceeded {}s timeout", job_id, seconds);
                    timed_out = true;
                    if let Err(e) = handle.cancel().await {
                        warn!("Job {} cancel error: {}", job_id, e);
                    }
                    break;
                }
                Err(e) => {
                    warn!("Job {} output stream error: {}", job_id, e);
                    break;
                }
            }
        }
    }

    match handle.wait().await {
        Ok(code) => job.exit_code = code,
        Err(e) => warn!("Job {} wait error: {}", job_id, e),
    }

    let diagnostics: Vec<String> = diagnostics.into();
    let outcome = if cancelled {
        Outcome::Cancelled
    } else if timed_out {
        Outcome::Failed(
            ScanError::TimeoutExceeded {
                seconds: timeout.as_secs(),
            }
            .to_string(),
        )
    } else if job.exit_code == Some(0) {
        Outcome::Completed
    } else {
        Outcome::Failed(format!(
            "scanner exited with {}",
            job.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        ))
    };
    finish_job(&inner, &mut job, outcome, diagnostics);
}

fn finish_job(inner: &Inner, job: &mut ScanJob, outcome: Outcome, diagnostics: Vec<String>) {
    let state = match outcome {
        Outcome::Completed => JobState::Completed,
        Outcome::Cancelled => JobState::Cancelled,
        Outcome::Failed(_) => JobState::Failed,
    };
    // First terminal transition wins; a queued-cancel that raced us already
    // published its event.
    if !job.mark_terminal(state) {
        return;
    }
    if let Outcome::Failed(reason) = &outcome {
        job.error = Some(reason.clone());
    }
    publish_snapshot(inner, job);

    let event = match outcome {
        Outcome::Completed => {
            info!("Job {} completed", job.id);
            ScanEvent::JobCompleted { job: job.clone() }
        }
        Outcome::Cancelled => {
            info!("Job {} cancelled", job.id);
            ScanEvent::JobCancelled { job_id: job.id }
        }
        Outcome::Failed(reason) => {
            warn!("Job {} failed: {}", job.id, reason);
            ScanEvent::JobFailed {
                job_id: job.id,
                reason,
                exit_code: job.exit_code,
                diagnostics,
            }
        }
    };
    inner.bus.publish(&event);
}

fn publish_snapshot(inner: &Inner, job: &ScanJob) {
    if let Some(entry) = inner.registry.write().get_mut(&job.id) {
        entry.snapshot = Arc::new(job.clone());
    }
}
