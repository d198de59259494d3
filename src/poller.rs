//! Remote task polling
//!
//! [`PollState`] is the pure transition function: it folds query replies
//! into status, progress and backoff. [`TaskPoller`] drives it from one
//! `tokio::select!` loop with three timers:
//!
//! - **poll**: the next status query, re-armed with the current interval
//!   after every reply (the first query fires immediately)
//! - **elapsed**: a one-second display ticker
//! - **timeout**: the overall deadline, which wins even over a query in flight
//!
//! A single atomic terminal flag decides which outcome (completion, error
//! or an explicit [`PollHandle::stop`]) gets to fire; everything else is
//! discarded.

use async_trait::async_trait;
use futures::future::{BoxFuture, OptionFuture};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::config::PollConfig;
use crate::error::{Error, Result};
use crate::types::{TaskId, TaskSnapshot, TaskStatus};

/// Progress shown once the task is known to be queued
const PENDING_PROGRESS: f64 = 10.0;
/// Ceiling for estimated progress while running
const RUNNING_PROGRESS_CAP: f64 = 90.0;
/// Upper bound (exclusive) of the random increment per RUNNING reply
const RUNNING_PROGRESS_STEP: f64 = 15.0;

/// Source of task status replies
#[async_trait]
pub trait TaskQuery: Send + Sync {
    /// Fetch the current state of `task_id`
    async fn query(&self, task_id: &TaskId) -> Result<TaskSnapshot>;
}

/// Successful end of a task
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletion {
    /// Result video
    pub video_url: String,
    /// Video duration in seconds, when the vendor reports it
    pub duration: Option<f64>,
}

/// What the poller currently believes about a task
#[derive(Clone, Debug, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    /// Last status seen
    pub status: TaskStatus,
    /// Estimated progress in `[0, 100]`
    pub progress: f64,
    /// Whole seconds since polling started
    pub elapsed_secs: u64,
    /// Failed queries since the last successful one
    pub consecutive_failures: u32,
    /// Delay before the next query, in milliseconds
    pub interval_ms: u64,
}

/// Result of folding one reply into [`PollState`]
#[derive(Debug)]
pub enum PollStep {
    /// Keep polling
    Continue,
    /// The task produced a video
    Complete(TaskCompletion),
    /// The task failed or the poller gave up
    Fail(Error),
}

/// Poller state without any timers attached
#[derive(Clone, Debug)]
pub struct PollState {
    status: TaskStatus,
    progress: f64,
    elapsed_secs: u64,
    failures: u32,
    interval: Duration,
    max_interval: Duration,
    max_failures: u32,
    backoff_factor: f64,
}

impl PollState {
    /// Initial state: PENDING, no progress, nothing elapsed
    pub fn new(config: &PollConfig) -> Self {
        Self {
            status: TaskStatus::Pending,
            progress: 0.0,
            elapsed_secs: 0,
            failures: 0,
            interval: config.initial_interval,
            max_interval: config.max_interval,
            max_failures: config.max_failures.max(1),
            backoff_factor: config.backoff_factor,
        }
    }

    /// Fold a query reply into the state
    ///
    /// `increment` is the progress added for a RUNNING reply; the driver
    /// draws it uniformly from `[0, 15)`.
    pub fn apply(&mut self, reply: Result<TaskSnapshot>, increment: f64) -> PollStep {
        let snapshot = match reply {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.failures += 1;
                if self.failures >= self.max_failures {
                    return PollStep::Fail(Error::NetworkExhausted {
                        attempts: self.failures,
                        last_error: e.to_string(),
                    });
                }
                self.interval = self
                    .interval
                    .mul_f64(self.backoff_factor)
                    .min(self.max_interval);
                return PollStep::Continue;
            }
        };

        self.failures = 0;
        self.status = snapshot.status;
        match snapshot.status {
            TaskStatus::Pending => {
                self.progress = self.progress.max(PENDING_PROGRESS);
                PollStep::Continue
            }
            TaskStatus::Running => {
                let next = (self.progress + increment.max(0.0)).min(RUNNING_PROGRESS_CAP);
                self.progress = self.progress.max(next);
                PollStep::Continue
            }
            TaskStatus::Succeeded => match snapshot.video_url {
                Some(video_url) => {
                    self.progress = 100.0;
                    PollStep::Complete(TaskCompletion {
                        video_url,
                        duration: snapshot.duration,
                    })
                }
                None => PollStep::Fail(Error::TaskFailed(
                    "task succeeded without a video URL".to_string(),
                )),
            },
            TaskStatus::Failed => PollStep::Fail(Error::TaskFailed(
                snapshot
                    .error
                    .unwrap_or_else(|| "task failed".to_string()),
            )),
        }
    }

    /// Advance the display clock by one second
    pub fn tick_elapsed(&mut self) {
        self.elapsed_secs += 1;
    }

    /// Delay before the next query
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Current view for observers
    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            status: self.status,
            progress: self.progress,
            elapsed_secs: self.elapsed_secs,
            consecutive_failures: self.failures,
            interval_ms: self.interval.as_millis() as u64,
        }
    }
}

/// Receives poller events
///
/// Exactly one of `on_complete` / `on_error` fires per poll unless the
/// handle is stopped first, in which case neither does.
pub trait PollObserver: Send + Sync {
    /// State changed or a second elapsed
    fn on_update(&self, _snapshot: &PollSnapshot) {}

    /// The task succeeded
    fn on_complete(&self, _completion: &TaskCompletion) {}

    /// The task failed, timed out or could not be queried
    fn on_error(&self, _error: &Error) {}
}

/// Observer that ignores every event
pub struct NoopObserver;

impl PollObserver for NoopObserver {}

/// Starts pollers for tasks
#[derive(Clone)]
pub struct TaskPoller {
    query: Arc<dyn TaskQuery>,
    config: PollConfig,
}

impl TaskPoller {
    /// Create a poller using `query` for status replies
    pub fn new(query: Arc<dyn TaskQuery>, config: PollConfig) -> Self {
        Self { query, config }
    }

    /// Start polling `task_id` in a background task
    pub fn start(&self, task_id: TaskId, observer: Arc<dyn PollObserver>) -> PollHandle {
        let state = PollState::new(&self.config);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let cancel = CancellationToken::new();
        let terminal = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            query: Arc::clone(&self.query),
            timeout: self.config.timeout,
            task_id,
            observer,
            cancel: cancel.clone(),
            terminal: Arc::clone(&terminal),
            snapshot_tx,
        };
        let join = tokio::spawn(driver.run(state));

        PollHandle {
            cancel,
            terminal,
            snapshot: snapshot_rx,
            join,
        }
    }

    /// Poll `task_id` to the end without an observer
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskCompletion> {
        self.start(task_id, Arc::new(NoopObserver))
            .outcome()
            .await
            .unwrap_or_else(|| Err(Error::Other("polling was stopped".to_string())))
    }
}

/// Control and observation of one running poller
pub struct PollHandle {
    cancel: CancellationToken,
    terminal: Arc<AtomicBool>,
    snapshot: watch::Receiver<PollSnapshot>,
    join: JoinHandle<Option<Result<TaskCompletion>>>,
}

impl PollHandle {
    /// Stop polling; no callback fires afterwards
    ///
    /// Returns `false` if the poller had already stopped or finished.
    pub fn stop(&self) -> bool {
        let stopped = self
            .terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.cancel.cancel();
        stopped
    }

    /// Whether polling has ended for any reason
    pub fn is_finished(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> PollSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.snapshot.clone()
    }

    /// Wait for the poller to end
    ///
    /// `None` when it was stopped before reaching an outcome.
    pub async fn outcome(self) -> Option<Result<TaskCompletion>> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => Some(Err(Error::Other(format!("poller task failed: {e}")))),
        }
    }
}

struct Driver {
    query: Arc<dyn TaskQuery>,
    timeout: Duration,
    task_id: TaskId,
    observer: Arc<dyn PollObserver>,
    cancel: CancellationToken,
    terminal: Arc<AtomicBool>,
    snapshot_tx: watch::Sender<PollSnapshot>,
}

impl Driver {
    async fn run(self, mut state: PollState) -> Option<Result<TaskCompletion>> {
        let started = Instant::now();
        tracing::debug!(task_id = %self.task_id, "polling started");

        let timeout = tokio::time::sleep(self.timeout);
        let next_poll = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(timeout, next_poll);

        let mut elapsed = tokio::time::interval_at(
            started + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        elapsed.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut in_flight: Option<BoxFuture<'static, Result<TaskSnapshot>>> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::debug!(task_id = %self.task_id, "polling stopped");
                    return None;
                }

                _ = &mut timeout => {
                    return self.finish(Err(Error::Timeout { after: self.timeout }));
                }

                Some(reply) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    in_flight = None;
                    if let Err(e) = &reply {
                        tracing::warn!(task_id = %self.task_id, error = %e, "status query failed");
                    }
                    let increment = rand::thread_rng().gen_range(0.0..RUNNING_PROGRESS_STEP);
                    let step = state.apply(reply, increment);
                    self.publish(&state);

                    match step {
                        PollStep::Continue => {
                            next_poll.as_mut().reset(Instant::now() + state.interval());
                        }
                        PollStep::Complete(completion) => return self.finish(Ok(completion)),
                        PollStep::Fail(error) => return self.finish(Err(error)),
                    }
                }

                _ = &mut next_poll, if in_flight.is_none() => {
                    let query = Arc::clone(&self.query);
                    let task_id = self.task_id.clone();
                    in_flight = Some(Box::pin(async move { query.query(&task_id).await }));
                    // Parked until the reply re-arms it
                    next_poll.as_mut().reset(Instant::now() + self.timeout);
                }

                _ = elapsed.tick() => {
                    state.tick_elapsed();
                    self.publish(&state);
                }
            }
        }
    }

    fn publish(&self, state: &PollState) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        let snapshot = state.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        self.observer.on_update(&snapshot);
    }

    /// Claim the terminal flag and fire the matching callback
    fn finish(&self, outcome: Result<TaskCompletion>) -> Option<Result<TaskCompletion>> {
        if self
            .terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        match &outcome {
            Ok(completion) => {
                tracing::info!(
                    task_id = %self.task_id,
                    video_url = %completion.video_url,
                    duration = ?completion.duration,
                    "task succeeded"
                );
                self.observer.on_complete(completion);
            }
            Err(error) => {
                tracing::error!(task_id = %self.task_id, error = %error, "task polling failed");
                self.observer.on_error(error);
            }
        }
        Some(outcome)
    }
}
