//! Single-worker FIFO job queue with per-user admission.
//!
//! A user owns at most one job that is queued or executing. The admission
//! check, the executing slot and the pending list share one lock, so two
//! concurrent submissions by the same user cannot both be admitted.

pub mod cache;
pub mod error;
pub mod hooks;
pub mod io;
pub mod progress;
pub mod request;
pub mod worker;

pub use cache::{CacheStats, NodeCache};
pub use error::{ExecutionError, QueueError};
pub use hooks::ClampNotice;
pub use io::{FeedbackSink, JobIo, JobStatus};
pub use progress::{ProgressThrottle, ProgressTick, DEFAULT_PROGRESS_EVERY};
pub use request::{ChatContext, ExecutionRequest};
pub use worker::{JobOutcome, Worker};

use crate::shared::ids::UserId;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub ticket: u64,
    /// Jobs that will run before this one, the executing job included.
    pub ahead: usize,
    /// Pending entries after admission.
    pub queue_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub ticket: u64,
    pub command_name: String,
    pub invoker_id: UserId,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub executing: Option<QueuedJob>,
    pub pending: Vec<QueuedJob>,
}

struct QueueEntry {
    ticket: u64,
    request: ExecutionRequest,
    enqueued_at: Instant,
}

impl QueueEntry {
    fn describe(&self, position: usize) -> QueuedJob {
        QueuedJob {
            ticket: self.ticket,
            command_name: self.request.command_name().to_string(),
            invoker_id: self.request.invoker_id.clone(),
            position,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueEntry>,
    executing: Option<QueuedJob>,
    next_ticket: u64,
    closed: bool,
}

impl QueueState {
    fn owns_job(&self, invoker: &UserId) -> bool {
        self.executing
            .as_ref()
            .is_some_and(|job| &job.invoker_id == invoker)
            || self
                .pending
                .iter()
                .any(|entry| &entry.request.invoker_id == invoker)
    }

    fn running(&self) -> usize {
        usize::from(self.executing.is_some())
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.executing.is_none()
    }
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    idle: Condvar,
    feedback: FeedbackRelay,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Holds the executing slot; dropping it releases the slot.
pub(crate) struct ExecutionSlot<'q> {
    queue: &'q JobQueue,
    ticket: u64,
}

impl Drop for ExecutionSlot<'_> {
    fn drop(&mut self) {
        self.queue.finish(self.ticket);
    }
}

/// A job handed to the worker.
pub(crate) struct ActiveJob<'q> {
    pub(crate) slot: ExecutionSlot<'q>,
    pub(crate) ticket: u64,
    pub(crate) request: ExecutionRequest,
    pub(crate) waited: Duration,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a request at the tail unless its invoker already owns a job.
    pub fn submit(&self, request: ExecutionRequest) -> Result<Accepted, QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.owns_job(&request.invoker_id) {
            tracing::info!(
                invoker = %request.invoker_id,
                command = %request.command_name(),
                "rejected duplicate in-flight submission"
            );
            return Err(QueueError::DuplicateInFlight {
                invoker: request.invoker_id.clone(),
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let ahead = state.pending.len() + state.running();
        tracing::info!(
            ticket,
            invoker = %request.invoker_id,
            command = %request.command_name(),
            ahead,
            "job queued"
        );
        state.pending.push_back(QueueEntry {
            ticket,
            request,
            enqueued_at: Instant::now(),
        });
        let queue_length = state.pending.len();
        drop(state);
        self.ready.notify_one();
        Ok(Accepted {
            ticket,
            ahead,
            queue_length,
        })
    }

    pub fn is_in_flight(&self, invoker: &UserId) -> bool {
        self.lock().owns_job(invoker)
    }

    /// Removes a not-yet-started job. Executing jobs run to completion.
    pub fn withdraw(&self, invoker: &UserId) -> Option<u64> {
        let mut state = self.lock();
        let index = state
            .pending
            .iter()
            .position(|entry| &entry.request.invoker_id == invoker)?;
        let entry = state.pending.remove(index)?;
        self.feedback.push(feedback_updates(&state));
        let idle = state.is_idle();
        drop(state);
        tracing::info!(ticket = entry.ticket, invoker = %invoker, "queued job withdrawn");
        if idle {
            self.idle.notify_all();
        }
        Some(entry.ticket)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            executing: state.executing.clone(),
            pending: state
                .pending
                .iter()
                .enumerate()
                .map(|(position, entry)| entry.describe(position))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops admission and wakes the worker. Pending jobs stay drainable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Blocks until nothing is pending or executing.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .idle
            .wait_timeout_while(state, timeout, |state| !state.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
        state.is_idle()
    }

    /// Pops the head job, waiting up to `timeout` for one to arrive.
    pub(crate) fn next_job(&self, timeout: Duration) -> Option<ActiveJob<'_>> {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |state| {
                state.pending.is_empty() && !state.closed
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.executing.is_some() {
            return None;
        }
        let entry = state.pending.pop_front()?;
        state.executing = Some(entry.describe(0));
        self.feedback.push(feedback_updates(&state));
        drop(state);

        Some(ActiveJob {
            slot: ExecutionSlot {
                queue: self,
                ticket: entry.ticket,
            },
            ticket: entry.ticket,
            waited: entry.enqueued_at.elapsed(),
            request: entry.request,
        })
    }

    fn finish(&self, ticket: u64) {
        let mut state = self.lock();
        if state
            .executing
            .as_ref()
            .is_some_and(|job| job.ticket == ticket)
        {
            state.executing = None;
        }
        let idle = state.is_idle();
        drop(state);
        self.ready.notify_one();
        if idle {
            self.idle.notify_all();
        }
    }
}

type FeedbackUpdate = (Arc<dyn FeedbackSink>, JobStatus);

fn feedback_updates(state: &QueueState) -> Vec<FeedbackUpdate> {
    let running = state.running();
    state
        .pending
        .iter()
        .enumerate()
        .filter_map(|(position, entry)| {
            entry.request.feedback.clone().map(|sink| {
                (
                    sink,
                    JobStatus::Queued {
                        ahead: position + running,
                    },
                )
            })
        })
        .collect()
}

/// Delivers position refreshes off the queue thread, one batch at a time in
/// the order the queue changed. Failures are logged and dropped.
#[derive(Default)]
struct FeedbackRelay {
    sender: Mutex<Option<Sender<Vec<FeedbackUpdate>>>>,
}

impl FeedbackRelay {
    /// Called with the queue lock held, so batches keep queue order.
    fn push(&self, updates: Vec<FeedbackUpdate>) {
        if updates.is_empty() {
            return;
        }
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let updates = match sender.as_ref() {
            Some(tx) => match tx.send(updates) {
                Ok(()) => return,
                Err(mpsc::SendError(updates)) => updates,
            },
            None => updates,
        };
        let (tx, rx) = mpsc::channel::<Vec<FeedbackUpdate>>();
        let spawned = thread::Builder::new()
            .name("queue-feedback".to_string())
            .spawn(move || {
                for batch in rx {
                    for (sink, status) in batch {
                        if let Err(err) = sink.update(&status) {
                            tracing::debug!(error = %err, "queue position update failed");
                        }
                    }
                }
            });
        match spawned {
            Ok(_) => {
                let _ = tx.send(updates);
                *sender = Some(tx);
            }
            Err(err) => {
                *sender = None;
                tracing::debug!(error = %err, "failed to spawn queue feedback thread");
            }
        }
    }
}
