use super::hooks::{ClampNotice, JobHooks};
use super::{ActiveJob, ExecutionError, JobQueue, JobStatus, NodeCache, ProgressThrottle};
use crate::engine::WorkflowExecutor;
use crate::runtime::error_log::{ErrorLog, ErrorReport};
use crate::shared::ids::UserId;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const NEXT_JOB_POLL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct JobOutcome {
    pub ticket: u64,
    pub command_name: String,
    pub invoker_id: UserId,
    pub outputs_delivered: usize,
    pub clamped: Vec<ClampNotice>,
    pub waited: Duration,
    pub elapsed: Duration,
    pub error: Option<ExecutionError>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs queued jobs one at a time, in admission order.
pub struct Worker {
    queue: Arc<JobQueue>,
    executor: Arc<dyn WorkflowExecutor>,
    cache: Option<Arc<NodeCache>>,
    progress_every: u32,
    error_log: Option<ErrorLog>,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>, executor: Arc<dyn WorkflowExecutor>) -> Self {
        Self {
            queue,
            executor,
            cache: None,
            progress_every: super::DEFAULT_PROGRESS_EVERY,
            error_log: None,
        }
    }

    pub fn with_node_cache(mut self, cache: Arc<NodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_progress_every(mut self, every: u32) -> Self {
        self.progress_every = every;
        self
    }

    pub fn with_error_log(mut self, error_log: ErrorLog) -> Self {
        self.error_log = Some(error_log);
        self
    }

    /// Worker loop; returns when `stop` is set or the closed queue drains.
    pub fn run(&self, stop: &AtomicBool) {
        tracing::info!("job worker started");
        while !stop.load(Ordering::Relaxed) {
            if self.run_next(NEXT_JOB_POLL).is_none()
                && self.queue.is_closed()
                && self.queue.is_empty()
            {
                break;
            }
        }
        tracing::info!("job worker stopped");
    }

    pub fn run_next(&self, timeout: Duration) -> Option<JobOutcome> {
        let job = self.queue.next_job(timeout)?;
        Some(self.execute(job))
    }

    /// Runs every job pending right now.
    pub fn drain(&self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_next(Duration::ZERO) {
            outcomes.push(outcome);
        }
        outcomes
    }

    fn execute(&self, job: ActiveJob<'_>) -> JobOutcome {
        let ActiveJob {
            slot,
            ticket,
            request,
            waited,
        } = job;
        let started = Instant::now();
        let command = request.command.clone();
        let mut io = request.io;
        let feedback = request.feedback;
        tracing::info!(
            ticket,
            command = %command.name(),
            invoker = %request.invoker_id,
            waited_ms = waited.as_millis() as u64,
            "job started"
        );
        if let Some(sink) = feedback.as_deref() {
            if let Err(err) = sink.update(&JobStatus::Executing) {
                tracing::debug!(error = %err, "executing feedback update failed");
            }
        }

        let mut hooks = JobHooks::new(
            &command,
            &request.argument_values,
            io.as_mut(),
            feedback.as_deref(),
            ProgressThrottle::new(self.progress_every),
            self.cache.as_deref(),
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.executor
                .execute(&command.executable, command.ports(), &mut hooks)
        }))
        .unwrap_or_else(|payload| Err(ExecutionError::Panicked(panic_message(payload.as_ref()))));
        hooks.finish();
        let outputs_delivered = hooks.delivered();
        let clamped = hooks.notices().to_vec();
        drop(hooks);

        let error = result.err();
        if let Some(err) = &error {
            tracing::warn!(ticket, command = %command.name(), error = %err, "job failed");
            if let Err(report_err) = io.report_error(&format!("Error: {err}")) {
                tracing::warn!(error = %report_err, "failed to report job error to caller");
            }
            if let Some(log) = &self.error_log {
                let report = ErrorReport {
                    chat_id: &request.chat.chat_id,
                    user_id: &request.invoker_id,
                    command_name: command.name(),
                    arguments: &request.argument_values,
                    error: &err.to_string(),
                };
                match log.record(&report) {
                    Ok(path) => tracing::debug!(path = %path.display(), "job error recorded"),
                    Err(log_err) => tracing::warn!(error = %log_err, "failed to write error report"),
                }
            }
        } else {
            tracing::info!(
                ticket,
                command = %command.name(),
                outputs = outputs_delivered,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job finished"
            );
        }
        drop(slot);

        JobOutcome {
            ticket,
            command_name: command.name().to_string(),
            invoker_id: request.invoker_id,
            outputs_delivered,
            clamped,
            waited,
            elapsed: started.elapsed(),
            error,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}
