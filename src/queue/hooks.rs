use super::io::{FeedbackSink, JobIo, JobStatus};
use super::{ExecutionError, NodeCache, ProgressThrottle};
use crate::engine::PortHooks;
use crate::registry::{CommandSpec, PortSpec, PortType};
use crate::value::{ArgumentValue, BoundValue, OutputValue};
use std::collections::BTreeMap;

/// Argument brought into range before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClampNotice {
    pub argument: String,
    pub requested: i64,
    pub applied: i64,
    pub min: i64,
    pub max: i64,
}

impl ClampNotice {
    pub fn message(&self) -> String {
        format!(
            "The range of --{} is {}..{}. Changing {} to {}",
            self.argument, self.min, self.max, self.requested, self.applied
        )
    }
}

/// Hooks for one job: resolves ports from the request and routes outputs
/// and progress back to the caller.
pub(crate) struct JobHooks<'a> {
    command: &'a CommandSpec,
    values: &'a BTreeMap<String, ArgumentValue>,
    io: &'a mut dyn JobIo,
    feedback: Option<&'a dyn FeedbackSink>,
    throttle: ProgressThrottle,
    cache: Option<&'a NodeCache>,
    notices: Vec<ClampNotice>,
    delivered: usize,
}

impl<'a> JobHooks<'a> {
    pub(crate) fn new(
        command: &'a CommandSpec,
        values: &'a BTreeMap<String, ArgumentValue>,
        io: &'a mut dyn JobIo,
        feedback: Option<&'a dyn FeedbackSink>,
        throttle: ProgressThrottle,
        cache: Option<&'a NodeCache>,
    ) -> Self {
        Self {
            command,
            values,
            io,
            feedback,
            throttle,
            cache,
            notices: Vec::new(),
            delivered: 0,
        }
    }

    pub(crate) fn delivered(&self) -> usize {
        self.delivered
    }

    pub(crate) fn notices(&self) -> &[ClampNotice] {
        &self.notices
    }

    /// Flushes a throttled final progress tick.
    pub(crate) fn finish(&mut self) {
        if let Some(tick) = self.throttle.flush() {
            self.push_feedback(JobStatus::Progress {
                current: tick.current,
                total: tick.total,
            });
        }
    }

    fn push_feedback(&self, status: JobStatus) {
        if let Some(feedback) = self.feedback {
            if let Err(err) = feedback.update(&status) {
                tracing::debug!(error = %err, "progress feedback update failed");
            }
        }
    }

    fn clamp(&mut self, port: &PortSpec, requested: i64) -> i64 {
        let Some(bounds) = port.bounds else {
            return requested;
        };
        if bounds.contains(requested) {
            return requested;
        }
        let notice = ClampNotice {
            argument: port.name().to_string(),
            requested,
            applied: bounds.clamp(requested),
            min: bounds.min,
            max: bounds.max,
        };
        tracing::info!(
            command = %self.command.name(),
            argument = %notice.argument,
            requested,
            applied = notice.applied,
            "clamped out-of-range argument"
        );
        if let Err(err) = self.io.notify(&notice.message()) {
            tracing::debug!(error = %err, "clamp notice delivery failed");
        }
        let applied = notice.applied;
        self.notices.push(notice);
        applied
    }
}

impl PortHooks for JobHooks<'_> {
    fn bind(&mut self, port: &PortSpec) -> Result<Option<BoundValue>, ExecutionError> {
        let declared = self
            .command
            .port(port.name())
            .ok_or_else(|| ExecutionError::UnknownPort {
                argument: port.name().to_string(),
            })?;
        let value = self
            .values
            .get(declared.name())
            .or(declared.default.as_ref());

        let Some(value) = value else {
            if declared.required {
                return Err(ExecutionError::MissingRequiredArgument {
                    argument: declared.name().to_string(),
                });
            }
            return Ok(None);
        };

        let bound = match (declared.port_type, value) {
            (PortType::String, ArgumentValue::Text(text)) => BoundValue::Text(text.clone()),
            (PortType::Integer, ArgumentValue::Integer(requested)) => {
                BoundValue::Integer(self.clamp(declared, *requested))
            }
            (PortType::Image, ArgumentValue::Image(image)) => {
                BoundValue::Image(self.io.fetch_image(image)?)
            }
            (expected, other) => {
                return Err(ExecutionError::TypeMismatch {
                    argument: declared.name().to_string(),
                    expected,
                    found: other.port_type(),
                })
            }
        };
        Ok(Some(bound))
    }

    fn emit(&mut self, output: OutputValue) -> Result<(), ExecutionError> {
        if let OutputValue::Text(text) = &output {
            if text.trim().is_empty() {
                return Err(ExecutionError::EmptyTextOutput);
            }
        }
        self.io.deliver(output)?;
        self.delivered += 1;
        Ok(())
    }

    fn report_progress(&mut self, current: u32, total: u32) {
        if let Some(tick) = self.throttle.observe(current, total) {
            self.push_feedback(JobStatus::Progress {
                current: tick.current,
                total: tick.total,
            });
        }
    }

    fn node_cache(&self) -> Option<&NodeCache> {
        self.cache
    }
}
