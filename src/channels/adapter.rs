use super::transport::{Transport, TransportError};
use crate::queue::{ChatContext, FeedbackSink, JobIo, JobStatus};
use crate::shared::ids::ChatId;
use crate::value::{ImageData, ImageRef, OutputValue};
use std::sync::{Arc, Mutex, PoisonError};

/// Extra attempts after the first failed output delivery.
pub const MAX_OUTPUT_RETRIES: usize = 2;
pub const OUTPUT_FAILED_TEXT: &str = "Failed to send output";

pub const MONITOR_INPUT_CAPTION: &str = "Input image";
pub const MONITOR_OUTPUT_CAPTION: &str = "Output image";

/// Copy of a finished job for the monitor chat: the form report first, then
/// the fetched input images and every delivered output as replies to it.
struct MonitorCopy {
    chat_id: ChatId,
    report: String,
    thread: Option<String>,
    inputs: Vec<ImageData>,
}

/// Job I/O routed through a chat transport, replying to the invoking message.
pub struct TransportJobIo {
    transport: Arc<dyn Transport>,
    chat_id: ChatId,
    reply_to: String,
    max_retries: usize,
    monitor: Option<MonitorCopy>,
}

impl TransportJobIo {
    pub fn new(transport: Arc<dyn Transport>, origin: &ChatContext) -> Self {
        Self {
            transport,
            chat_id: origin.chat_id.clone(),
            reply_to: origin.message_id.clone(),
            max_retries: MAX_OUTPUT_RETRIES,
            monitor: None,
        }
    }

    /// Also forwards the job's inputs and outputs to `chat_id`.
    pub fn with_monitor(mut self, chat_id: ChatId, report: impl Into<String>) -> Self {
        self.monitor = Some(MonitorCopy {
            chat_id,
            report: report.into(),
            thread: None,
            inputs: Vec::new(),
        });
        self
    }

    fn send_once(&self, output: &OutputValue, reply: bool) -> Result<String, TransportError> {
        let reply_to = reply.then_some(self.reply_to.as_str());
        match output {
            OutputValue::Text(text) => self.transport.send_text(&self.chat_id, reply_to, text),
            OutputValue::Image(image) => {
                self.transport
                    .send_image(&self.chat_id, reply_to, image, None)
            }
        }
    }

    /// First attempt replies to the invoking message; retries post plainly in
    /// case the original message is gone.
    fn deliver_to_origin(&self, output: &OutputValue) -> Result<(), TransportError> {
        let mut last_error = match self.send_once(output, true) {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        for attempt in 1..=self.max_retries {
            tracing::warn!(attempt, error = %last_error, "output delivery failed, retrying");
            match self.send_once(output, false) {
                Ok(_) => return Ok(()),
                Err(err) => last_error = err,
            }
        }
        if let Err(err) = self
            .transport
            .send_text(&self.chat_id, Some(&self.reply_to), OUTPUT_FAILED_TEXT)
        {
            tracing::warn!(error = %err, "failed to send output failure notice");
        }
        Err(last_error)
    }

    /// Best effort; monitor failures never fail the job.
    fn forward_to_monitor(&mut self, output: &OutputValue) {
        let transport = &self.transport;
        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };
        if monitor.thread.is_none() {
            match transport.send_text(&monitor.chat_id, None, &monitor.report) {
                Ok(id) => monitor.thread = Some(id),
                Err(err) => {
                    tracing::debug!(chat = %monitor.chat_id, error = %err, "monitor report failed");
                    return;
                }
            }
            for image in monitor.inputs.drain(..) {
                if let Err(err) = transport.send_image(
                    &monitor.chat_id,
                    monitor.thread.as_deref(),
                    &image,
                    Some(MONITOR_INPUT_CAPTION),
                ) {
                    tracing::debug!(chat = %monitor.chat_id, error = %err, "monitor input copy failed");
                }
            }
        }
        let thread = monitor.thread.as_deref();
        let sent = match output {
            OutputValue::Text(text) => transport.send_text(&monitor.chat_id, thread, text),
            OutputValue::Image(image) => transport.send_image(
                &monitor.chat_id,
                thread,
                image,
                Some(MONITOR_OUTPUT_CAPTION),
            ),
        };
        if let Err(err) = sent {
            tracing::debug!(chat = %monitor.chat_id, error = %err, "monitor output copy failed");
        }
    }
}

impl JobIo for TransportJobIo {
    fn fetch_image(&mut self, image: &ImageRef) -> Result<ImageData, TransportError> {
        let data = self.transport.fetch_image(image)?;
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.inputs.push(data.clone());
        }
        Ok(data)
    }

    fn deliver(&mut self, output: OutputValue) -> Result<(), TransportError> {
        self.deliver_to_origin(&output)?;
        self.forward_to_monitor(&output);
        Ok(())
    }

    fn notify(&mut self, text: &str) -> Result<(), TransportError> {
        self.transport
            .send_text(&self.chat_id, Some(&self.reply_to), text)
            .map(|_| ())
    }

    fn report_error(&mut self, text: &str) -> Result<(), TransportError> {
        self.transport
            .send_text(&self.chat_id, Some(&self.reply_to), text)
            .map(|_| ())
    }
}

#[derive(Debug, Default)]
struct FeedbackState {
    message_id: Option<String>,
    started: bool,
}

/// Status message edited in place with queue position and progress. The
/// message is posted on the first update. Queue positions arriving after
/// the job started are dropped.
pub struct TransportFeedback {
    transport: Arc<dyn Transport>,
    chat_id: ChatId,
    reply_to: String,
    state: Mutex<FeedbackState>,
}

impl TransportFeedback {
    pub fn new(transport: Arc<dyn Transport>, origin: &ChatContext) -> Self {
        Self {
            transport,
            chat_id: origin.chat_id.clone(),
            reply_to: origin.message_id.clone(),
            state: Mutex::new(FeedbackState::default()),
        }
    }

    pub fn message_id(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .message_id
            .clone()
    }
}

impl FeedbackSink for TransportFeedback {
    fn update(&self, status: &JobStatus) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.started && !status.is_started() {
            return Ok(());
        }
        state.started |= status.is_started();
        let text = status.text();
        match &state.message_id {
            Some(message_id) => self.transport.edit_text(&self.chat_id, message_id, &text),
            None => {
                let message_id =
                    self.transport
                        .send_text(&self.chat_id, Some(&self.reply_to), &text)?;
                state.message_id = Some(message_id);
                Ok(())
            }
        }
    }
}
