use crate::channels::transport::TransportError;
use crate::value::{ImageData, ImageRef, OutputValue};

/// Caller-supplied I/O for one job: input fetch, output delivery, error channel.
pub trait JobIo: Send {
    fn fetch_image(&mut self, image: &ImageRef) -> Result<ImageData, TransportError>;

    fn deliver(&mut self, output: OutputValue) -> Result<(), TransportError>;

    /// Non-fatal notices such as clamped arguments.
    fn notify(&mut self, text: &str) -> Result<(), TransportError>;

    fn report_error(&mut self, text: &str) -> Result<(), TransportError>;
}

/// Job status shown to the invoker while waiting and running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued { ahead: usize },
    Executing,
    Progress { current: u32, total: u32 },
}

impl JobStatus {
    pub fn is_started(&self) -> bool {
        !matches!(self, Self::Queued { .. })
    }

    pub fn text(&self) -> String {
        match *self {
            Self::Queued { ahead } => format!("Queued: {ahead} ahead of you"),
            Self::Executing => "Executing...".to_string(),
            Self::Progress { current, total } => {
                let percent = if total == 0 {
                    0
                } else {
                    u64::from(current.min(total)) * 100 / u64::from(total)
                };
                format!("Executing... {percent}% ({current}/{total})")
            }
        }
    }
}

/// Live status display (queue position and progress), edited in place.
pub trait FeedbackSink: Send + Sync {
    fn update(&self, status: &JobStatus) -> Result<(), TransportError>;
}
