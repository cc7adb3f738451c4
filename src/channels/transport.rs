use crate::shared::ids::{ChatId, UserId};
use crate::value::{ImageData, ImageRef};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to send message to chat {chat}: {reason}")]
    Send { chat: String, reason: String },
    #[error("failed to edit message {message_id} in chat {chat}: {reason}")]
    Edit {
        chat: String,
        message_id: String,
        reason: String,
    },
    #[error("failed to delete message {message_id} in chat {chat}: {reason}")]
    Delete {
        chat: String,
        message_id: String,
        reason: String,
    },
    #[error("failed to fetch image {file_id}: {reason}")]
    Fetch { file_id: String, reason: String },
    #[error("transport io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
}

/// One message as delivered by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub sender_id: UserId,
    pub sender_name: String,
    /// Message text, or the caption of an image message.
    pub text: Option<String>,
    pub image: Option<ImageRef>,
}

impl InboundMessage {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// Messaging capability consumed by the dispatch core.
pub trait Transport: Send + Sync {
    /// Sends text, optionally as a reply; returns the new message id.
    fn send_text(
        &self,
        chat: &ChatId,
        reply_to: Option<&str>,
        text: &str,
    ) -> Result<String, TransportError>;

    fn edit_text(&self, chat: &ChatId, message_id: &str, text: &str)
        -> Result<(), TransportError>;

    fn delete_message(&self, chat: &ChatId, message_id: &str) -> Result<(), TransportError>;

    fn send_image(
        &self,
        chat: &ChatId,
        reply_to: Option<&str>,
        image: &ImageData,
        caption: Option<&str>,
    ) -> Result<String, TransportError>;

    fn fetch_image(&self, image: &ImageRef) -> Result<ImageData, TransportError>;
}
