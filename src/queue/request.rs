use super::io::{FeedbackSink, JobIo};
use crate::channels::transport::ChatKind;
use crate::registry::CommandSpec;
use crate::shared::ids::{ChatId, UserId};
use crate::value::ArgumentValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where a request came from; replies and errors go back here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatContext {
    pub chat_id: ChatId,
    pub message_id: String,
    pub kind: ChatKind,
}

/// A fully-argued invocation, consumed exactly once by the worker.
pub struct ExecutionRequest {
    pub(crate) command: Arc<CommandSpec>,
    pub(crate) invoker_id: UserId,
    pub(crate) chat: ChatContext,
    pub(crate) argument_values: BTreeMap<String, ArgumentValue>,
    pub(crate) feedback: Option<Arc<dyn FeedbackSink>>,
    pub(crate) io: Box<dyn JobIo>,
}

impl ExecutionRequest {
    pub fn new(
        command: Arc<CommandSpec>,
        invoker_id: UserId,
        chat: ChatContext,
        argument_values: BTreeMap<String, ArgumentValue>,
        io: Box<dyn JobIo>,
    ) -> Self {
        Self {
            command,
            invoker_id,
            chat,
            argument_values,
            feedback: None,
            io,
        }
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn command_name(&self) -> &str {
        self.command.name()
    }

    pub fn command(&self) -> &Arc<CommandSpec> {
        &self.command
    }

    pub fn invoker_id(&self) -> &UserId {
        &self.invoker_id
    }

    pub fn chat(&self) -> &ChatContext {
        &self.chat
    }

    pub fn argument_values(&self) -> &BTreeMap<String, ArgumentValue> {
        &self.argument_values
    }
}

impl std::fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("command", &self.command.name())
            .field("invoker_id", &self.invoker_id)
            .field("chat", &self.chat)
            .field("argument_values", &self.argument_values)
            .field("feedback", &self.feedback.is_some())
            .finish()
    }
}
