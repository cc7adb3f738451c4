//! Routes inbound chat messages to built-ins, the session manager and the
//! job queue.

use crate::channels::adapter::{TransportFeedback, TransportJobIo};
use crate::channels::command_line::{parse_command_line, FREE_TEXT_ARGUMENT};
use crate::channels::policy::{AccessPolicy, AllowAll};
use crate::channels::transport::{ChatKind, InboundMessage, Transport};
use crate::queue::{Accepted, ChatContext, FeedbackSink, JobQueue, JobStatus, QueueError};
use crate::registry::{CommandSpec, PortType, WorkflowRegistry};
use crate::session::{
    CancelReason, ExpiredSession, FilledForm, InboundValue, Prompt, SessionError, SessionLookup,
    SessionManager, StartOutcome, SubmitOutcome,
};
use crate::shared::ids::{ChatId, SessionId};
use crate::value::{ArgumentValue, ImageRef};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinCommand {
    GetIds,
    Help,
    Cancel,
}

impl BuiltinCommand {
    pub const ALL: [Self; 3] = [Self::GetIds, Self::Help, Self::Cancel];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|builtin| builtin.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GetIds => "get_ids",
            Self::Help => "help",
            Self::Cancel => "cancel",
        }
    }

    fn summary(self) -> &'static str {
        match self {
            Self::GetIds => "show this chat's and your ids",
            Self::Help => "list commands",
            Self::Cancel => "drop your open form or queued job",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownCommand { command: String },
    DuplicateInFlight,
    InvalidArgument { argument: String, reason: String },
    QueueClosed,
    Internal { reason: String },
}

impl Rejection {
    pub fn message(&self) -> String {
        match self {
            Self::UnknownCommand { command } => {
                format!("Unknown command /{command}. Send /help for the list")
            }
            Self::DuplicateInFlight => {
                "You already have a job queued or running. Wait for it to finish".to_string()
            }
            Self::InvalidArgument { argument, reason } => {
                format!("Invalid --{argument}: {reason}")
            }
            Self::QueueClosed => "Not accepting jobs right now".to_string(),
            Self::Internal { reason } => format!("Error: {reason}"),
        }
    }
}

impl From<SessionError> for Rejection {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnknownCommand { command } => Self::UnknownCommand { command },
            SessionError::TypeMismatch {
                argument, expected, ..
            } => Self::InvalidArgument {
                argument,
                reason: format!("expected {expected}"),
            },
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Accepted(Accepted),
    NeedsMoreInput(Prompt),
    Rejected(Rejection),
}

#[derive(Debug, Clone)]
pub enum ContinueOutcome {
    NeedsMoreInput(Prompt),
    Completed(Accepted),
    Rejected(Rejection),
    Cancelled(CancelReason),
    NotFound,
    /// Reply came from someone other than the session owner.
    NotOwner,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Invoked(InvokeOutcome),
    Continued(ContinueOutcome),
    Builtin(BuiltinCommand),
    ImageMenu,
    Ignored,
    Denied,
}

impl DispatchOutcome {
    /// Admission, when this message put a job on the queue.
    pub fn admitted(&self) -> Option<Accepted> {
        match self {
            Self::Invoked(InvokeOutcome::Accepted(accepted))
            | Self::Continued(ContinueOutcome::Completed(accepted)) => Some(*accepted),
            _ => None,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<WorkflowRegistry>,
    sessions: Arc<SessionManager>,
    queue: Arc<JobQueue>,
    transport: Arc<dyn Transport>,
    access: Box<dyn AccessPolicy>,
    monitor_chat: Option<ChatId>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        sessions: Arc<SessionManager>,
        queue: Arc<JobQueue>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            registry,
            sessions,
            queue,
            transport,
            access: Box::new(AllowAll),
            monitor_chat: None,
        }
    }

    pub fn with_access_policy(mut self, access: Box<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    /// Copies of every completed form and its outputs go to `chat_id`.
    pub fn with_monitor_chat(mut self, chat_id: ChatId) -> Self {
        self.monitor_chat = Some(chat_id);
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn handle(&self, message: &InboundMessage) -> DispatchOutcome {
        if !self.access.allows(message) {
            tracing::debug!(
                chat = %message.chat_id,
                user = %message.sender_id,
                "dropping message from unlisted chat"
            );
            return DispatchOutcome::Denied;
        }

        if let Some(parsed) = parse_command_line(message.text()) {
            if let Some(builtin) = BuiltinCommand::parse(&parsed.name) {
                self.run_builtin(builtin, message);
                return DispatchOutcome::Builtin(builtin);
            }
            return DispatchOutcome::Invoked(self.invoke(
                &parsed.name,
                parsed.arguments,
                message,
            ));
        }

        match self.sessions.lookup(&message.sender_id, &message.chat_id) {
            Some(SessionLookup::Open(session_id)) => {
                return DispatchOutcome::Continued(self.continue_session(
                    &session_id,
                    InboundValue::from_message(message),
                    message,
                ));
            }
            Some(SessionLookup::Expired(session)) => {
                self.notify_expired(&session);
                return DispatchOutcome::Continued(ContinueOutcome::Cancelled(
                    CancelReason::Expired,
                ));
            }
            None => {}
        }

        if message.has_image() {
            self.reply(message, &self.image_menu_text());
            return DispatchOutcome::ImageMenu;
        }
        DispatchOutcome::Ignored
    }

    /// Resolves an invocation into an admitted job, an opened session or a
    /// rejection. The caller is told about every outcome.
    pub fn invoke(
        &self,
        command_name: &str,
        raw_arguments: BTreeMap<String, String>,
        message: &InboundMessage,
    ) -> InvokeOutcome {
        let Some(command) = self.registry.lookup(command_name) else {
            return InvokeOutcome::Rejected(self.reject(
                message,
                Rejection::UnknownCommand {
                    command: command_name.to_string(),
                },
            ));
        };
        if self.queue.is_in_flight(&message.sender_id) {
            return InvokeOutcome::Rejected(self.reject(message, Rejection::DuplicateInFlight));
        }
        let values = match typed_arguments(&command, raw_arguments, message.image.as_ref()) {
            Ok(values) => values,
            Err(rejection) => return InvokeOutcome::Rejected(self.reject(message, rejection)),
        };

        tracing::info!(
            command = %command.name(),
            user = %message.sender_id,
            chat = %message.chat_id,
            supplied = values.len(),
            "command invoked"
        );
        let started =
            self.sessions
                .start_with(command, values, chat_context(message), message.sender_id.clone());
        match started {
            Ok(StartOutcome::Ready(form)) => match self.submit_form(form) {
                Ok(accepted) => InvokeOutcome::Accepted(accepted),
                Err(rejection) => InvokeOutcome::Rejected(rejection),
            },
            Ok(StartOutcome::NeedsInput(prompt)) => {
                self.prompt(message, &prompt);
                InvokeOutcome::NeedsMoreInput(prompt)
            }
            Err(err) => InvokeOutcome::Rejected(self.reject(message, err.into())),
        }
    }

    pub fn continue_session(
        &self,
        session_id: &SessionId,
        value: InboundValue,
        message: &InboundMessage,
    ) -> ContinueOutcome {
        match self.sessions.submit(session_id, &message.sender_id, value) {
            Ok(SubmitOutcome::NeedsInput(prompt)) => {
                self.prompt(message, &prompt);
                ContinueOutcome::NeedsMoreInput(prompt)
            }
            Ok(SubmitOutcome::Completed(mut form)) => {
                let prompts = std::mem::take(&mut form.prompt_messages);
                self.delete_prompts(&form.origin.chat_id, &prompts);
                self.reply(message, &form.summary());
                match self.submit_form(form) {
                    Ok(accepted) => ContinueOutcome::Completed(accepted),
                    Err(rejection) => ContinueOutcome::Rejected(rejection),
                }
            }
            Ok(SubmitOutcome::Cancelled {
                reason,
                prompt_messages,
            }) => {
                self.delete_prompts(&message.chat_id, &prompt_messages);
                self.reply(message, &reason.message());
                ContinueOutcome::Cancelled(reason)
            }
            Err(SessionError::NotOwner { .. }) => ContinueOutcome::NotOwner,
            Err(SessionError::NotFound { .. }) => {
                self.reply(message, "Form not found. Start again with the command");
                ContinueOutcome::NotFound
            }
            Err(err) => ContinueOutcome::Rejected(self.reject(message, err.into())),
        }
    }

    /// Notifies owners of sessions that timed out; returns how many expired.
    pub fn expire_sessions(&self) -> usize {
        let expired = self.sessions.sweep_expired();
        for session in &expired {
            self.notify_expired(session);
        }
        expired.len()
    }

    fn notify_expired(&self, session: &ExpiredSession) {
        self.delete_prompts(&session.origin.chat_id, &session.prompt_messages);
        let text = CancelReason::Expired.message();
        if let Err(err) = self.transport.send_text(
            &session.origin.chat_id,
            Some(&session.origin.message_id),
            &text,
        ) {
            tracing::debug!(session = %session.session_id, error = %err, "expiry notice failed");
        }
    }

    fn submit_form(&self, form: FilledForm) -> Result<Accepted, Rejection> {
        let origin = form.origin.clone();
        let mut io = TransportJobIo::new(self.transport.clone(), &origin);
        if let Some(monitor_chat) = &self.monitor_chat {
            let report = format!("from {}\n{}", form.owner_id, form.summary());
            io = io.with_monitor(monitor_chat.clone(), report);
        }
        let mut request = form.into_request(Box::new(io));
        let feedback = match origin.kind {
            ChatKind::Private => {
                let sink = Arc::new(TransportFeedback::new(self.transport.clone(), &origin));
                request = request.with_feedback(sink.clone());
                Some(sink)
            }
            ChatKind::Group => None,
        };

        let rejection = match self.queue.submit(request) {
            Ok(accepted) => {
                let status = JobStatus::Queued {
                    ahead: accepted.ahead,
                };
                match &feedback {
                    Some(sink) => {
                        if let Err(err) = sink.update(&status) {
                            tracing::debug!(error = %err, "queue feedback failed");
                        }
                    }
                    None if accepted.ahead > 0 => self.send(&origin, &status.text()),
                    None => {}
                }
                return Ok(accepted);
            }
            Err(QueueError::DuplicateInFlight { .. }) => Rejection::DuplicateInFlight,
            Err(QueueError::Closed) => Rejection::QueueClosed,
        };
        self.send(&origin, &rejection.message());
        Err(rejection)
    }

    fn run_builtin(&self, builtin: BuiltinCommand, message: &InboundMessage) {
        let text = match builtin {
            BuiltinCommand::GetIds => format!(
                "chat id: {}\nuser id: {}",
                message.chat_id, message.sender_id
            ),
            BuiltinCommand::Help => self.help_text(),
            BuiltinCommand::Cancel => self.cancel_for(message),
        };
        self.reply(message, &text);
    }

    fn cancel_for(&self, message: &InboundMessage) -> String {
        let session = match self.sessions.lookup(&message.sender_id, &message.chat_id) {
            Some(SessionLookup::Open(session_id)) => self.sessions.close(&session_id),
            Some(SessionLookup::Expired(expired)) => {
                self.delete_prompts(&message.chat_id, &expired.prompt_messages);
                None
            }
            None => None,
        };
        if let Some(prompts) = &session {
            self.delete_prompts(&message.chat_id, prompts);
        }
        let withdrawn = self.queue.withdraw(&message.sender_id);
        match (session, withdrawn) {
            (Some(_), Some(_)) => "Form cancelled and queued job removed".to_string(),
            (Some(_), None) => "Form cancelled".to_string(),
            (None, Some(_)) => "Queued job removed".to_string(),
            (None, None) => "Nothing to cancel".to_string(),
        }
    }

    pub fn help_text(&self) -> String {
        let table = self.registry.table();
        let mut lines = Vec::new();
        for command in table.values().filter(|command| !command.hidden) {
            lines.push(format!("{} - {}", command.usage(), command.display_name));
        }
        if lines.is_empty() {
            lines.push("No workflows are loaded".to_string());
        }
        for builtin in BuiltinCommand::ALL {
            lines.push(format!("/{} - {}", builtin.name(), builtin.summary()));
        }
        lines.join("\n")
    }

    pub fn image_menu_text(&self) -> String {
        let table = self.registry.table();
        let commands: Vec<String> = table
            .values()
            .filter(|command| !command.hidden && command.accepts_image())
            .map(|command| format!("/{} - {}", command.name(), command.display_name))
            .collect();
        if commands.is_empty() {
            return "No command accepts images".to_string();
        }
        format!(
            "Send the image again with one of these commands as caption:\n{}",
            commands.join("\n")
        )
    }

    fn reply(&self, message: &InboundMessage, text: &str) -> Option<String> {
        match self
            .transport
            .send_text(&message.chat_id, Some(&message.message_id), text)
        {
            Ok(message_id) => Some(message_id),
            Err(err) => {
                tracing::warn!(chat = %message.chat_id, error = %err, "reply failed");
                None
            }
        }
    }

    /// Sends the prompt and ties its message to the session, so it is cleaned
    /// up when the form closes. A session that closed meanwhile gets the
    /// prompt removed right away.
    fn prompt(&self, message: &InboundMessage, prompt: &Prompt) {
        let Some(message_id) = self.reply(message, &prompt.text) else {
            return;
        };
        if !self.sessions.record_prompt(&prompt.session_id, message_id.clone()) {
            self.delete_prompts(&message.chat_id, &[message_id]);
        }
    }

    fn delete_prompts(&self, chat_id: &ChatId, message_ids: &[String]) {
        for message_id in message_ids {
            if let Err(err) = self.transport.delete_message(chat_id, message_id) {
                tracing::debug!(chat = %chat_id, message = %message_id, error = %err, "prompt cleanup failed");
            }
        }
    }

    fn send(&self, origin: &ChatContext, text: &str) {
        if let Err(err) = self
            .transport
            .send_text(&origin.chat_id, Some(&origin.message_id), text)
        {
            tracing::warn!(chat = %origin.chat_id, error = %err, "reply failed");
        }
    }

    fn reject(&self, message: &InboundMessage, rejection: Rejection) -> Rejection {
        tracing::info!(
            user = %message.sender_id,
            chat = %message.chat_id,
            rejection = ?rejection,
            "invocation rejected"
        );
        self.reply(message, &rejection.message());
        rejection
    }
}

pub fn chat_context(message: &InboundMessage) -> ChatContext {
    ChatContext {
        chat_id: message.chat_id.clone(),
        message_id: message.message_id.clone(),
        kind: message.chat_kind,
    }
}

/// Types inline arguments against the command's ports. Free text goes to a
/// `prompt` port, or else to the first string port not named explicitly. An
/// attached image fills the first image port left open.
pub fn typed_arguments(
    command: &CommandSpec,
    raw_arguments: BTreeMap<String, String>,
    image: Option<&ImageRef>,
) -> Result<BTreeMap<String, ArgumentValue>, Rejection> {
    let mut values = BTreeMap::new();
    for (name, raw) in &raw_arguments {
        let port = match command.port(name) {
            Some(port) => port,
            None if name == FREE_TEXT_ARGUMENT => {
                let fallback = command.ports().iter().find(|port| {
                    port.port_type == PortType::String && !raw_arguments.contains_key(port.name())
                });
                match fallback {
                    Some(port) => port,
                    None => continue,
                }
            }
            None => {
                tracing::debug!(command = %command.name(), argument = %name, "ignoring unknown argument");
                continue;
            }
        };
        let value = match port.port_type {
            PortType::String => ArgumentValue::Text(raw.clone()),
            PortType::Integer => raw.trim().parse::<i64>().map(ArgumentValue::Integer).map_err(
                |_| Rejection::InvalidArgument {
                    argument: port.name().to_string(),
                    reason: format!("`{raw}` is not an integer"),
                },
            )?,
            PortType::Image => {
                return Err(Rejection::InvalidArgument {
                    argument: port.name().to_string(),
                    reason: "attach the image instead of typing it".to_string(),
                })
            }
        };
        values.insert(port.name().to_string(), value);
    }

    if let Some(image) = image {
        let open_port = command
            .ports()
            .iter()
            .find(|port| port.port_type == PortType::Image && !values.contains_key(port.name()));
        if let Some(port) = open_port {
            values.insert(port.name().to_string(), ArgumentValue::Image(image.clone()));
        }
    }
    Ok(values)
}
