//! Multi-turn argument collection.
//!
//! A session asks, one message at a time, for the required ports the
//! invocation left out. Every transition of every session happens under one
//! table lock, so a reply and an expiry can never both win.

pub mod error;
pub mod form;

pub use error::SessionError;

use crate::channels::transport::InboundMessage;
use crate::queue::{ChatContext, ExecutionRequest, JobIo};
use crate::registry::{CommandSpec, PortSpec, PortType, WorkflowRegistry};
use crate::shared::ids::{ChatId, SessionId, UserId};
use crate::value::{ArgumentValue, ImageRef};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Raw reply content offered for the awaited port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundValue {
    pub text: Option<String>,
    pub image: Option<ImageRef>,
}

impl InboundValue {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    pub fn image(image: ImageRef) -> Self {
        Self {
            text: None,
            image: Some(image),
        }
    }

    pub fn from_message(message: &InboundMessage) -> Self {
        Self {
            text: message.text.clone(),
            image: message.image.clone(),
        }
    }

    /// String and Integer ports read the text, which for an image message is
    /// its caption.
    fn coerce(&self, port_type: PortType) -> Option<ArgumentValue> {
        match port_type {
            PortType::Image => self.image.clone().map(ArgumentValue::Image),
            PortType::String => self
                .text
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(|text| ArgumentValue::Text(text.to_string())),
            PortType::Integer => self
                .text
                .as_deref()
                .and_then(|text| text.trim().parse::<i64>().ok())
                .map(ArgumentValue::Integer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub session_id: SessionId,
    pub port: PortSpec,
    pub text: String,
}

/// Every required port has a value; ready to become an execution request.
#[derive(Debug, Clone)]
pub struct FilledForm {
    pub command: Arc<CommandSpec>,
    pub owner_id: UserId,
    pub origin: ChatContext,
    /// Supplied values in collection order.
    pub collected: Vec<(String, ArgumentValue)>,
    /// Supplied values merged with port defaults.
    pub values: BTreeMap<String, ArgumentValue>,
    /// Prompt messages posted while the form was open.
    pub prompt_messages: Vec<String>,
}

impl FilledForm {
    fn new(
        command: Arc<CommandSpec>,
        owner_id: UserId,
        origin: ChatContext,
        collected: Vec<(String, ArgumentValue)>,
        prompt_messages: Vec<String>,
    ) -> Self {
        let mut values: BTreeMap<String, ArgumentValue> = collected.iter().cloned().collect();
        for port in command.ports() {
            if let Some(default) = &port.default {
                values
                    .entry(port.name().to_string())
                    .or_insert_with(|| default.clone());
            }
        }
        Self {
            command,
            owner_id,
            origin,
            collected,
            values,
            prompt_messages,
        }
    }

    pub fn summary(&self) -> String {
        form::render_completed(&self.command, &self.collected)
    }

    pub fn into_request(self, io: Box<dyn JobIo>) -> ExecutionRequest {
        ExecutionRequest::new(self.command, self.owner_id, self.origin, self.values, io)
    }
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Ready(FilledForm),
    NeedsInput(Prompt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    TypeMismatch { argument: String, expected: PortType },
    Expired,
}

impl CancelReason {
    pub fn message(&self) -> String {
        match self {
            Self::TypeMismatch { argument, expected } => {
                format!("Expected {expected} for `{argument}`. Form cancelled")
            }
            Self::Expired => "Form expired".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    NeedsInput(Prompt),
    Completed(FilledForm),
    Cancelled {
        reason: CancelReason,
        prompt_messages: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    pub session_id: SessionId,
    pub owner_id: UserId,
    pub origin: ChatContext,
    pub command_name: String,
    pub prompt_messages: Vec<String>,
}

/// Session of one owner in one chat, as seen by an incoming reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    Open(SessionId),
    /// The deadline passed before the sweeper got to it; the session is gone.
    Expired(ExpiredSession),
}

#[derive(Debug, Clone)]
struct Session {
    id: SessionId,
    owner_id: UserId,
    origin: ChatContext,
    command: Arc<CommandSpec>,
    collected: Vec<(String, ArgumentValue)>,
    remaining: VecDeque<PortSpec>,
    prompt_messages: Vec<String>,
    expires_at: Instant,
}

impl Session {
    fn origin_key(&self) -> (UserId, ChatId) {
        (self.owner_id.clone(), self.origin.chat_id.clone())
    }

    fn prompt(&self, port: &PortSpec) -> Prompt {
        Prompt {
            session_id: self.id.clone(),
            port: port.clone(),
            text: form::render_prompt(&self.command, &self.collected, port),
        }
    }

    fn into_expired(self) -> ExpiredSession {
        ExpiredSession {
            command_name: self.command.name().to_string(),
            session_id: self.id,
            owner_id: self.owner_id,
            origin: self.origin,
            prompt_messages: self.prompt_messages,
        }
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    by_origin: HashMap<(UserId, ChatId), SessionId>,
}

impl SessionTable {
    fn insert(&mut self, session: Session) -> Option<Session> {
        let replaced = self
            .by_origin
            .insert(session.origin_key(), session.id.clone())
            .and_then(|previous| self.sessions.remove(&previous));
        self.sessions.insert(session.id.clone(), session);
        replaced
    }

    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        let key = session.origin_key();
        if self.by_origin.get(&key) == Some(id) {
            self.by_origin.remove(&key);
        }
        Some(session)
    }

    /// Drops `id` if its deadline has passed.
    fn expire_if_due(&mut self, id: &SessionId, now: Instant) -> Option<Session> {
        let due = self
            .sessions
            .get(id)
            .is_some_and(|session| session.expires_at <= now);
        if due {
            return self.remove(id);
        }
        None
    }
}

pub struct SessionManager {
    registry: Arc<WorkflowRegistry>,
    ttl: Duration,
    table: Mutex<SessionTable>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("ttl", &self.ttl)
            .field("open", &self.len())
            .finish()
    }
}

impl SessionManager {
    pub fn new(registry: Arc<WorkflowRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            table: Mutex::new(SessionTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn start(
        &self,
        command_name: &str,
        initial_values: BTreeMap<String, ArgumentValue>,
        origin: ChatContext,
        owner_id: UserId,
    ) -> Result<StartOutcome, SessionError> {
        let command =
            self.registry
                .lookup(command_name)
                .ok_or_else(|| SessionError::UnknownCommand {
                    command: command_name.to_string(),
                })?;
        self.start_with(command, initial_values, origin, owner_id)
    }

    /// Starts collection for an already resolved command. Opening a session
    /// replaces any open one of the same owner in the same chat.
    pub fn start_with(
        &self,
        command: Arc<CommandSpec>,
        initial_values: BTreeMap<String, ArgumentValue>,
        origin: ChatContext,
        owner_id: UserId,
    ) -> Result<StartOutcome, SessionError> {
        let mut collected = Vec::new();
        for port in command.ports() {
            let Some(value) = initial_values.get(port.name()) else {
                continue;
            };
            if value.port_type() != port.port_type {
                return Err(SessionError::TypeMismatch {
                    argument: port.name().to_string(),
                    expected: port.port_type,
                    found: value.port_type(),
                });
            }
            collected.push((port.name().to_string(), value.clone()));
        }
        for name in initial_values.keys() {
            if command.port(name).is_none() {
                tracing::debug!(command = %command.name(), argument = %name, "ignoring unknown argument");
            }
        }

        let remaining: VecDeque<PortSpec> = command
            .required_ports()
            .filter(|port| !initial_values.contains_key(port.name()))
            .cloned()
            .collect();
        let Some(first) = remaining.front().cloned() else {
            let key = (owner_id.clone(), origin.chat_id.clone());
            let mut table = self.lock();
            if let Some(previous) = table.by_origin.get(&key).cloned() {
                table.remove(&previous);
                tracing::info!(session = %previous, "session replaced by a complete invocation");
            }
            drop(table);
            return Ok(StartOutcome::Ready(FilledForm::new(
                command,
                owner_id,
                origin,
                collected,
                Vec::new(),
            )));
        };

        let id = SessionId::generate().map_err(|err| SessionError::IdGeneration {
            reason: err.to_string(),
        })?;
        let session = Session {
            id,
            owner_id,
            origin,
            command,
            collected,
            remaining,
            prompt_messages: Vec::new(),
            expires_at: Instant::now() + self.ttl,
        };
        let prompt = session.prompt(&first);
        tracing::info!(
            session = %session.id,
            owner = %session.owner_id,
            command = %session.command.name(),
            awaiting = session.remaining.len(),
            "session opened"
        );
        if let Some(replaced) = self.lock().insert(session) {
            tracing::info!(session = %replaced.id, "session replaced by a new invocation");
        }
        Ok(StartOutcome::NeedsInput(prompt))
    }

    pub fn submit(
        &self,
        session_id: &SessionId,
        sender_id: &UserId,
        value: InboundValue,
    ) -> Result<SubmitOutcome, SessionError> {
        self.submit_at(session_id, sender_id, value, Instant::now())
    }

    pub fn submit_at(
        &self,
        session_id: &SessionId,
        sender_id: &UserId,
        value: InboundValue,
        now: Instant,
    ) -> Result<SubmitOutcome, SessionError> {
        let mut table = self.lock();
        if let Some(expired) = table.expire_if_due(session_id, now) {
            tracing::info!(session = %expired.id, "session expired before reply");
            return Ok(SubmitOutcome::Cancelled {
                reason: CancelReason::Expired,
                prompt_messages: expired.prompt_messages,
            });
        }
        let session =
            table
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound {
                    session_id: session_id.to_string(),
                })?;
        if &session.owner_id != sender_id {
            return Err(SessionError::NotOwner {
                session_id: session_id.to_string(),
            });
        }
        let Some(port) = session.remaining.pop_front() else {
            table.remove(session_id);
            return Err(SessionError::NotFound {
                session_id: session_id.to_string(),
            });
        };

        let Some(collected) = value.coerce(port.port_type) else {
            let prompt_messages = table
                .remove(session_id)
                .map(|session| session.prompt_messages)
                .unwrap_or_default();
            tracing::info!(
                session = %session_id,
                argument = %port.name(),
                expected = %port.port_type,
                "session cancelled on mismatched reply"
            );
            return Ok(SubmitOutcome::Cancelled {
                reason: CancelReason::TypeMismatch {
                    argument: port.name().to_string(),
                    expected: port.port_type,
                },
                prompt_messages,
            });
        };

        session.collected.push((port.name().to_string(), collected));
        session.expires_at = now + self.ttl;
        if let Some(next) = session.remaining.front() {
            return Ok(SubmitOutcome::NeedsInput(session.prompt(next)));
        }

        let session = table
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        tracing::info!(session = %session.id, command = %session.command.name(), "session completed");
        Ok(SubmitOutcome::Completed(FilledForm::new(
            session.command,
            session.owner_id,
            session.origin,
            session.collected,
            session.prompt_messages,
        )))
    }

    /// Remembers a posted prompt so it can be removed when the form ends.
    /// Returns false when the session is already gone.
    pub fn record_prompt(&self, session_id: &SessionId, message_id: String) -> bool {
        match self.lock().sessions.get_mut(session_id) {
            Some(session) => {
                session.prompt_messages.push(message_id);
                true
            }
            None => false,
        }
    }

    /// Drops a session; returns its prompt messages if it was open.
    pub fn close(&self, session_id: &SessionId) -> Option<Vec<String>> {
        let session = self.lock().remove(session_id)?;
        tracing::info!(session = %session_id, "session closed");
        Some(session.prompt_messages)
    }

    /// Open session of `owner_id` in `chat_id`, if any and not yet expired.
    pub fn find_open(&self, owner_id: &UserId, chat_id: &ChatId) -> Option<SessionId> {
        match self.lookup_at(owner_id, chat_id, Instant::now())? {
            SessionLookup::Open(id) => Some(id),
            SessionLookup::Expired(_) => None,
        }
    }

    pub fn lookup(&self, owner_id: &UserId, chat_id: &ChatId) -> Option<SessionLookup> {
        self.lookup_at(owner_id, chat_id, Instant::now())
    }

    /// Like [`Self::lookup`]; a session past its deadline is removed and
    /// handed back as expired.
    pub fn lookup_at(
        &self,
        owner_id: &UserId,
        chat_id: &ChatId,
        now: Instant,
    ) -> Option<SessionLookup> {
        let mut table = self.lock();
        let id = table
            .by_origin
            .get(&(owner_id.clone(), chat_id.clone()))
            .cloned()?;
        if let Some(expired) = table.expire_if_due(&id, now) {
            tracing::info!(session = %id, "session expired before reply");
            return Some(SessionLookup::Expired(expired.into_expired()));
        }
        Some(SessionLookup::Open(id))
    }

    pub fn sweep_expired(&self) -> Vec<ExpiredSession> {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> Vec<ExpiredSession> {
        let mut table = self.lock();
        let due: Vec<SessionId> = table
            .sessions
            .values()
            .filter(|session| session.expires_at <= now)
            .map(|session| session.id.clone())
            .collect();
        let expired: Vec<ExpiredSession> = due
            .iter()
            .filter_map(|id| table.remove(id))
            .map(Session::into_expired)
            .collect();
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired idle sessions");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
