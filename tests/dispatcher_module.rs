use flowrelay::app::dispatcher::{
    typed_arguments, BuiltinCommand, ContinueOutcome, DispatchOutcome, Dispatcher, InvokeOutcome,
    Rejection,
};
use flowrelay::channels::policy::AllowList;
use flowrelay::channels::{ChatKind, InboundMessage, Transport, TransportError};
use flowrelay::engine::{PortHooks, WorkflowExecutor};
use flowrelay::queue::{ExecutionError, JobQueue, Worker};
use flowrelay::registry::{ExecutableHandle, PortSpec, WorkflowRegistry};
use flowrelay::session::{CancelReason, SessionManager};
use flowrelay::shared::ids::{ChatId, UserId};
use flowrelay::value::{ArgumentValue, BoundValue, ImageData, ImageRef, OutputValue};
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const UPSCALE: &str = r#"
p = NODE_CLASS_MAPPINGS["AppIO_StringInput"]()
p.execute(argument_name="prompt", required=True)
s = NODE_CLASS_MAPPINGS["AppIO_IntegerInput"]()
s.execute(argument_name="scale", integer=2, integer_min=1, integer_max=4)
o = NODE_CLASS_MAPPINGS["AppIO_StringOutput"]()
o.execute(string="x")
"#;

const RESTYLE: &str = r#"
i = NODE_CLASS_MAPPINGS["AppIO_ImageInput"]()
i.execute(argument_name="image")
o = NODE_CLASS_MAPPINGS["AppIO_ImageOutput"]()
o.execute(images=i)
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Text { chat: String, text: String },
    Edit { message_id: String, text: String },
    Image {
        chat: String,
        bytes: usize,
        caption: Option<String>,
    },
    Delete { message_id: String },
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Sent>>,
    next_id: AtomicU64,
}

impl RecordingTransport {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent")
            .iter()
            .filter_map(|sent| match sent {
                Sent::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn last_text(&self) -> String {
        self.texts().pop().unwrap_or_default()
    }

    fn all(&self) -> Vec<Sent> {
        self.sent.lock().expect("sent").clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Delete { message_id } => Some(message_id),
                _ => None,
            })
            .collect()
    }

    fn to_chat(&self, chat: &str) -> Vec<Sent> {
        self.all()
            .into_iter()
            .filter(|sent| match sent {
                Sent::Text { chat: to, .. } | Sent::Image { chat: to, .. } => to == chat,
                _ => false,
            })
            .collect()
    }

    fn clear(&self) {
        self.sent.lock().expect("sent").clear();
    }
}

impl Transport for RecordingTransport {
    fn send_text(
        &self,
        chat: &ChatId,
        _reply_to: Option<&str>,
        text: &str,
    ) -> Result<String, TransportError> {
        self.sent.lock().expect("sent").push(Sent::Text {
            chat: chat.to_string(),
            text: text.to_string(),
        });
        Ok(format!("s{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn edit_text(&self, _chat: &ChatId, message_id: &str, text: &str) -> Result<(), TransportError> {
        self.sent.lock().expect("sent").push(Sent::Edit {
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn delete_message(&self, _chat: &ChatId, message_id: &str) -> Result<(), TransportError> {
        self.sent.lock().expect("sent").push(Sent::Delete {
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    fn send_image(
        &self,
        chat: &ChatId,
        _reply_to: Option<&str>,
        image: &ImageData,
        caption: Option<&str>,
    ) -> Result<String, TransportError> {
        self.sent.lock().expect("sent").push(Sent::Image {
            chat: chat.to_string(),
            bytes: image.bytes.len(),
            caption: caption.map(str::to_string),
        });
        Ok(format!("s{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn fetch_image(&self, image: &ImageRef) -> Result<ImageData, TransportError> {
        Ok(ImageData {
            bytes: image.file_id.as_bytes().to_vec(),
        })
    }
}

struct EchoExecutor;

impl WorkflowExecutor for EchoExecutor {
    fn execute(
        &self,
        _handle: &ExecutableHandle,
        ports: &[PortSpec],
        hooks: &mut dyn PortHooks,
    ) -> Result<(), ExecutionError> {
        let mut parts = Vec::new();
        for port in ports {
            match hooks.bind(port)? {
                Some(BoundValue::Image(image)) => return hooks.emit(OutputValue::Image(image)),
                Some(BoundValue::Text(text)) => parts.push(format!("{}={text}", port.name())),
                Some(BoundValue::Integer(value)) => parts.push(format!("{}={value}", port.name())),
                None => {}
            }
        }
        hooks.emit(OutputValue::Text(parts.join(" ")))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    transport: Arc<RecordingTransport>,
    dispatcher: Dispatcher,
    worker: Worker,
    queue: Arc<JobQueue>,
}

impl Fixture {
    fn new() -> Self {
        Self::build(None, Duration::from_secs(300), None)
    }

    fn with_policy(policy: Option<AllowList>) -> Self {
        Self::build(policy, Duration::from_secs(300), None)
    }

    fn build(policy: Option<AllowList>, ttl: Duration, monitor: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("upscale.py"), UPSCALE).expect("write upscale");
        fs::write(dir.path().join("restyle.py"), RESTYLE).expect("write restyle");
        let registry = Arc::new(WorkflowRegistry::from_dir(dir.path()));
        registry.refresh().expect("refresh");
        let sessions = Arc::new(SessionManager::new(registry.clone(), ttl));
        let queue = Arc::new(JobQueue::new());
        let transport = Arc::new(RecordingTransport::default());
        let mut dispatcher =
            Dispatcher::new(registry, sessions, queue.clone(), transport.clone());
        if let Some(policy) = policy {
            dispatcher = dispatcher.with_access_policy(Box::new(policy));
        }
        if let Some(monitor) = monitor {
            dispatcher = dispatcher.with_monitor_chat(ChatId::new(monitor));
        }
        Self {
            _dir: dir,
            transport,
            dispatcher,
            worker: Worker::new(queue.clone(), Arc::new(EchoExecutor)),
            queue,
        }
    }
}

fn message(user: &str, kind: ChatKind, text: &str) -> InboundMessage {
    InboundMessage {
        message_id: format!("{user}-{}", text.len()),
        chat_id: ChatId::new("chat-1"),
        chat_kind: kind,
        sender_id: UserId::new(user),
        sender_name: user.to_string(),
        text: (!text.is_empty()).then(|| text.to_string()),
        image: None,
    }
}

fn private(user: &str, text: &str) -> InboundMessage {
    message(user, ChatKind::Private, text)
}

#[test]
fn complete_invocation_is_accepted_with_defaults_and_runs() {
    let fx = Fixture::new();
    let outcome = fx.dispatcher.handle(&private("u1", "/upscale cat"));
    let accepted = outcome.admitted().expect("admitted");
    assert_eq!(accepted.ahead, 0);

    let outcomes = fx.worker.drain();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].succeeded());
    assert!(fx.transport.texts().contains(&"prompt=cat scale=2".to_string()));
}

#[test]
fn private_chats_get_a_status_message_edited_in_place() {
    let fx = Fixture::new();
    fx.dispatcher.handle(&private("u1", "/upscale cat"));
    fx.worker.drain();
    assert_eq!(
        fx.transport.all(),
        vec![
            Sent::Text {
                chat: "chat-1".to_string(),
                text: "Queued: 0 ahead of you".to_string()
            },
            Sent::Edit {
                message_id: "s0".to_string(),
                text: "Executing...".to_string()
            },
            Sent::Text {
                chat: "chat-1".to_string(),
                text: "prompt=cat scale=2".to_string()
            },
        ]
    );
}

#[test]
fn group_chats_only_hear_about_the_queue_when_someone_is_ahead() {
    let fx = Fixture::new();
    fx.dispatcher
        .handle(&message("u1", ChatKind::Group, "/upscale cat"));
    assert!(fx.transport.all().is_empty());
    fx.dispatcher
        .handle(&message("u2", ChatKind::Group, "/upscale owl"));
    assert_eq!(fx.transport.texts(), vec!["Queued: 1 ahead of you".to_string()]);
}

#[test]
fn missing_argument_opens_a_form_that_completes_on_reply() {
    let fx = Fixture::new();
    let outcome = fx.dispatcher.handle(&private("u1", "/upscale"));
    let DispatchOutcome::Invoked(InvokeOutcome::NeedsMoreInput(prompt)) = outcome else {
        panic!("expected a prompt, got {outcome:?}");
    };
    assert_eq!(prompt.port.name(), "prompt");
    assert!(fx.transport.last_text().ends_with("String `prompt`?"));

    let outcome = fx.dispatcher.handle(&private("u1", "cat"));
    let DispatchOutcome::Continued(ContinueOutcome::Completed(accepted)) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(accepted.ahead, 0);
    assert!(fx.transport.texts().iter().any(|text| text.ends_with("Form completed")));
    assert!(fx.dispatcher.sessions().is_empty());

    fx.worker.drain();
    assert!(fx.transport.texts().contains(&"prompt=cat scale=2".to_string()));
}

#[test]
fn second_invocation_while_in_flight_is_rejected() {
    let fx = Fixture::new();
    let first = fx.dispatcher.handle(&private("u1", "/upscale x"));
    assert!(first.admitted().is_some());
    let second = fx.dispatcher.handle(&private("u1", "/upscale x"));
    assert!(matches!(
        second,
        DispatchOutcome::Invoked(InvokeOutcome::Rejected(Rejection::DuplicateInFlight))
    ));
    assert_eq!(fx.queue.len(), 1);
}

#[test]
fn unknown_command_and_bad_integer_are_rejected_with_a_reply() {
    let fx = Fixture::new();
    let outcome = fx.dispatcher.handle(&private("u1", "/paint cat"));
    assert!(matches!(
        outcome,
        DispatchOutcome::Invoked(InvokeOutcome::Rejected(Rejection::UnknownCommand { ref command }))
            if command == "paint"
    ));
    assert_eq!(
        fx.transport.last_text(),
        "Unknown command /paint. Send /help for the list"
    );

    let outcome = fx.dispatcher.handle(&private("u1", "/upscale cat --scale big"));
    assert!(matches!(
        outcome,
        DispatchOutcome::Invoked(InvokeOutcome::Rejected(Rejection::InvalidArgument { ref argument, .. }))
            if argument == "scale"
    ));
    assert!(fx.queue.is_empty());
}

#[test]
fn out_of_range_scale_runs_clamped_with_a_notice() {
    let fx = Fixture::new();
    fx.dispatcher
        .handle(&message("u1", ChatKind::Group, "/upscale cat --scale 9"));
    fx.worker.drain();
    assert_eq!(
        fx.transport.texts(),
        vec![
            "The range of --scale is 1..4. Changing 9 to 4".to_string(),
            "prompt=cat scale=4".to_string(),
        ]
    );
}

#[test]
fn wrong_reply_type_cancels_the_form() {
    let fx = Fixture::new();
    fx.dispatcher.handle(&private("u1", "/restyle"));
    let outcome = fx.dispatcher.handle(&private("u1", "just text"));
    assert!(matches!(
        outcome,
        DispatchOutcome::Continued(ContinueOutcome::Cancelled(CancelReason::TypeMismatch { .. }))
    ));
    assert_eq!(
        fx.transport.last_text(),
        "Expected Image for `image`. Form cancelled"
    );
    assert!(fx.dispatcher.sessions().is_empty());
}

#[test]
fn other_users_cannot_answer_someone_elses_form() {
    let fx = Fixture::new();
    fx.dispatcher.handle(&private("u1", "/upscale"));
    fx.transport.clear();
    let outcome = fx.dispatcher.handle(&private("u2", "cat"));
    assert!(matches!(outcome, DispatchOutcome::Ignored));
    assert!(fx.transport.all().is_empty());
    assert_eq!(fx.dispatcher.sessions().len(), 1);
}

#[test]
fn image_with_a_caption_command_fills_the_image_port() {
    let fx = Fixture::new();
    let mut msg = private("u1", "/restyle");
    msg.image = Some(ImageRef::new("photo-1"));
    assert!(fx.dispatcher.handle(&msg).admitted().is_some());
    fx.worker.drain();
    assert!(fx.transport.all().contains(&Sent::Image {
        chat: "chat-1".to_string(),
        bytes: 7,
        caption: None,
    }));
}

#[test]
fn bare_image_gets_the_menu_of_image_commands() {
    let fx = Fixture::new();
    let mut msg = private("u1", "");
    msg.image = Some(ImageRef::new("photo-1"));
    assert!(matches!(fx.dispatcher.handle(&msg), DispatchOutcome::ImageMenu));
    let menu = fx.transport.last_text();
    assert!(menu.contains("/restyle"));
    assert!(!menu.contains("/upscale"));
}

#[test]
fn builtins_answer_directly() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.dispatcher.handle(&private("u1", "/get_ids")),
        DispatchOutcome::Builtin(BuiltinCommand::GetIds)
    ));
    assert_eq!(fx.transport.last_text(), "chat id: chat-1\nuser id: u1");

    fx.dispatcher.handle(&private("u1", "/help"));
    let help = fx.transport.last_text();
    assert!(help.contains("/upscale --prompt <String> [--scale 1..4] - upscale"));
    assert!(help.contains("/cancel - "));
}

#[test]
fn cancel_drops_the_form_and_the_queued_job() {
    let fx = Fixture::new();
    fx.dispatcher.handle(&private("u1", "/upscale"));
    fx.dispatcher.handle(&private("u1", "/cancel"));
    assert_eq!(fx.transport.last_text(), "Form cancelled");
    assert!(fx.dispatcher.sessions().is_empty());

    fx.dispatcher.handle(&private("u1", "/upscale cat"));
    fx.dispatcher.handle(&private("u1", "/cancel"));
    assert_eq!(fx.transport.last_text(), "Queued job removed");
    assert!(fx.worker.drain().is_empty());

    fx.dispatcher.handle(&private("u1", "/cancel"));
    assert_eq!(fx.transport.last_text(), "Nothing to cancel");
}

#[test]
fn unlisted_chats_are_denied_silently() {
    let fx = Fixture::with_policy(Some(AllowList::new(
        vec!["chat-9".to_string()],
        Vec::<String>::new(),
    )));
    assert!(matches!(
        fx.dispatcher.handle(&private("u1", "/upscale cat")),
        DispatchOutcome::Denied
    ));
    assert!(fx.transport.all().is_empty());
    assert!(fx.queue.is_empty());
}

#[test]
fn plain_text_without_a_form_is_ignored() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.dispatcher.handle(&private("u1", "hello there")),
        DispatchOutcome::Ignored
    ));
    assert!(fx.transport.all().is_empty());
}

#[test]
fn free_text_falls_back_to_the_first_string_port() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("caption.py"),
        "t = NODE_CLASS_MAPPINGS[\"AppIO_StringInput\"]()\nt.execute(argument_name=\"text\", required=True)\n",
    )
    .expect("write");
    let registry = WorkflowRegistry::from_dir(dir.path());
    registry.refresh().expect("refresh");
    let command = registry.lookup("caption").expect("caption");

    let mut raw = BTreeMap::new();
    raw.insert("prompt".to_string(), "hello world".to_string());
    let values = typed_arguments(&command, raw, None).expect("typed");
    assert_eq!(
        values.get("text"),
        Some(&ArgumentValue::Text("hello world".to_string()))
    );
}

#[test]
fn prompts_are_deleted_once_the_form_completes() {
    let fx = Fixture::new();
    fx.dispatcher.handle(&private("u1", "/upscale"));
    assert!(fx.transport.deleted().is_empty());
    fx.dispatcher.handle(&private("u1", "cat"));
    assert_eq!(fx.transport.deleted(), vec!["s0".to_string()]);
}

#[test]
fn prompts_are_deleted_when_the_form_is_cancelled() {
    let fx = Fixture::new();
    fx.dispatcher.handle(&private("u1", "/restyle"));
    fx.dispatcher.handle(&private("u1", "just text"));
    assert_eq!(fx.transport.deleted(), vec!["s0".to_string()]);

    fx.transport.clear();
    fx.dispatcher.handle(&private("u1", "/restyle"));
    fx.dispatcher.handle(&private("u1", "/cancel"));
    assert_eq!(fx.transport.deleted(), vec!["s2".to_string()]);
    assert_eq!(fx.transport.last_text(), "Form cancelled");
}

#[test]
fn reply_to_an_expired_form_is_told_it_expired() {
    let fx = Fixture::build(None, Duration::from_millis(50), None);
    fx.dispatcher.handle(&private("u1", "/upscale"));
    std::thread::sleep(Duration::from_millis(120));

    let outcome = fx.dispatcher.handle(&private("u1", "cat"));
    assert!(matches!(
        outcome,
        DispatchOutcome::Continued(ContinueOutcome::Cancelled(CancelReason::Expired))
    ));
    assert_eq!(fx.transport.last_text(), CancelReason::Expired.message());
    assert_eq!(fx.transport.deleted(), vec!["s0".to_string()]);
    assert!(fx.dispatcher.sessions().is_empty());
    assert!(fx.queue.is_empty());
}

#[test]
fn sweeper_expiry_deletes_prompts_and_notifies() {
    let fx = Fixture::build(None, Duration::from_millis(50), None);
    fx.dispatcher.handle(&private("u1", "/upscale"));
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(fx.dispatcher.expire_sessions(), 1);
    assert_eq!(fx.transport.deleted(), vec!["s0".to_string()]);
    assert_eq!(fx.transport.last_text(), CancelReason::Expired.message());
}

#[test]
fn monitor_chat_gets_the_form_with_inputs_and_outputs() {
    let fx = Fixture::build(None, Duration::from_secs(300), Some("monitor"));
    let mut msg = message("u1", ChatKind::Group, "/restyle");
    msg.image = Some(ImageRef::new("photo-1"));
    assert!(fx.dispatcher.handle(&msg).admitted().is_some());
    fx.worker.drain();

    let copies = fx.transport.to_chat("monitor");
    assert_eq!(copies.len(), 3, "{copies:?}");
    let Sent::Text { text, .. } = &copies[0] else {
        panic!("expected the form report first, got {copies:?}");
    };
    assert!(text.starts_with("from u1\n"));
    assert!(text.ends_with("Form completed"));
    assert_eq!(
        copies[1..],
        [
            Sent::Image {
                chat: "monitor".to_string(),
                bytes: 7,
                caption: Some("Input image".to_string()),
            },
            Sent::Image {
                chat: "monitor".to_string(),
                bytes: 7,
                caption: Some("Output image".to_string()),
            },
        ]
    );
    assert_eq!(fx.transport.to_chat("chat-1").len(), 1);
}

#[test]
fn without_a_monitor_chat_nothing_is_copied() {
    let fx = Fixture::new();
    fx.dispatcher
        .handle(&message("u1", ChatKind::Group, "/upscale cat"));
    fx.worker.drain();
    assert!(fx.transport.to_chat("monitor").is_empty());
}
