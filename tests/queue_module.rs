use flowrelay::channels::{ChatKind, TransportError};
use flowrelay::engine::{PortHooks, WorkflowExecutor};
use flowrelay::queue::{
    ChatContext, ExecutionError, ExecutionRequest, FeedbackSink, JobIo, JobQueue, JobStatus,
    QueueError, Worker,
};
use flowrelay::registry::{CommandSpec, ExecutableHandle, PortSpec, WorkflowRegistry};
use flowrelay::shared::ids::{ChatId, UserId};
use flowrelay::value::{ArgumentValue, BoundValue, ImageData, ImageRef, OutputValue};
use std::collections::BTreeMap;
use std::fs;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const GENERATE: &str = r#"
p = NODE_CLASS_MAPPINGS["AppIO_StringInput"]()
p.execute(argument_name="prompt", required=True)
s = NODE_CLASS_MAPPINGS["AppIO_IntegerInput"]()
s.execute(argument_name="steps", integer=20, integer_min=1, integer_max=50)
i = NODE_CLASS_MAPPINGS["AppIO_ImageInput"]()
i.execute(argument_name="init", required=False)
o = NODE_CLASS_MAPPINGS["AppIO_StringOutput"]()
o.execute(string="x")
"#;

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Copy)]
enum Behavior {
    Echo,
    EmptyText,
    Panic,
    Progress(u32),
}

struct FakeExecutor {
    behavior: Behavior,
}

fn render(value: &BoundValue) -> String {
    match value {
        BoundValue::Text(text) => text.clone(),
        BoundValue::Integer(value) => value.to_string(),
        BoundValue::Image(image) => format!("{}b", image.bytes.len()),
    }
}

impl WorkflowExecutor for FakeExecutor {
    fn execute(
        &self,
        _handle: &ExecutableHandle,
        ports: &[PortSpec],
        hooks: &mut dyn PortHooks,
    ) -> Result<(), ExecutionError> {
        let mut parts = Vec::new();
        for port in ports {
            if let Some(value) = hooks.bind(port)? {
                parts.push(format!("{}={}", port.name(), render(&value)));
            }
        }
        match self.behavior {
            Behavior::Echo => hooks.emit(OutputValue::Text(parts.join(" "))),
            Behavior::EmptyText => hooks.emit(OutputValue::Text("  ".to_string())),
            Behavior::Panic => panic!("engine blew up"),
            Behavior::Progress(total) => {
                for current in 1..=total {
                    hooks.report_progress(current, total);
                }
                hooks.emit(OutputValue::Text(parts.join(" ")))
            }
        }
    }
}

struct RecordingIo {
    user: String,
    log: Log,
}

impl RecordingIo {
    fn push(&self, entry: String) {
        self.log.lock().expect("log").push(format!("{}:{entry}", self.user));
    }
}

impl JobIo for RecordingIo {
    fn fetch_image(&mut self, image: &ImageRef) -> Result<ImageData, TransportError> {
        self.push(format!("fetch {}", image.file_id));
        Ok(ImageData {
            bytes: image.file_id.as_bytes().to_vec(),
        })
    }

    fn deliver(&mut self, output: OutputValue) -> Result<(), TransportError> {
        match output {
            OutputValue::Text(text) => self.push(format!("text {text}")),
            OutputValue::Image(image) => self.push(format!("image {}b", image.bytes.len())),
        }
        Ok(())
    }

    fn notify(&mut self, text: &str) -> Result<(), TransportError> {
        self.push(format!("notice {text}"));
        Ok(())
    }

    fn report_error(&mut self, text: &str) -> Result<(), TransportError> {
        self.push(format!("error {text}"));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingFeedback {
    statuses: Mutex<Vec<JobStatus>>,
}

impl FeedbackSink for RecordingFeedback {
    fn update(&self, status: &JobStatus) -> Result<(), TransportError> {
        self.statuses.lock().expect("statuses").push(*status);
        Ok(())
    }
}

/// Sleeps on one status so a later update could overtake it.
struct SlowFeedback {
    stall_on: JobStatus,
    statuses: Mutex<Vec<JobStatus>>,
}

impl FeedbackSink for SlowFeedback {
    fn update(&self, status: &JobStatus) -> Result<(), TransportError> {
        if *status == self.stall_on {
            thread::sleep(Duration::from_millis(300));
        }
        self.statuses.lock().expect("statuses").push(*status);
        Ok(())
    }
}

/// Signals when it starts and holds the job until released.
struct GatedExecutor {
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl WorkflowExecutor for GatedExecutor {
    fn execute(
        &self,
        _handle: &ExecutableHandle,
        _ports: &[PortSpec],
        hooks: &mut dyn PortHooks,
    ) -> Result<(), ExecutionError> {
        let _ = self.started.lock().expect("started").send(());
        let _ = self
            .release
            .lock()
            .expect("release")
            .recv_timeout(Duration::from_secs(5));
        hooks.emit(OutputValue::Text("done".to_string()))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    command: Arc<CommandSpec>,
    queue: Arc<JobQueue>,
    log: Log,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("generate.py"), GENERATE).expect("write workflow");
        let registry = WorkflowRegistry::from_dir(dir.path());
        registry.refresh().expect("refresh");
        Self {
            command: registry.lookup("generate").expect("generate"),
            _dir: dir,
            queue: Arc::new(JobQueue::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn request(&self, user: &str, values: &[(&str, ArgumentValue)]) -> ExecutionRequest {
        let values: BTreeMap<String, ArgumentValue> = values
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        ExecutionRequest::new(
            self.command.clone(),
            UserId::new(user),
            ChatContext {
                chat_id: ChatId::new("c1"),
                message_id: format!("{user}-msg"),
                kind: ChatKind::Private,
            },
            values,
            Box::new(RecordingIo {
                user: user.to_string(),
                log: self.log.clone(),
            }),
        )
    }

    fn prompt(&self, user: &str, text: &str) -> ExecutionRequest {
        self.request(user, &[("prompt", ArgumentValue::Text(text.to_string()))])
    }

    fn worker(&self, behavior: Behavior) -> Worker {
        Worker::new(self.queue.clone(), Arc::new(FakeExecutor { behavior }))
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().expect("log").clone()
    }
}

#[test]
fn jobs_run_one_at_a_time_in_admission_order() {
    let fx = Fixture::new();
    let a = fx.queue.submit(fx.prompt("u1", "fox")).expect("u1");
    let b = fx.queue.submit(fx.prompt("u2", "owl")).expect("u2");
    let c = fx.queue.submit(fx.prompt("u3", "cat")).expect("u3");
    assert_eq!((a.ahead, b.ahead, c.ahead), (0, 1, 2));
    assert_eq!(c.queue_length, 3);
    assert_eq!(fx.queue.snapshot().pending.len(), 3);

    let outcomes = fx.worker(Behavior::Echo).drain();
    let tickets: Vec<u64> = outcomes.iter().map(|outcome| outcome.ticket).collect();
    assert_eq!(tickets, vec![a.ticket, b.ticket, c.ticket]);
    assert!(outcomes.iter().all(|outcome| outcome.succeeded()));
    assert_eq!(
        fx.log(),
        vec![
            "u1:text prompt=fox steps=20".to_string(),
            "u2:text prompt=owl steps=20".to_string(),
            "u3:text prompt=cat steps=20".to_string(),
        ]
    );
    assert!(fx.queue.wait_idle(Duration::ZERO));
}

#[test]
fn a_user_with_a_job_in_flight_is_rejected_until_it_finishes() {
    let fx = Fixture::new();
    fx.queue.submit(fx.prompt("u1", "fox")).expect("first");
    let err = fx
        .queue
        .submit(fx.prompt("u1", "owl"))
        .expect_err("duplicate");
    assert!(matches!(err, QueueError::DuplicateInFlight { invoker } if invoker == UserId::new("u1")));
    assert!(fx.queue.is_in_flight(&UserId::new("u1")));
    fx.queue.submit(fx.prompt("u2", "cat")).expect("other user");

    let worker = fx.worker(Behavior::Echo);
    worker.run_next(Duration::ZERO).expect("first job");
    assert!(!fx.queue.is_in_flight(&UserId::new("u1")));
    fx.queue.submit(fx.prompt("u1", "owl")).expect("after finish");
    assert_eq!(worker.drain().len(), 2);
}

#[test]
fn out_of_range_integers_are_clamped_with_a_notice() {
    let fx = Fixture::new();
    fx.queue
        .submit(fx.request(
            "u1",
            &[
                ("prompt", ArgumentValue::Text("fox".to_string())),
                ("steps", ArgumentValue::Integer(99)),
            ],
        ))
        .expect("submit");
    let outcome = fx
        .worker(Behavior::Echo)
        .run_next(Duration::ZERO)
        .expect("job");
    assert!(outcome.succeeded());
    assert_eq!(outcome.clamped.len(), 1);
    assert_eq!(outcome.clamped[0].applied, 50);
    assert_eq!(
        fx.log(),
        vec![
            "u1:notice The range of --steps is 1..50. Changing 99 to 50".to_string(),
            "u1:text prompt=fox steps=50".to_string(),
        ]
    );
}

#[test]
fn image_arguments_are_fetched_through_the_job_io() {
    let fx = Fixture::new();
    fx.queue
        .submit(fx.request(
            "u1",
            &[
                ("prompt", ArgumentValue::Text("fox".to_string())),
                ("init", ArgumentValue::Image(ImageRef::new("file-42"))),
            ],
        ))
        .expect("submit");
    fx.worker(Behavior::Echo).drain();
    assert_eq!(
        fx.log(),
        vec![
            "u1:fetch file-42".to_string(),
            "u1:text prompt=fox steps=20 init=7b".to_string(),
        ]
    );
}

#[test]
fn missing_required_argument_fails_the_job_and_reports_it() {
    let fx = Fixture::new();
    fx.queue.submit(fx.request("u1", &[])).expect("submit");
    let outcome = fx
        .worker(Behavior::Echo)
        .run_next(Duration::ZERO)
        .expect("job");
    assert!(matches!(
        outcome.error,
        Some(ExecutionError::MissingRequiredArgument { ref argument }) if argument == "prompt"
    ));
    assert_eq!(fx.log(), vec!["u1:error Error: argument --prompt is required".to_string()]);
}

#[test]
fn empty_text_output_is_an_execution_error() {
    let fx = Fixture::new();
    fx.queue.submit(fx.prompt("u1", "fox")).expect("submit");
    let outcome = fx
        .worker(Behavior::EmptyText)
        .run_next(Duration::ZERO)
        .expect("job");
    assert!(matches!(outcome.error, Some(ExecutionError::EmptyTextOutput)));
    assert_eq!(outcome.outputs_delivered, 0);
    assert_eq!(
        fx.log(),
        vec!["u1:error Error: text output must not be empty".to_string()]
    );
}

#[test]
fn engine_panic_is_contained_and_the_queue_keeps_going() {
    let fx = Fixture::new();
    let dir = tempfile::tempdir().expect("error log dir");
    fx.queue.submit(fx.prompt("u1", "fox")).expect("u1");
    let worker = fx
        .worker(Behavior::Panic)
        .with_error_log(flowrelay::runtime::ErrorLog::new(dir.path()));
    let outcome = worker.run_next(Duration::ZERO).expect("job");
    assert!(matches!(
        outcome.error,
        Some(ExecutionError::Panicked(ref message)) if message == "engine blew up"
    ));
    assert!(!fx.queue.is_in_flight(&UserId::new("u1")));
    assert_eq!(fs::read_dir(dir.path()).expect("read log dir").count(), 1);

    fx.queue.submit(fx.prompt("u1", "again")).expect("resubmit");
    assert_eq!(fx.worker(Behavior::Echo).drain().len(), 1);
}

#[test]
fn withdrawn_jobs_never_run() {
    let fx = Fixture::new();
    fx.queue.submit(fx.prompt("u1", "fox")).expect("u1");
    let owl = fx.queue.submit(fx.prompt("u2", "owl")).expect("u2");
    assert_eq!(fx.queue.withdraw(&UserId::new("u2")), Some(owl.ticket));
    assert_eq!(fx.queue.withdraw(&UserId::new("u2")), None);

    let outcomes = fx.worker(Behavior::Echo).drain();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(fx.log(), vec!["u1:text prompt=fox steps=20".to_string()]);
}

#[test]
fn closed_queue_refuses_new_jobs_but_drains_pending_ones() {
    let fx = Fixture::new();
    fx.queue.submit(fx.prompt("u1", "fox")).expect("u1");
    fx.queue.close();
    assert!(matches!(
        fx.queue.submit(fx.prompt("u2", "owl")),
        Err(QueueError::Closed)
    ));
    assert_eq!(fx.worker(Behavior::Echo).drain().len(), 1);
}

#[test]
fn progress_is_throttled_after_the_executing_status() {
    let fx = Fixture::new();
    let feedback = Arc::new(RecordingFeedback::default());
    fx.queue
        .submit(fx.prompt("u1", "fox").with_feedback(feedback.clone()))
        .expect("submit");
    fx.worker(Behavior::Progress(7))
        .with_progress_every(5)
        .drain();
    assert_eq!(
        feedback.statuses.lock().expect("statuses").clone(),
        vec![
            JobStatus::Executing,
            JobStatus::Progress {
                current: 5,
                total: 7
            },
            JobStatus::Progress {
                current: 7,
                total: 7
            },
        ]
    );
    assert_eq!(
        JobStatus::Progress {
            current: 5,
            total: 7
        }
        .text(),
        "Executing... 71% (5/7)"
    );
}

#[test]
fn queue_position_updates_arrive_in_queue_order() {
    let fx = Fixture::new();
    let feedback = Arc::new(SlowFeedback {
        stall_on: JobStatus::Queued { ahead: 4 },
        statuses: Mutex::new(Vec::new()),
    });
    for user in ["u1", "u2", "u3", "u4"] {
        fx.queue.submit(fx.prompt(user, "fox")).expect("submit");
    }
    fx.queue
        .submit(fx.prompt("u5", "owl").with_feedback(feedback.clone()))
        .expect("u5");

    let worker = fx.worker(Behavior::Echo);
    worker.run_next(Duration::ZERO).expect("first job");
    worker.run_next(Duration::ZERO).expect("second job");

    let deadline = Instant::now() + Duration::from_secs(3);
    while feedback.statuses.lock().expect("statuses").len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        feedback.statuses.lock().expect("statuses").clone(),
        vec![JobStatus::Queued { ahead: 4 }, JobStatus::Queued { ahead: 3 }]
    );
}

#[test]
fn a_user_whose_job_is_executing_is_rejected() {
    let fx = Fixture::new();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let executor = Arc::new(GatedExecutor {
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    fx.queue.submit(fx.prompt("u1", "fox")).expect("first");
    let user = UserId::new("u1");

    thread::scope(|scope| {
        let queue = fx.queue.clone();
        let runner = scope.spawn(move || {
            Worker::new(queue, executor)
                .run_next(Duration::from_secs(1))
                .expect("job")
        });
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("job started");

        assert!(fx.queue.is_empty());
        assert!(fx.queue.snapshot().executing.is_some());
        assert!(fx.queue.is_in_flight(&user));
        let err = fx
            .queue
            .submit(fx.prompt("u1", "owl"))
            .expect_err("executing job counts as in flight");
        assert!(matches!(err, QueueError::DuplicateInFlight { ref invoker } if invoker == &user));
        fx.queue.submit(fx.prompt("u2", "cat")).expect("other user");

        release_tx.send(()).expect("release");
        assert!(runner.join().expect("worker thread").succeeded());
    });

    assert!(!fx.queue.is_in_flight(&user));
    fx.queue.submit(fx.prompt("u1", "owl")).expect("after finish");
}

#[test]
fn concurrent_submits_from_one_user_admit_exactly_one() {
    let fx = Fixture::new();
    for _ in 0..20 {
        let queue = JobQueue::new();
        let barrier = Barrier::new(2);
        let requests = [fx.prompt("u1", "fox"), fx.prompt("u1", "owl")];
        let results: Vec<Result<_, QueueError>> = thread::scope(|scope| {
            let handles: Vec<_> = requests
                .into_iter()
                .map(|request| {
                    let (queue, barrier) = (&queue, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        queue.submit(request)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("submit thread"))
                .collect()
        });

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|result| matches!(result, Err(QueueError::DuplicateInFlight { .. }))));
        assert_eq!(queue.len(), 1);
    }
}
