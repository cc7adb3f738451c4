//! Process wiring: registry, sessions, queue, dispatcher, plus the job
//! worker thread and the session expiry sweeper.

pub mod error_log;
pub mod state_paths;
pub mod worker_primitives;

pub use error_log::{ErrorLog, ErrorReport};
pub use state_paths::{bootstrap_state_root, StatePaths};

use crate::app::dispatcher::Dispatcher;
use crate::channels::policy::{AccessPolicy, AllowList};
use crate::channels::transport::Transport;
use crate::config::{ConfigError, Settings};
use crate::engine::{ProcessExecutor, ProcessExecutorConfig, WorkflowExecutor};
use crate::queue::{JobQueue, NodeCache, Worker, DEFAULT_PROGRESS_EVERY};
use crate::registry::{RegistryError, WorkflowRegistry};
use crate::session::{SessionManager, DEFAULT_SESSION_TTL};
use crate::shared::ids::ChatId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use worker_primitives::sleep_with_stop;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {worker} thread: {source}")]
    Spawn {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub progress_every: u32,
    pub node_cache: bool,
    pub error_log_dir: Option<PathBuf>,
    pub monitor_chat: Option<ChatId>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            sweep_interval: Duration::from_secs(1),
            progress_every: DEFAULT_PROGRESS_EVERY,
            node_cache: false,
            error_log_dir: None,
            monitor_chat: None,
        }
    }
}

impl RuntimeOptions {
    pub fn from_settings(settings: &Settings, paths: &StatePaths) -> Self {
        Self {
            session_ttl: settings.sessions.ttl(),
            sweep_interval: settings.sessions.sweep_interval(),
            progress_every: settings.progress.every,
            node_cache: settings.cache.enabled,
            error_log_dir: Some(paths.error_log_dir()),
            monitor_chat: settings.monitor_chat_id.as_deref().map(ChatId::new),
        }
    }
}

pub struct Runtime {
    dispatcher: Arc<Dispatcher>,
    stop: Arc<AtomicBool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Runtime {
    pub fn start(
        registry: Arc<WorkflowRegistry>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn WorkflowExecutor>,
        access: Box<dyn AccessPolicy>,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        let report = registry.refresh()?;
        if !report.skipped.is_empty() {
            tracing::warn!(
                skipped = report.skipped.len(),
                "some workflows were not loaded"
            );
        }

        let sessions = Arc::new(SessionManager::new(registry.clone(), options.session_ttl));
        let queue = Arc::new(JobQueue::new());
        let mut dispatcher = Dispatcher::new(registry, sessions, queue.clone(), transport)
            .with_access_policy(access);
        if let Some(chat_id) = options.monitor_chat.clone() {
            tracing::info!(chat = %chat_id, "forwarding completed jobs to monitor chat");
            dispatcher = dispatcher.with_monitor_chat(chat_id);
        }
        let dispatcher = Arc::new(dispatcher);

        let mut worker = Worker::new(queue, executor).with_progress_every(options.progress_every);
        if options.node_cache {
            worker = worker.with_node_cache(Arc::new(NodeCache::new()));
        }
        if let Some(dir) = &options.error_log_dir {
            worker = worker.with_error_log(ErrorLog::new(dir));
        }

        let mut runtime = Self {
            dispatcher: dispatcher.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        };

        let stop = runtime.stop.clone();
        runtime.spawn("job-worker", move || worker.run(&stop))?;

        let stop = runtime.stop.clone();
        let interval = options.sweep_interval;
        runtime.spawn("session-sweeper", move || {
            while sleep_with_stop(&stop, interval) {
                dispatcher.expire_sessions();
            }
        })?;
        Ok(runtime)
    }

    /// Wires a runtime from settings with the process executor.
    pub fn from_settings(
        settings: &Settings,
        config_dir: &Path,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RuntimeError> {
        let paths = StatePaths::new(settings.resolve_state_root()?);
        bootstrap_state_root(&paths)?;
        let registry = Arc::new(WorkflowRegistry::from_dir(
            settings.resolve_workflows_dir(config_dir),
        ));
        let executor = Arc::new(ProcessExecutor::new(ProcessExecutorConfig {
            program: settings.executor.program.clone(),
            args: settings.executor.args.clone(),
            timeout: settings.executor.timeout(),
            scratch_dir: paths.scratch_dir(),
        }));
        Self::start(
            registry,
            transport,
            executor,
            Box::new(AllowList::from_settings(&settings.access)),
            RuntimeOptions::from_settings(settings, &paths),
        )
    }

    fn spawn<F>(&mut self, worker: &'static str, body: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(worker.to_string())
            .spawn(body)
            .map_err(|source| {
                self.signal_stop();
                RuntimeError::Spawn { worker, source }
            })?;
        self.handles.push((worker, handle));
        Ok(())
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.dispatcher.queue().close();
    }

    /// Stops admission, lets the running job finish and joins both threads.
    pub fn shutdown(mut self) {
        self.signal_stop();
        for (worker, handle) in std::mem::take(&mut self.handles) {
            if handle.join().is_err() {
                tracing::error!(worker, "worker thread panicked");
            }
        }
        tracing::info!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.signal_stop();
    }
}
