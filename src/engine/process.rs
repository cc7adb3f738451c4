use super::{PortHooks, WorkflowExecutor};
use crate::queue::{ExecutionError, NodeCache};
use crate::registry::{ExecutableHandle, PortSpec};
use crate::shared::ids::hex_encode;
use crate::value::{BoundValue, ImageData, OutputValue};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const EVENT_POLL: Duration = Duration::from_millis(100);
const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Input images are staged here, one directory per job.
    pub scratch_dir: PathBuf,
}

/// One line of engine stdout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EngineEvent {
    Progress { current: u32, total: u32 },
    Text { value: String },
    Image { path: PathBuf },
    Error { message: String },
}

/// Runs each workflow in an external engine process.
///
/// The process gets `args` followed by the workflow source path, and one
/// JSON document on stdin: `{"command", "workflow", "inputs"}`. Text and
/// integer inputs are passed inline; images as staged file paths. It answers
/// with JSON lines on stdout, one event each.
#[derive(Debug)]
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
    next_job: AtomicU64,
}

impl ProcessExecutor {
    pub fn new(config: ProcessExecutorConfig) -> Self {
        Self {
            config,
            next_job: AtomicU64::new(1),
        }
    }

    fn job_dir(&self, handle: &ExecutableHandle) -> PathBuf {
        let n = self.next_job.fetch_add(1, Ordering::Relaxed);
        self.config.scratch_dir.join(format!(
            "{}-{}-{n}",
            handle.command_name,
            std::process::id()
        ))
    }

    fn bind_inputs(
        &self,
        handle: &ExecutableHandle,
        ports: &[PortSpec],
        hooks: &mut dyn PortHooks,
        job_dir: &Path,
    ) -> Result<Map<String, Value>, ExecutionError> {
        let mut inputs = Map::new();
        for port in ports {
            let Some(bound) = hooks.bind(port)? else {
                continue;
            };
            let value = match bound {
                BoundValue::Text(text) => json!({"type": "text", "value": text}),
                BoundValue::Integer(value) => json!({"type": "integer", "value": value}),
                BoundValue::Image(image) => {
                    let path = stage_image(handle, port, &image, job_dir, hooks.node_cache())?;
                    json!({"type": "image", "path": path})
                }
            };
            inputs.insert(port.name().to_string(), value);
        }
        Ok(inputs)
    }

    fn spawn(&self, handle: &ExecutableHandle, payload: &Value) -> Result<Child, ExecutionError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(&handle.source_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = handle.source_path.parent() {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ExecutionError::Engine(format!(
                "engine program `{}` not found",
                self.config.program
            )),
            _ => ExecutionError::io(&self.config.program, err),
        })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            ExecutionError::io(&self.config.program, std::io::Error::other("missing stdin pipe"))
        })?;
        let body = serde_json::to_vec(payload)
            .map_err(|err| ExecutionError::Engine(format!("failed to encode inputs: {err}")))?;
        if let Err(err) = stdin.write_all(&body) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExecutionError::io(&self.config.program, err));
        }
        drop(stdin);
        Ok(child)
    }
}

impl WorkflowExecutor for ProcessExecutor {
    fn execute(
        &self,
        handle: &ExecutableHandle,
        ports: &[PortSpec],
        hooks: &mut dyn PortHooks,
    ) -> Result<(), ExecutionError> {
        let job_dir = self.job_dir(handle);
        let result = self.run_job(handle, ports, hooks, &job_dir);
        if job_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&job_dir) {
                tracing::debug!(path = %job_dir.display(), error = %err, "failed to clean job scratch");
            }
        }
        result
    }
}

impl ProcessExecutor {
    fn run_job(
        &self,
        handle: &ExecutableHandle,
        ports: &[PortSpec],
        hooks: &mut dyn PortHooks,
        job_dir: &Path,
    ) -> Result<(), ExecutionError> {
        let inputs = self.bind_inputs(handle, ports, hooks, job_dir)?;
        let payload = json!({
            "command": handle.command_name.as_str(),
            "workflow": handle.source_path,
            "inputs": inputs,
        });
        let mut child = self.spawn(handle, &payload)?;
        tracing::debug!(command = %handle.command_name, pid = child.id(), "engine started");

        let io_err =
            |err: std::io::Error| ExecutionError::io(&self.config.program, err);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("missing stderr pipe")))?;

        let (event_tx, event_rx) = mpsc::channel::<EngineEvent>();
        let stdout_reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else {
                    break;
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<EngineEvent>(trimmed) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(_) => tracing::debug!(line = %trimmed, "engine output"),
                }
            }
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf);
            buf
        });

        let started = Instant::now();
        let mut engine_error = None;
        let outcome = loop {
            let remaining = self.config.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break Err(ExecutionError::Timeout {
                    timeout_secs: self.config.timeout.as_secs(),
                });
            }
            let event = match event_rx.recv_timeout(remaining.min(EVENT_POLL)) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break Ok(()),
            };
            let handled = match event {
                EngineEvent::Progress { current, total } => {
                    hooks.report_progress(current, total);
                    Ok(())
                }
                EngineEvent::Text { value } => hooks.emit(OutputValue::Text(value)),
                EngineEvent::Image { path } => fs::read(&path)
                    .map_err(|err| ExecutionError::io(&path, err))
                    .and_then(|bytes| hooks.emit(OutputValue::Image(ImageData { bytes }))),
                EngineEvent::Error { message } => {
                    engine_error = Some(message);
                    Ok(())
                }
            };
            if let Err(err) = handled {
                break Err(err);
            }
        };

        let outcome = match outcome {
            Ok(()) => self.wait_for_exit(&mut child, started),
            Err(err) => Err(err),
        };
        let status = match outcome {
            Ok(status) => status,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(err);
            }
        };
        let _ = stdout_reader.join();
        let stderr = stderr_reader.join().unwrap_or_default();

        if let Some(message) = engine_error {
            return Err(ExecutionError::Engine(message));
        }
        if !status.success() {
            let detail = stderr.trim();
            return Err(ExecutionError::Engine(if detail.is_empty() {
                format!("engine exited with code {}", status.code().unwrap_or(-1))
            } else {
                detail.to_string()
            }));
        }
        tracing::debug!(
            command = %handle.command_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine finished"
        );
        Ok(())
    }
}

impl ProcessExecutor {
    /// Stdout is closed; the child still has to exit within the job deadline.
    fn wait_for_exit(
        &self,
        child: &mut Child,
        started: Instant,
    ) -> Result<ExitStatus, ExecutionError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if started.elapsed() >= self.config.timeout {
                        return Err(ExecutionError::Timeout {
                            timeout_secs: self.config.timeout.as_secs(),
                        });
                    }
                    thread::sleep(EXIT_POLL);
                }
                Err(err) => return Err(ExecutionError::io(&self.config.program, err)),
            }
        }
    }
}

/// Writes an input image for the engine. With a node cache, identical images
/// for the same node of the same workflow revision reuse one staged file.
fn stage_image(
    handle: &ExecutableHandle,
    port: &PortSpec,
    image: &ImageData,
    job_dir: &Path,
    cache: Option<&NodeCache>,
) -> Result<PathBuf, ExecutionError> {
    let digest = hex_encode(&Sha256::digest(&image.bytes));
    let write = |dir: &Path, name: String| -> Result<PathBuf, ExecutionError> {
        fs::create_dir_all(dir).map_err(|err| ExecutionError::io(dir, err))?;
        let path = dir.join(name);
        fs::write(&path, &image.bytes).map_err(|err| ExecutionError::io(&path, err))?;
        Ok(path)
    };

    let Some(cache) = cache else {
        return write(job_dir, format!("{}.img", port.name()));
    };
    let shared_dir = job_dir
        .parent()
        .map(|scratch| scratch.join("cache"))
        .unwrap_or_else(|| job_dir.join("cache"));
    let identity = NodeCache::node_identity(handle, &port.node_id);
    let staged: Arc<PathBuf> = cache.get_or_compute(&identity, &json!({"image": digest}), || {
        write(&shared_dir, format!("{digest}.img"))
    })?;
    if staged.is_file() {
        return Ok(staged.as_ref().clone());
    }
    write(&shared_dir, format!("{digest}.img"))
}
