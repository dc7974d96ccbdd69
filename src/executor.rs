use crate::error::{Error, Result};
use crate::storage::{Completion, CommandTemplate, ExecutionRecord, ExecutionStatus};
use crate::store_manager::ExecutionStore;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Exit code recorded when the process never ran.
const LAUNCH_FAILURE_EXIT_CODE: i32 = 1;
/// Exit code recorded when the process was terminated by a signal.
const SIGNAL_EXIT_CODE: i32 = -1;

/// Rejects a blank command or working directory.
pub fn validate_command(working_dir: &str, command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(Error::validation("command cannot be empty"));
    }
    if working_dir.trim().is_empty() {
        return Err(Error::validation("workdir cannot be empty"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub working_dir: String,
    pub command: String,
    pub command_id: Option<String>,
    pub name: Option<String>,
    pub initiated_by: Option<String>,
}

impl ExecutionRequest {
    pub fn ad_hoc(working_dir: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            command: command.into(),
            command_id: None,
            name: None,
            initiated_by: None,
        }
    }

    /// Copies what to run out of `template`; later edits to it do not
    /// reach the execution.
    pub fn from_template(template: &CommandTemplate) -> Self {
        Self {
            working_dir: template.working_dir.clone(),
            command: template.command.clone(),
            command_id: Some(template.id.clone()),
            name: Some(template.name.clone()),
            initiated_by: None,
        }
    }

    pub fn initiated_by(mut self, who: Option<String>) -> Self {
        self.initiated_by = who.filter(|w| !w.trim().is_empty());
        self
    }
}

/// Where a submitted command runs.
#[derive(Debug, Clone)]
pub enum Launcher {
    /// A thread of this process. The run is lost if the process exits first.
    Thread,
    /// A separate `<program> <args..> <id>` process in its own process group,
    /// which runs the record through `run_to_completion` and outlives the
    /// caller. Its stderr is appended to `log` when set.
    Worker {
        program: PathBuf,
        args: Vec<String>,
        log: Option<PathBuf>,
    },
}

/// Launches shell commands in the background and tracks them as records.
///
/// Every submission gets its own thread or worker process; there is no limit
/// on how many run at once, no timeout and no cancellation. A command that
/// never exits leaves its record `running`.
pub struct CommandExecutor {
    store: Arc<ExecutionStore>,
    shell: String,
    launcher: Launcher,
}

impl CommandExecutor {
    pub fn new(store: Arc<ExecutionStore>, shell: impl Into<String>) -> Self {
        Self {
            store,
            shell: shell.into(),
            launcher: Launcher::Thread,
        }
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Records a `running` execution and starts it without waiting.
    ///
    /// Only validation errors are returned. What happens to the process is
    /// reported later through the record.
    pub fn submit(&self, request: ExecutionRequest) -> Result<ExecutionRecord> {
        let record = self.enqueue(request)?;
        match &self.launcher {
            Launcher::Thread => self.spawn_run(&record),
            Launcher::Worker { program, args, log } => {
                if let Err(e) = spawn_worker(program, args, log.as_deref(), &record.id) {
                    finish(
                        &self.store,
                        &record.id,
                        ProcessOutcome::LaunchFailed {
                            output: String::new(),
                            error: format!("failed to start worker {}: {}", program.display(), e),
                        },
                    );
                }
            }
        }
        Ok(record)
    }

    /// Validates `request` and stores it as a `running` record without
    /// starting anything.
    fn enqueue(&self, request: ExecutionRequest) -> Result<ExecutionRecord> {
        validate_command(&request.working_dir, &request.command)?;

        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            command_id: request.command_id,
            name: request.name,
            working_dir: request.working_dir,
            command: request.command,
            status: ExecutionStatus::Running,
            output: String::new(),
            exit_code: None,
            executed_by: request.initiated_by,
            started_at: Utc::now(),
            ended_at: None,
            duration: None,
        };

        if let Err(e) = self.store.insert(record.clone()) {
            log::warn!("execution {} is running but could not be saved: {}", record.id, e);
        }
        log::info!("execution {} started: {}", record.id, record.command);
        Ok(record)
    }

    fn spawn_run(&self, record: &ExecutionRecord) {
        let store = Arc::clone(&self.store);
        let id = record.id.clone();
        let shell = self.shell.clone();
        let working_dir = record.working_dir.clone();
        let command = record.command.clone();

        let spawned = thread::Builder::new()
            .name(format!("exec-{}", short_id(&record.id)))
            .spawn(move || {
                let outcome = run_process(&shell, &working_dir, &command);
                finish(&store, &id, outcome);
            });

        if let Err(e) = spawned {
            finish(
                &self.store,
                &record.id,
                ProcessOutcome::LaunchFailed {
                    output: String::new(),
                    error: format!("failed to start worker thread: {}", e),
                },
            );
        }
    }

    /// Runs an already recorded `running` execution on the calling thread and
    /// returns the record as it ends up.
    ///
    /// A record that is already terminal is returned untouched.
    pub fn run_to_completion(&self, id: &str) -> Result<ExecutionRecord> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::not_found("execution", id))?;
        if record.status.is_terminal() {
            log::warn!("execution {} already finished, not running it again", id);
            return Ok(record);
        }

        let outcome = run_process(&self.shell, &record.working_dir, &record.command);
        finish(&self.store, id, outcome);
        self.get(id).ok_or_else(|| Error::not_found("execution", id))
    }

    pub fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.store.get(id)
    }

    /// Most recently started first.
    pub fn list_all(&self) -> Vec<ExecutionRecord> {
        self.store.list_all()
    }

    #[allow(dead_code)]
    pub fn list_recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.list_page(Some(limit)).0
    }

    /// At most `limit` of the most recent records (all of them for `None`),
    /// together with how many exist, taken from one snapshot.
    pub fn list_page(&self, limit: Option<usize>) -> (Vec<ExecutionRecord>, usize) {
        let mut records = self.list_all();
        let total = records.len();
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        (records, total)
    }

    /// Returns whether the record existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.store.remove(id)?)
    }

    pub fn clear_all(&self) -> Result<()> {
        Ok(self.store.clear()?)
    }

    /// Polls until the record is terminal. `None` if it disappears.
    pub fn wait_for_terminal(&self, id: &str, poll_interval: Duration) -> Option<ExecutionRecord> {
        loop {
            let record = self.get(id)?;
            if record.status.is_terminal() {
                return Some(record);
            }
            thread::sleep(poll_interval);
        }
    }
}

enum ProcessOutcome {
    Exited {
        code: Option<i32>,
        output: String,
    },
    LaunchFailed {
        output: String,
        error: String,
    },
}

fn spawn_worker(program: &Path, args: &[String], log: Option<&Path>, id: &str) -> io::Result<()> {
    let stderr = match log {
        Some(path) => Stdio::from(OpenOptions::new().create(true).append(true).open(path)?),
        None => Stdio::null(),
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .arg(id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Out of the terminal's foreground group, so Ctrl+C only stops the caller
        command.process_group(0);
    }

    let child = command.spawn()?;
    log::debug!("execution {} handed to worker pid {}", id, child.id());
    Ok(())
}

fn run_process(shell: &str, working_dir: &str, command: &str) -> ProcessOutcome {
    let mut child = match Command::new(shell)
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ProcessOutcome::LaunchFailed {
                output: String::new(),
                error: format!("failed to start {} in {}: {}", shell, working_dir, e),
            }
        }
    };

    // Both pipes are drained concurrently so a full stderr cannot stall stdout
    let stdout_handle = child.stdout.take().map(drain);
    let stderr_handle = child.stderr.take().map(drain);

    let status = child.wait();

    let stdout = collect(stdout_handle, "stdout");
    let stderr = collect(stderr_handle, "stderr");
    let output = combine_output(&stdout, &stderr);

    match status {
        Ok(status) => ProcessOutcome::Exited {
            code: status.code(),
            output,
        },
        Err(e) => ProcessOutcome::LaunchFailed {
            output,
            error: format!("failed to wait for {}: {}", shell, e),
        },
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut collected = Vec::new();
        reader.read_to_end(&mut collected)?;
        Ok(collected)
    })
}

fn collect(handle: Option<JoinHandle<io::Result<Vec<u8>>>>, stream: &str) -> Vec<u8> {
    match handle.map(|h| h.join()) {
        Some(Ok(Ok(bytes))) => bytes,
        Some(Ok(Err(e))) => {
            log::warn!("failed to read {}: {}", stream, e);
            Vec::new()
        }
        Some(Err(_)) => {
            log::warn!("{} reader panicked", stream);
            Vec::new()
        }
        None => Vec::new(),
    }
}

/// All of stdout, then stderr, separated by one newline when both are
/// present. Chronological interleaving between the two is not kept.
fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&String::from_utf8_lossy(stderr));
    }
    output
}

fn completion_for(outcome: ProcessOutcome) -> Completion {
    let ended_at = Utc::now();
    match outcome {
        ProcessOutcome::Exited { code, output } => {
            let exit_code = code.unwrap_or(SIGNAL_EXIT_CODE);
            let status = if exit_code == 0 {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            };
            Completion {
                status,
                exit_code,
                output,
                ended_at,
            }
        }
        ProcessOutcome::LaunchFailed { mut output, error } => {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&format!("Error: {}", error));
            Completion {
                status: ExecutionStatus::Failed,
                exit_code: LAUNCH_FAILURE_EXIT_CODE,
                output,
                ended_at,
            }
        }
    }
}

fn finish(store: &ExecutionStore, id: &str, outcome: ProcessOutcome) {
    let completion = completion_for(outcome);
    let (status, exit_code) = (completion.status, completion.exit_code);

    match store.complete(id, completion) {
        Ok(true) => log::info!(
            "execution {} finished: {} (exit code {})",
            id,
            status,
            exit_code
        ),
        Ok(false) => log::debug!("execution {} was removed before it finished", id),
        Err(e) => log::warn!("execution {} finished but could not be saved: {}", id, e),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
