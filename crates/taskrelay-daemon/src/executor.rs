//! Auto job execution.
//!
//! Each auto job runs the agent as a child process in its own task. The
//! child's stream-json stdout is parsed into steps and a final result, and the
//! job's terminal state is written back through the store handle. Nothing that
//! goes wrong inside a job escapes this module; it all ends up on the job.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Error};
use taskrelay_core::config::Config;
use taskrelay_core::job::{Job, JobStatus};
use taskrelay_core::output::parse_output;
use taskrelay_core::store::StoreHandle;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long to wait for stdout/stderr to drain once the child has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionMode {
    /// `--dangerously-skip-permissions`
    Unrestricted,
    /// `--permission-mode acceptEdits --allowedTools <list>`
    AllowList(Vec<String>),
}

/// How the agent is invoked for auto jobs.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_bin: String,
    pub max_turns: u32,
    pub permissions: PermissionMode,
    pub timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        let permissions = if config.skip_permissions {
            PermissionMode::Unrestricted
        } else {
            PermissionMode::AllowList(config.allowed_tools.clone())
        };
        Self {
            agent_bin: config.agent_bin.clone(),
            max_turns: config.max_turns,
            permissions,
            timeout: config.job_timeout(),
        }
    }
}

/// Supervises concurrently running auto jobs.
#[derive(Clone)]
pub struct Executor {
    settings: Arc<AgentSettings>,
    store: StoreHandle,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Executor {
    /// `max_concurrent` of None runs every submitted job immediately.
    pub fn new(
        settings: AgentSettings,
        store: StoreHandle,
        max_concurrent: Option<usize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            limiter: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Starts `job` in the background. The job must already be in the ledger as pending.
    pub fn submit(&self, job: Job) {
        let settings = Arc::clone(&self.settings);
        let store = self.store.clone();
        let limiter = self.limiter.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            run_job(&settings, &store, limiter, &cancel, job).await;
        });
    }

    /// Number of jobs that are running or waiting for a slot.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every submitted job to return.
    ///
    /// Running jobs finish on their own (each is bounded by the timeout);
    /// jobs still waiting for a slot return once cancellation fires.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_job(
    settings: &AgentSettings,
    store: &StoreHandle,
    limiter: Option<Arc<Semaphore>>,
    cancel: &CancellationToken,
    mut job: Job,
) {
    let _permit = match limiter {
        Some(semaphore) => {
            tokio::select! {
                biased;
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                () = cancel.cancelled() => {
                    info!(job = %job.id, "Shutting down; job stays pending");
                    return;
                }
            }
        }
        None => None,
    };

    if let Err(err) = job.transition(JobStatus::Running) {
        warn!(job = %job.id, "{err:#}");
        return;
    }
    if let Err(err) = store.update(job.clone()).await {
        error!(job = %job.id, "Could not mark job running: {err:#}");
        return;
    }
    info!(job = %job.id, label = %job.label(), "Running auto job");

    let started = Instant::now();
    let outcome = run_agent(settings, &job.prompt).await;
    resolve_outcome(&mut job, outcome, started.elapsed());

    match job.status {
        JobStatus::Completed => info!(
            job = %job.id,
            cost_usd = job.cost_usd,
            duration_ms = job.duration_ms,
            "Auto job completed"
        ),
        _ => warn!(
            job = %job.id,
            error = job.error.as_deref().unwrap_or_default(),
            "Auto job failed"
        ),
    }

    if let Err(err) = store.update(job.clone()).await {
        error!(job = %job.id, "Could not record job outcome: {err:#}");
    }
}

/// What happened to one agent process.
#[derive(Debug)]
pub enum RunOutcome {
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        after: Duration,
        stdout: String,
    },
    /// The process could not be started or supervised.
    Failed(Error),
}

/// Runs the agent once for `prompt`.
pub async fn run_agent(settings: &AgentSettings, prompt: &str) -> RunOutcome {
    let mut command = Command::new(&settings.agent_bin);
    command
        .args(build_agent_args(settings, prompt))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command
        .spawn()
        .with_context(|| format!("Failed to spawn agent '{}'", settings.agent_bin))
    {
        Ok(child) => child,
        Err(err) => return RunOutcome::Failed(err),
    };

    let stdout = PipeCapture::spawn(child.stdout.take());
    let stderr = PipeCapture::spawn(child.stderr.take());

    match tokio::time::timeout(settings.timeout, child.wait()).await {
        Ok(Ok(status)) => RunOutcome::Exited {
            code: status.code(),
            stdout: stdout.drain().await,
            stderr: stderr.drain().await,
        },
        Ok(Err(err)) => {
            RunOutcome::Failed(Error::new(err).context("Failed to wait for agent process"))
        }
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!("Failed to kill timed out agent: {err}");
            }
            stderr.abort();
            RunOutcome::TimedOut {
                after: settings.timeout,
                stdout: stdout.drain().await,
            }
        }
    }
}

/// Output of one child pipe, collected by a background reader.
///
/// Bytes land in the shared buffer as they are read, so whatever arrived
/// before the reader is stopped is still available.
struct PipeCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl PipeCapture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let reader = tokio::spawn(read_pipe(pipe, Arc::clone(&buf)));
        Self { buf, reader }
    }

    fn abort(&self) {
        self.reader.abort();
    }

    /// Waits for EOF, giving up if a leftover grandchild keeps the pipe open.
    async fn drain(mut self) -> String {
        if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut self.reader)
            .await
            .is_err()
        {
            debug!("Agent pipe still open after exit; keeping partial output");
            self.reader.abort();
        }
        let buf = self.buf.lock().await;
        String::from_utf8_lossy(&buf).into_owned()
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>, buf: Arc<Mutex<Vec<u8>>>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = vec![0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
            Err(err) => {
                debug!("Agent pipe read stopped: {err}");
                break;
            }
        }
    }
}

/// Applies an agent run to `job`, leaving it Completed or Failed.
pub fn resolve_outcome(job: &mut Job, outcome: RunOutcome, elapsed: Duration) {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

    match outcome {
        RunOutcome::Exited {
            code,
            stdout,
            stderr,
        } => {
            let parsed = parse_output(&stdout);
            job.steps = Some(parsed.steps);
            job.duration_ms = Some(elapsed_ms);

            if let Some(result) = parsed.result {
                job.cost_usd = result.total_cost_usd;
                if let Some(ms) = result.duration_ms {
                    job.duration_ms = Some(ms);
                }
                if result.is_error {
                    job.error = result.text();
                    finish(job, JobStatus::Failed);
                } else {
                    job.result = result.text();
                    finish(job, JobStatus::Completed);
                }
            } else if code == Some(0) {
                let stdout = stdout.trim();
                job.result = (!stdout.is_empty()).then(|| stdout.to_string());
                finish(job, JobStatus::Completed);
            } else {
                let stderr = stderr.trim();
                job.error = Some(if !stderr.is_empty() {
                    stderr.to_string()
                } else if let Some(code) = code {
                    format!("agent exited with code {code}")
                } else {
                    "agent was terminated by a signal".to_string()
                });
                finish(job, JobStatus::Failed);
            }
        }
        RunOutcome::TimedOut { after, stdout } => {
            job.steps = Some(parse_output(&stdout).steps);
            job.duration_ms = Some(elapsed_ms);
            job.error = Some(format!("timed out after {} seconds", after.as_secs()));
            finish(job, JobStatus::Failed);
        }
        RunOutcome::Failed(err) => {
            job.error = Some(format!("{err:#}"));
            finish(job, JobStatus::Failed);
        }
    }
}

fn finish(job: &mut Job, status: JobStatus) {
    debug_assert!(job.status.can_transition_to(status));
    job.status = status;
}

fn build_agent_args(settings: &AgentSettings, prompt: &str) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-p"),
        OsString::from(prompt),
        OsString::from("--output-format"),
        OsString::from("stream-json"),
        OsString::from("--verbose"),
        OsString::from("--max-turns"),
        OsString::from(settings.max_turns.to_string()),
    ];

    match &settings.permissions {
        PermissionMode::Unrestricted => {
            args.push(OsString::from("--dangerously-skip-permissions"));
        }
        PermissionMode::AllowList(tools) => {
            args.push(OsString::from("--permission-mode"));
            args.push(OsString::from("acceptEdits"));
            if !tools.is_empty() {
                args.push(OsString::from("--allowedTools"));
                args.push(OsString::from(tools.join(",")));
            }
        }
    }

    args
}
