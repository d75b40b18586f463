//! Managed child processes.
//!
//! Spawns the dashboard and tunnel processes, forwards every output line into
//! the tracing stream, and keeps an explicit handle for `terminate`/`wait`
//! instead of relying on shell job control.
//!
//! Output is either piped through the launcher or written by the child
//! straight into a file that the launcher follows. A file-backed process
//! never writes into a pipe owned by the launcher, so it survives the
//! launcher's exit.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Delay between reads of a followed output file once it is drained.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    /// Combined stdout/stderr destination, truncated at spawn. Output is
    /// piped through the launcher when unset.
    pub output_file: Option<PathBuf>,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
            output_file: None,
            terminate_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    #[must_use]
    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }
}

/// Shared, line-buffered capture of a process's combined output.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<OutputInner>>,
}

#[derive(Debug, Default)]
struct OutputInner {
    text: String,
    released: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: &str) {
        let mut inner = self.lock();
        if !inner.released {
            inner.text.push_str(line);
            inner.text.push('\n');
        }
    }

    /// Everything captured so far.
    pub fn snapshot(&self) -> String {
        self.lock().text.clone()
    }

    /// Stop retaining lines in memory. Lines are still forwarded to tracing.
    pub fn release(&self) {
        let mut inner = self.lock();
        inner.released = true;
        inner.text = String::new();
    }

    fn lock(&self) -> MutexGuard<'_, OutputInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running child process.
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    child: Child,
    pid: Option<u32>,
    terminate_timeout: Duration,
    /// Set once the child is reaped so the output-file follower finishes.
    follow_done: Option<Arc<AtomicBool>>,
}

impl ManagedProcess {
    /// Spawn `spec`, forwarding its output line by line to tracing (as
    /// `source = label`) and into `capture` when given.
    pub fn spawn(
        spec: &ProcessSpec,
        label: &str,
        capture: Option<OutputBuffer>,
    ) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let follow_reader = match &spec.output_file {
            Some(path) => {
                let (stdout, stderr, reader) =
                    open_output_file(path).map_err(|e| ProcessError::OutputFile {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                cmd.stdout(stdout).stderr(stderr);
                Some(reader)
            }
            None => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                None
            }
        };

        info!(
            label,
            program = %spec.program.display(),
            args = ?spec.args,
            output_file = ?spec.output_file,
            "Spawning process"
        );
        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let follow_done = if let Some(reader) = follow_reader {
            let done = Arc::new(AtomicBool::new(false));
            follow_file(reader, label.to_string(), capture, Arc::clone(&done));
            Some(done)
        } else {
            let stdout = child
                .stdout
                .take()
                .ok_or(ProcessError::MissingPipe { stream: "stdout" })?;
            let stderr = child
                .stderr
                .take()
                .ok_or(ProcessError::MissingPipe { stream: "stderr" })?;
            forward_lines(stdout, label.to_string(), "stdout", capture.clone());
            forward_lines(stderr, label.to_string(), "stderr", capture);
            None
        };

        info!(label, pid, "Process started");
        Ok(Self {
            label: label.to_string(),
            child,
            pid,
            terminate_timeout: spec.terminate_timeout,
            follow_done,
        })
    }

    /// OS process id captured at spawn time.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Block until the process exits.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let status = self.child.wait().await.map_err(|e| ProcessError::Wait {
            label: self.label.clone(),
            reason: e.to_string(),
        });
        self.stop_following();
        status
    }

    /// Stop the process: SIGTERM first, SIGKILL after the grace period.
    ///
    /// Returns the exit status when it could be collected.
    pub async fn terminate(&mut self) -> Option<ExitStatus> {
        let status = self.signal_and_reap().await;
        self.stop_following();
        status
    }

    async fn signal_and_reap(&mut self) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(label = %self.label, ?status, "Process already exited");
            return Some(status);
        }

        debug!(label = %self.label, pid = self.pid, "Terminating process");

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    warn!(label = %self.label, pid, error = %e, "Failed to send SIGTERM");
                }
            }
        }
        #[cfg(not(unix))]
        {
            self.child.kill().await.ok();
        }

        match tokio::time::timeout(self.terminate_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(label = %self.label, ?status, "Process exited");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(label = %self.label, error = %e, "Error waiting for process");
                self.child.kill().await.ok();
                None
            }
            Err(_) => {
                warn!(label = %self.label, "Timeout waiting for graceful shutdown, killing");
                self.child.kill().await.ok();
                self.child.wait().await.ok()
            }
        }
    }

    /// Give up the handle without stopping the process. A file-backed
    /// process outlives the launcher; its file is followed while the
    /// launcher runs.
    pub fn detach(self) -> Option<u32> {
        if self.follow_done.is_none() {
            warn!(
                label = %self.label,
                pid = self.pid,
                "Detached process writes into launcher pipes and may stop with the launcher"
            );
        }
        info!(label = %self.label, pid = self.pid, "Leaving process running");
        self.pid
    }

    fn stop_following(&self) {
        if let Some(done) = &self.follow_done {
            done.store(true, Ordering::Release);
        }
    }
}

/// Map an exit status to a shell-style exit code (`128 + signal` when the
/// process was killed by a signal).
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Truncate `path`, then open it twice for appending (child stdout and
/// stderr) and once for reading from the start.
fn open_output_file(path: &Path) -> std::io::Result<(File, File, File)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path)?;
    let stdout = OpenOptions::new().append(true).open(path)?;
    let stderr = stdout.try_clone()?;
    let reader = File::open(path)?;
    Ok((stdout, stderr, reader))
}

fn emit_line(raw: &[u8], label: &str, stream: &'static str, capture: Option<&OutputBuffer>) {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n']);
    info!(source = %label, stream, "{line}");
    if let Some(buffer) = capture {
        buffer.push_line(line);
    }
}

fn forward_lines<R>(reader: R, label: String, stream: &'static str, capture: Option<OutputBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => emit_line(&raw, &label, stream, capture.as_ref()),
                Err(e) => {
                    warn!(source = %label, stream, error = %e, "Failed to read process output");
                    break;
                }
            }
        }
        debug!(source = %label, stream, "Output stream closed");
    });
}

/// Tail a growing output file. Once `done` is set the file is drained one
/// last time and any unterminated trailing line is emitted.
fn follow_file(file: File, label: String, capture: Option<OutputBuffer>, done: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::fs::File::from_std(file));
        let mut raw = Vec::new();
        let mut draining = false;
        loop {
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) if draining => {
                    if !raw.is_empty() {
                        emit_line(&raw, &label, "output", capture.as_ref());
                    }
                    break;
                }
                Ok(0) => {
                    if done.load(Ordering::Acquire) {
                        draining = true;
                    } else {
                        tokio::time::sleep(FOLLOW_INTERVAL).await;
                    }
                }
                Ok(_) if raw.ends_with(b"\n") => {
                    emit_line(&raw, &label, "output", capture.as_ref());
                    raw.clear();
                }
                // Partial line; the rest has not been written yet.
                Ok(_) => {}
                Err(e) => {
                    warn!(source = %label, error = %e, "Failed to read process output file");
                    break;
                }
            }
        }
        debug!(source = %label, "Output file closed");
    });
}

/// Errors from process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to capture {stream}")]
    MissingPipe { stream: &'static str },

    #[error("Failed to open output file {}: {reason}", path.display())]
    OutputFile { path: PathBuf, reason: String },

    #[error("Failed to wait for {label}: {reason}")]
    Wait { label: String, reason: String },
}
