//! Child process execution with timeouts and bounded output.

use std::collections::BTreeMap;
use std::io::Read;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Everything needed to spawn one child process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            timeout,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// How long to keep draining output after the process group was killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

type Reader = JoinHandle<Result<(Vec<u8>, usize)>>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, with truncation notices.
    pub fn combined(&self) -> String {
        let mut buf = self.stdout_text();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        let stderr = self.stderr_text();
        if !stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&stderr);
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        buf
    }
}

/// Run a process with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. The child leads its own
/// process group; on timeout the whole group is killed and the child reaped,
/// and the result has `timed_out = true`. Descendants that keep the output
/// pipes open after the child exits are killed once the timeout elapses, so
/// the call never outlives `timeout` by more than [`KILL_GRACE`]. Spawn
/// failures (missing program, bad cwd) are returned as errors.
#[instrument(skip_all, fields(program = %spec.program, timeout_secs = spec.timeout.as_secs()))]
pub fn run_process(spec: &ProcessSpec) -> Result<CommandOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {}", spec.program));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = spec.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let started = Instant::now();
    let mut timed_out = false;
    let status = match child.wait_timeout(spec.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            if !kill_process_group(child.id()) {
                child.kill().context("kill command")?;
            }
            child.wait().context("wait command after kill")?
        }
    };

    let drain_deadline = if timed_out {
        Instant::now() + KILL_GRACE
    } else {
        started + spec.timeout
    };
    if !wait_readers(&stdout_handle, &stderr_handle, drain_deadline) && !timed_out {
        warn!("descendant process still holds output open, killing process group");
        kill_process_group(child.id());
        wait_readers(&stdout_handle, &stderr_handle, Instant::now() + KILL_GRACE);
    }

    let (stdout, stdout_truncated) = take_output(stdout_handle, "stdout")?;
    let (stderr, stderr_truncated) = take_output(stderr_handle, "stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Send SIGKILL to the group led by `pid`. Returns false if no signal was sent.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: killpg only sends a signal and touches no memory.
    unsafe { libc::killpg(pgid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> bool {
    false
}

/// Poll until both readers hit EOF or `deadline` passes.
fn wait_readers(stdout: &Reader, stderr: &Reader, deadline: Instant) -> bool {
    loop {
        if stdout.is_finished() && stderr.is_finished() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Join a finished reader. A reader still blocked on a pipe held by an
/// unkillable descendant is detached and its output dropped.
fn take_output(handle: Reader, stream: &str) -> Result<(Vec<u8>, usize)> {
    if !handle.is_finished() {
        warn!(stream, "output stream still open, abandoning reader");
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result.with_context(|| format!("read {stream}")),
        Err(_) => Err(anyhow!("{stream} reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
