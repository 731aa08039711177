//! Worker process lifecycle management.
//!
//! Spawns prediction workers as long-running child processes and fit workers
//! as one-shot children, signals them, and reaps them.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::ipc_types::IpcEndpoint;

/// Lines of worker stderr kept for the exit log.
const STDERR_TAIL_LINES: usize = 50;

/// How long the exit report waits for stderr to close once the worker has
/// exited. Descendants that inherited stderr may keep it open far longer.
const STDERR_TAIL_WAIT: Duration = Duration::from_millis(200);

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Program plus leading arguments used to launch a worker. The per-launch
/// positional arguments are appended after these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProgram {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerProgram {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// This executable in built-in worker mode (`<exe> --worker <mode>`).
    pub fn current_exe(mode: &str) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).with_args(["--worker", mode]))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Signals the server sends to its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful stop, equivalent to Ctrl-C.
    Interrupt,
    Kill,
}

/// Send `signal` to the process `pid`.
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let signo = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Spawn a prediction worker: `<program> <args..> <endpoint> <artifact>`.
///
/// stderr is piped so the supervisor can log it; the child is killed if its
/// handle is dropped.
pub fn spawn_predict_worker(
    program: &WorkerProgram,
    endpoint: &IpcEndpoint,
    artifact: &Path,
) -> io::Result<Child> {
    debug!(
        "[PROCESS_MGR] Spawning worker: {} {:?} {endpoint} {}",
        program.program.display(),
        program.args,
        artifact.display()
    );

    program
        .command()
        .arg(endpoint.to_string())
        .arg(artifact)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Run a fit worker to completion: `<program> <args..> <output_dir> <data_file>`.
pub async fn run_fit_worker(
    program: &WorkerProgram,
    output_dir: &Path,
    data_file: &Path,
) -> io::Result<Output> {
    debug!(
        "[PROCESS_MGR] Running fit worker: {} {:?} {} {}",
        program.program.display(),
        program.args,
        output_dir.display(),
        data_file.display()
    );

    program
        .command()
        .arg(output_dir)
        .arg(data_file)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
}

/// How a supervised worker ended.
#[derive(Debug)]
pub struct ExitReport {
    pub status: io::Result<ExitStatus>,
    /// Last lines the worker wrote to stderr.
    pub stderr_tail: String,
}

impl ExitReport {
    pub fn log(&self, model_id: &str) {
        match &self.status {
            Ok(status) if status.success() => info!("model {model_id} exited"),
            Ok(status) => error!("model {model_id} exited: {status} {}", self.stderr_tail),
            Err(e) => error!("model {model_id}: failed waiting for worker: {e}"),
        }
    }
}

/// Wait for the worker to exit, forwarding its stderr to the log meanwhile.
///
/// Returns as soon as the process is reaped. stderr keeps being forwarded on
/// its own task until every holder of the pipe has closed it.
pub async fn supervise(model_id: &str, mut child: Child) -> ExitReport {
    let tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let drain = child.stderr.take().map(|stderr| {
        tokio::spawn(drain_stderr(model_id.to_string(), stderr, Arc::clone(&tail)))
    });

    let status = child.wait().await;
    if let Some(drain) = drain {
        if tokio::time::timeout(STDERR_TAIL_WAIT, drain).await.is_err() {
            debug!("[PROCESS_MGR] stderr of model {model_id} still open after exit");
        }
    }

    let stderr_tail = tail
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    ExitReport {
        status,
        stderr_tail,
    }
}

async fn drain_stderr(model_id: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{model_id}] {line}");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
