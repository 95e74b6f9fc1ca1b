use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
    time,
};
use tracing::{debug, warn};

use crate::CaptureError;

/// Upper bound on how long a killed (or finishing) tshark process is waited on.
pub const REAP_TIMEOUT: Duration = Duration::from_secs(1);

const ESRCH: i32 = 3;

/// Binary plus argument list of one tshark run. Carried by crash errors for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    binary: PathBuf,
    args: Vec<String>,
}

impl Invocation {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Identifies a process registered with a [`ProcessSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

/// Read side of one running tshark process.
///
/// The child itself stays registered with the supervisor that spawned it, so it can be
/// terminated from any exit path even while this handle is borrowed by a read loop.
#[derive(Debug)]
pub struct ProcessHandle {
    id: ProcessId,
    invocation: Invocation,
    stdout: ChildStdout,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    /// Appends at most `max` bytes of stdout to `out`. Returns 0 at end of stream.
    pub(crate) async fn read_chunk(&mut self, max: usize, out: &mut Vec<u8>) -> io::Result<usize> {
        out.reserve(max);
        let mut limited = (&mut self.stdout).take(max as u64);
        limited.read_buf(out).await
    }
}

#[derive(Debug)]
struct LiveProcess {
    child: Child,
    invocation: Invocation,
}

#[derive(Debug, Default)]
struct SupervisorInner {
    next_id: AtomicU64,
    live: Mutex<HashMap<ProcessId, LiveProcess>>,
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        let live = self.live.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (id, process) in live.iter_mut() {
            debug!(?id, invocation = %process.invocation, "killing abandoned tshark process");
            // Children are spawned with kill_on_drop; tokio reaps them in the background.
            let _ = process.child.start_kill();
        }
    }
}

/// Spawns tshark processes and guarantees every one of them is killed and reaped.
///
/// Cloning is cheap; clones share the same set of live processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
    debug: bool,
}

impl ProcessSupervisor {
    /// When `debug` is set, tshark's stderr is inherited instead of discarded.
    pub fn new(debug: bool) -> Self {
        Self {
            inner: Arc::default(),
            debug,
        }
    }

    /// Launches tshark with a piped stdout and registers it as live.
    pub async fn spawn(
        &self,
        invocation: Invocation,
        stdin: Stdio,
    ) -> Result<ProcessHandle, CaptureError> {
        let mut command = Command::new(invocation.binary());
        command
            .args(invocation.args())
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(if self.debug {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        debug!(binary = ?invocation.binary(), args = ?invocation.args(), "spawning tshark");
        let mut child = spawn_with_retry(&mut command, invocation.binary()).await?;

        if let Ok(Some(status)) = child.try_wait() {
            check_exit(status, &invocation)?;
        }

        let stdout = child.stdout.take().ok_or(CaptureError::StdoutUnavailable)?;
        let id = ProcessId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.live().insert(
            id,
            LiveProcess {
                child,
                invocation: invocation.clone(),
            },
        );
        debug!(?id, "tshark subprocess created");

        Ok(ProcessHandle {
            id,
            invocation,
            stdout,
        })
    }

    /// Kills `id` if it is still running and waits up to [`REAP_TIMEOUT`] for it to exit.
    ///
    /// A process that already exited with a positive status is reported as crashed.
    pub async fn terminate(&self, id: ProcessId) -> Result<(), CaptureError> {
        match self.take(id) {
            Some(process) => terminate_process(process).await,
            None => Ok(()),
        }
    }

    /// Waits up to [`REAP_TIMEOUT`] for `id` to exit on its own (its stdout reached EOF),
    /// falling back to [`ProcessSupervisor::terminate`].
    pub async fn finish(&self, id: ProcessId) -> Result<(), CaptureError> {
        let Some(mut process) = self.take(id) else {
            return Ok(());
        };
        let waited = time::timeout(REAP_TIMEOUT, process.child.wait()).await;
        match waited {
            Ok(Ok(status)) => check_exit(status, &process.invocation),
            Ok(Err(err)) => swallow_kill_error(err),
            Err(_) => terminate_process(process).await,
        }
    }

    /// Terminates every live process. Safe to call repeatedly; the first error is returned
    /// after all processes have been dealt with.
    pub async fn terminate_all(&self) -> Result<(), CaptureError> {
        let drained: Vec<LiveProcess> = self.live().drain().map(|(_, process)| process).collect();
        let mut first_error = None;
        for process in drained {
            if let Err(err) = terminate_process(process).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    pub fn is_live(&self, id: ProcessId) -> bool {
        self.live().contains_key(&id)
    }

    fn take(&self, id: ProcessId) -> Option<LiveProcess> {
        self.live().remove(&id)
    }

    fn live(&self) -> MutexGuard<'_, HashMap<ProcessId, LiveProcess>> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn terminate_process(mut process: LiveProcess) -> Result<(), CaptureError> {
    match process.child.try_wait() {
        Ok(Some(status)) => return check_exit(status, &process.invocation),
        Ok(None) => {}
        Err(err) => return swallow_kill_error(err),
    }

    if let Err(err) = process.child.start_kill() {
        return swallow_kill_error(err);
    }
    match time::timeout(REAP_TIMEOUT, process.child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, invocation = %process.invocation, "tshark process killed");
            Ok(())
        }
        Ok(Err(err)) => swallow_kill_error(err),
        Err(_) => {
            warn!(
                invocation = %process.invocation,
                timeout = ?REAP_TIMEOUT,
                "waiting for tshark to exit failed, process may linger"
            );
            Ok(())
        }
    }
}

fn check_exit(status: ExitStatus, invocation: &Invocation) -> Result<(), CaptureError> {
    match status.code() {
        Some(code) if code > 0 => Err(CaptureError::ExternalProcessCrashed {
            code,
            invocation: invocation.clone(),
        }),
        _ => Ok(()),
    }
}

fn swallow_kill_error(err: io::Error) -> Result<(), CaptureError> {
    // InvalidInput is what tokio reports for a child that was already reaped.
    if err.raw_os_error() == Some(ESRCH) || err.kind() == io::ErrorKind::InvalidInput {
        return Ok(());
    }
    if cfg!(windows) {
        warn!(error = %err, "ignoring error while terminating tshark");
        return Ok(());
    }
    Err(CaptureError::Kill(err))
}

/// Attempts made while the binary is still being written (`ETXTBSY`).
const SPAWN_ATTEMPTS: u32 = 5;
const ETXTBSY: i32 = 26;
const SPAWN_BACKOFF_CAP: Duration = Duration::from_millis(50);

/// Spawns `command`, backing off on the async timer while the executable is busy.
pub(crate) async fn spawn_with_retry(
    command: &mut Command,
    binary: &Path,
) -> Result<Child, CaptureError> {
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) if attempt < SPAWN_ATTEMPTS && is_text_file_busy(&source) => {
                debug!(binary = ?binary, attempt, ?backoff, "tshark binary busy, retrying spawn");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(SPAWN_BACKOFF_CAP);
                attempt += 1;
            }
            Err(source) => {
                return Err(CaptureError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn is_text_file_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ExecutableFileBusy || err.raw_os_error() == Some(ETXTBSY)
}

pub(crate) struct CommandOutput {
    pub(crate) status: ExitStatus,
    pub(crate) stdout: Vec<u8>,
}

/// Runs a short-lived command to completion, killing it after `timeout`.
pub(crate) async fn run_command(
    binary: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, CaptureError> {
    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = spawn_with_retry(&mut command, binary).await?;
    let output = time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| CaptureError::VersionProbe {
            binary: binary.to_path_buf(),
            reason: format!("timed out after {timeout:?}"),
        })?
        .map_err(|err| CaptureError::VersionProbe {
            binary: binary.to_path_buf(),
            reason: err.to_string(),
        })?;

    Ok(CommandOutput {
        status: output.status,
        stdout: output.stdout,
    })
}
