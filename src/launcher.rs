//! Launching the compiled test binary.
//!
//! A launch starts one child process and two or three background pumps:
//!
//! - **stdout**: lines forwarded to the [`OutputSink`]; for the device
//!   bridge, the raw byte stream is sniffed for the debugger marker and then
//!   handed to the MI session (see [`crate::mi`])
//! - **stderr**: lines forwarded to the [`OutputSink`]
//! - **stdin** (device bridge only): drains a queue of debugger commands so
//!   that control commands never wait on output processing
//!
//! Every pump observes a shared [`CancellationToken`] and is joined with a
//! bounded wait by [`Pumps::shutdown`].
//!
//! # Targets
//!
//! | Target | Program | Mode |
//! |--------|---------|------|
//! | [`LaunchTarget::Host`] | the executable itself | direct |
//! | [`LaunchTarget::Simulator`] | `xcrun simctl spawn <udid> <exe>` | direct |
//! | [`LaunchTarget::Device`] | bridge tool with `--debug --gdbargs "-i mi -q"` | debugger bridge |

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compiler::CompiledArtifact;
use crate::mi::{LineSplitter, MarkerSniffer, MiAction, MiSession, Sniff, parse_record};

/// Result type for launch operations.
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Errors that can occur while starting or attaching to the test binary.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The program to run does not exist.
    #[error("Binary not found: {0}")]
    MissingBinary(PathBuf),

    /// The OS refused to start the process.
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The debugger never confirmed that the target is running.
    #[error("Debugger did not attach within {0:?}")]
    AttachTimeout(Duration),

    /// The debugger reported an error before the target was running.
    #[error("Debugger failed to attach: {0}")]
    AttachFailed(String),

    /// The process exited before the host could talk to it.
    #[error("Test binary exited before connecting ({0})")]
    ExitedEarly(String),
}

/// A single line of output from the launched process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Receives every output line of the launched process.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use robovm_test::launcher::{OutputLine, OutputSink};
///
/// let sink: OutputSink = Arc::new(|line: &OutputLine| match line {
///     OutputLine::Stdout(s) => println!("{}", s),
///     OutputLine::Stderr(s) => eprintln!("{}", s),
/// });
/// ```
pub type OutputSink = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// A sink that discards everything.
pub fn null_sink() -> OutputSink {
    Arc::new(|_: &OutputLine| {})
}

/// The process to start.
///
/// # Example
///
/// ```
/// use robovm_test::launcher::LaunchSpec;
///
/// let spec = LaunchSpec::new("xcrun")
///     .args(["simctl", "spawn", "UDID", "/tmp/app/Tests"])
///     .working_dir("/tmp/app")
///     .env("SIMCTL_CHILD_DEBUG", "1");
/// assert_eq!(spec.to_shell_string(), "xcrun simctl spawn UDID /tmp/app/Tests");
/// ```
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-quoted rendering, for logs.
    pub fn to_shell_string(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

/// How the stdout of the process is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Plain line output.
    Direct,
    /// Bridge output followed by a debugger MI session.
    DebuggerBridge {
        /// Bytes of bridge output to scan for the debugger marker before giving up.
        sniff_budget: usize,
    },
}

/// Where the test binary runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    /// Run the executable directly on this machine.
    Host,
    /// Run inside a booted simulator.
    Simulator { udid: String },
    /// Install and debug on a connected device through a bridge tool.
    Device { bridge: PathBuf },
}

/// Default number of bytes scanned for the debugger marker.
pub const DEFAULT_SNIFF_BUDGET: usize = 1024 * 1024;

impl LaunchTarget {
    /// Builds the process to start for `artifact`, passing `args` to the binary.
    pub fn spec(&self, artifact: &CompiledArtifact, args: &[String]) -> LaunchSpec {
        match self {
            LaunchTarget::Host => LaunchSpec::new(artifact.executable.to_string_lossy())
                .args(args.iter().cloned())
                .working_dir(&artifact.app_dir),
            LaunchTarget::Simulator { udid } => LaunchSpec::new("xcrun")
                .args(["simctl", "spawn"])
                .arg(udid.clone())
                .arg(artifact.executable.to_string_lossy())
                .args(args.iter().cloned())
                .working_dir(&artifact.app_dir),
            LaunchTarget::Device { bridge } => {
                let mut spec = LaunchSpec::new(bridge.to_string_lossy())
                    .args(["--verbose", "--unbuffered", "--debug"])
                    .args(["--gdbargs", "-i mi -q"])
                    .arg("--nostart")
                    .arg("--bundle")
                    .arg(artifact.app_dir.to_string_lossy())
                    .working_dir(&artifact.app_dir);
                if !args.is_empty() {
                    spec = spec.arg("--args").arg(args.join(" "));
                }
                spec
            }
        }
    }

    pub fn mode(&self) -> LaunchMode {
        match self {
            LaunchTarget::Device { .. } => LaunchMode::DebuggerBridge {
                sniff_budget: DEFAULT_SNIFF_BUDGET,
            },
            _ => LaunchMode::Direct,
        }
    }
}

enum ChildState {
    Running(Child),
    Exited(Option<ExitStatus>),
}

struct HandleInner {
    pid: Option<u32>,
    label: String,
    state: Mutex<ChildState>,
}

/// Shared handle to the launched child process.
///
/// Clones refer to the same process. [`terminate`](Self::terminate) is
/// idempotent.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("label", &self.inner.label)
            .finish()
    }
}

impl ProcessHandle {
    pub fn new(child: Child, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid: child.id(),
                label: label.into(),
                state: Mutex::new(ChildState::Running(child)),
            }),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Returns `true` while the process has not exited.
    pub async fn is_running(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        let polled = match &mut *state {
            ChildState::Running(child) => child.try_wait(),
            ChildState::Exited(_) => return false,
        };
        match polled {
            Ok(None) => true,
            Ok(Some(status)) => {
                *state = ChildState::Exited(Some(status));
                false
            }
            Err(e) => {
                warn!("Failed to poll {}: {}", self.inner.label, e);
                *state = ChildState::Exited(None);
                false
            }
        }
    }

    /// The exit status, once known.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        match &*self.inner.state.lock().await {
            ChildState::Exited(status) => *status,
            ChildState::Running(_) => None,
        }
    }

    /// Waits up to `timeout` for the process to exit on its own.
    ///
    /// Returns `true` if the process is no longer running.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Kills the process if it is still running and reaps it.
    pub async fn terminate(&self) -> Option<ExitStatus> {
        let mut state = self.inner.state.lock().await;
        let status = match &mut *state {
            ChildState::Exited(status) => return *status,
            ChildState::Running(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status),
                _ => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill of {} failed: {}", self.inner.label, e);
                    }
                    child.wait().await.ok()
                }
            },
        };
        debug!("{} terminated with {:?}", self.inner.label, status);
        *state = ChildState::Exited(status);
        status
    }
}

/// Background readers and writers attached to one process.
#[derive(Debug)]
pub struct Pumps {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Pumps {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    fn spawn<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(fut));
    }

    /// Number of pumps not yet joined.
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancels every pump and joins them with one bounded wait.
    ///
    /// Pumps that do not finish within `grace` are aborted. Calling this more
    /// than once is a no-op.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.token.cancel();
        let handles = std::mem::take(&mut self.handles);
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Output pumps did not stop within {:?}, aborting", grace);
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Progress of the debugger attached through the device bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggerStatus {
    Starting,
    Attached,
    Failed(String),
    /// The debugger session ended; `attached` records whether the target ever ran.
    Exited { attached: bool },
}

/// Control handle for the debugger session of a device launch.
#[derive(Debug)]
pub struct DebuggerLink {
    exit_tx: mpsc::UnboundedSender<()>,
    status: watch::Receiver<DebuggerStatus>,
}

impl DebuggerLink {
    pub fn status(&self) -> DebuggerStatus {
        self.status.borrow().clone()
    }

    /// Waits until the target is running under the debugger.
    pub async fn wait_attached(&mut self, timeout: Duration) -> LaunchResult<()> {
        let wait = async {
            loop {
                match self.status.borrow_and_update().clone() {
                    DebuggerStatus::Attached => return Ok(()),
                    DebuggerStatus::Failed(msg) => return Err(LaunchError::AttachFailed(msg)),
                    DebuggerStatus::Exited { attached: true } => return Ok(()),
                    DebuggerStatus::Exited { attached: false } => {
                        return Err(LaunchError::AttachFailed(
                            "debugger exited before the target started".to_string(),
                        ));
                    }
                    DebuggerStatus::Starting => {}
                }
                if self.status.changed().await.is_err() {
                    return Err(LaunchError::AttachFailed(
                        "bridge output closed before the debugger started".to_string(),
                    ));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| LaunchError::AttachTimeout(timeout))?
    }

    /// Queues `-gdb-exit` without waiting for pending output.
    pub fn request_exit(&self) {
        let _ = self.exit_tx.send(());
    }
}

/// A started process with its pumps.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub handle: ProcessHandle,
    pub pumps: Pumps,
    pub debugger: Option<DebuggerLink>,
}

/// Starts test binaries.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts `spec` and wires its output into `sink`.
    async fn launch(&self, spec: &LaunchSpec, sink: OutputSink) -> LaunchResult<LaunchedProcess>;
}

/// Launches processes on the local machine.
pub struct ProcessLauncher {
    mode: LaunchMode,
}

impl ProcessLauncher {
    pub fn new(mode: LaunchMode) -> Self {
        Self { mode }
    }

    pub fn for_target(target: &LaunchTarget) -> Self {
        Self::new(target.mode())
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec, sink: OutputSink) -> LaunchResult<LaunchedProcess> {
        let program = Path::new(&spec.program);
        if program.components().count() > 1 && !program.exists() {
            return Err(LaunchError::MissingBinary(program.to_path_buf()));
        }

        debug!("Launching: {}", spec.to_shell_string());

        let mut command = tokio::process::Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(match self.mode {
            LaunchMode::Direct => Stdio::null(),
            LaunchMode::DebuggerBridge { .. } => Stdio::piped(),
        });
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed(format!("{}: {}", spec.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LaunchError::SpawnFailed("stderr not captured".to_string()))?;
        let stdin = child.stdin.take();

        let token = CancellationToken::new();
        let mut pumps = Pumps::new(token.clone());
        let handle = ProcessHandle::new(child, spec.program.clone());

        let debugger = match self.mode {
            LaunchMode::Direct => {
                pumps.spawn(pump_lines(stdout, OutputLine::Stdout, sink.clone(), false, token.clone()));
                pumps.spawn(pump_lines(stderr, OutputLine::Stderr, sink, false, token));
                None
            }
            LaunchMode::DebuggerBridge { sniff_budget } => {
                let stdin = stdin
                    .ok_or_else(|| LaunchError::SpawnFailed("stdin not captured".to_string()))?;
                let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
                let (exit_tx, exit_rx) = mpsc::unbounded_channel();
                let (status_tx, status_rx) = watch::channel(DebuggerStatus::Starting);

                pumps.spawn(pump_stdin(stdin, stdin_rx, token.clone()));
                pumps.spawn(pump_debugger(
                    stdout,
                    DebuggerWiring {
                        stdin_tx,
                        exit_rx,
                        status_tx,
                        sink: sink.clone(),
                        sniff_budget,
                    },
                    token.clone(),
                ));
                pumps.spawn(pump_lines(stderr, OutputLine::Stderr, sink, true, token));

                Some(DebuggerLink {
                    exit_tx,
                    status: status_rx,
                })
            }
        };

        Ok(LaunchedProcess {
            handle,
            pumps,
            debugger,
        })
    }
}

async fn pump_lines<R>(
    reader: R,
    wrap: fn(String) -> OutputLine,
    sink: OutputSink,
    log_warn: bool,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if log_warn {
                        warn!("bridge: {}", line);
                    }
                    sink(&wrap(line));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Output pump stopped: {}", e);
                    break;
                }
            },
        }
    }
}

async fn pump_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = rx.recv() => {
                let Some(line) = line else { break };
                debug!("debugger <- {}", line.trim_end());
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!("Failed to write debugger command: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!("Failed to flush debugger command: {}", e);
                    break;
                }
            }
        }
    }
}

struct DebuggerWiring {
    stdin_tx: mpsc::UnboundedSender<String>,
    exit_rx: mpsc::UnboundedReceiver<()>,
    status_tx: watch::Sender<DebuggerStatus>,
    sink: OutputSink,
    sniff_budget: usize,
}

async fn pump_debugger(mut stdout: ChildStdout, mut wiring: DebuggerWiring, token: CancellationToken) {
    let mut sniffer = MarkerSniffer::new(wiring.sniff_budget);
    let mut bridge_lines = LineSplitter::new();
    let mut mi_lines = LineSplitter::new();
    let mut session = MiSession::new();
    let mut target_output = String::new();
    let mut gave_up = false;
    let mut buf = vec![0u8; 4096];

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            Some(()) = wiring.exit_rx.recv() => {
                let cmd = session.exit_command();
                let _ = wiring.stdin_tx.send(cmd.to_line());
                continue;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Bridge stdout closed: {}", e);
                    break;
                }
            },
        };
        let chunk = &buf[..n];

        let mi_bytes = if sniffer.is_found() {
            chunk
        } else {
            match sniffer.feed(chunk) {
                Sniff::Found(at) => {
                    forward_bridge(&mut bridge_lines, &chunk[..at], &wiring.sink);
                    debug!("Debugger backend started");
                    &chunk[at..]
                }
                Sniff::Searching => {
                    forward_bridge(&mut bridge_lines, chunk, &wiring.sink);
                    continue;
                }
                Sniff::Exhausted => {
                    forward_bridge(&mut bridge_lines, chunk, &wiring.sink);
                    if !gave_up {
                        gave_up = true;
                        wiring.status_tx.send_replace(DebuggerStatus::Failed(
                            "debugger start marker not found in bridge output".to_string(),
                        ));
                    }
                    continue;
                }
            }
        };

        for line in mi_lines.push(mi_bytes) {
            apply_record(&mut session, &line, &mut target_output, &wiring);
        }
    }

    if let Some(line) = mi_lines.finish() {
        apply_record(&mut session, &line, &mut target_output, &wiring);
    }
    if !target_output.is_empty() {
        (wiring.sink)(&OutputLine::Stdout(std::mem::take(&mut target_output)));
    }
    wiring.status_tx.send_if_modified(mark_exited);
}

fn forward_bridge(lines: &mut LineSplitter, bytes: &[u8], sink: &OutputSink) {
    for line in lines.push(bytes) {
        debug!("bridge: {}", line);
        sink(&OutputLine::Stdout(line));
    }
}

fn apply_record(
    session: &mut MiSession,
    line: &str,
    target_output: &mut String,
    wiring: &DebuggerWiring,
) {
    for action in session.on_record(&parse_record(line)) {
        match action {
            MiAction::Send(cmd) => {
                let _ = wiring.stdin_tx.send(cmd.to_line());
            }
            MiAction::TargetOutput(text) => {
                target_output.push_str(&text);
                while let Some(pos) = target_output.find('\n') {
                    let rest = target_output.split_off(pos + 1);
                    let mut line = std::mem::replace(target_output, rest);
                    line.pop();
                    (wiring.sink)(&OutputLine::Stdout(line));
                }
            }
            MiAction::Attached => {
                wiring.status_tx.send_replace(DebuggerStatus::Attached);
            }
            MiAction::Error(msg) => {
                warn!("Debugger error: {}", msg);
                if !session.is_attached() {
                    wiring.status_tx.send_replace(DebuggerStatus::Failed(msg));
                }
            }
            MiAction::Exited => {
                wiring.status_tx.send_if_modified(mark_exited);
            }
        }
    }
}

fn mark_exited(status: &mut DebuggerStatus) -> bool {
    let attached = match status {
        DebuggerStatus::Starting => false,
        DebuggerStatus::Attached => true,
        DebuggerStatus::Failed(_) | DebuggerStatus::Exited { .. } => return false,
    };
    *status = DebuggerStatus::Exited { attached };
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collecting_sink() -> (OutputSink, Arc<StdMutex<Vec<OutputLine>>>) {
        let lines = Arc::new(StdMutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: OutputSink = Arc::new(move |line: &OutputLine| captured.lock().unwrap().push(line.clone()));
        (sink, lines)
    }

    fn artifact() -> CompiledArtifact {
        CompiledArtifact {
            executable: PathBuf::from("/build/Tests.app/Tests"),
            app_dir: PathBuf::from("/build/Tests.app"),
        }
    }

    #[test]
    fn test_simulator_spec() {
        let target = LaunchTarget::Simulator {
            udid: "ABC".to_string(),
        };
        let spec = target.spec(&artifact(), &["-rvm:Dfoo=bar".to_string()]);
        assert_eq!(spec.program, "xcrun");
        assert_eq!(
            spec.args,
            vec!["simctl", "spawn", "ABC", "/build/Tests.app/Tests", "-rvm:Dfoo=bar"]
        );
        assert_eq!(target.mode(), LaunchMode::Direct);
    }

    #[test]
    fn test_device_spec() {
        let target = LaunchTarget::Device {
            bridge: PathBuf::from("/home/bin/ios-deploy"),
        };
        let spec = target.spec(&artifact(), &["-a".to_string(), "-b".to_string()]);
        assert_eq!(spec.program, "/home/bin/ios-deploy");
        assert!(spec.args.contains(&"--unbuffered".to_string()));
        assert!(spec.args.contains(&"-i mi -q".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("-a -b"));
        assert!(matches!(target.mode(), LaunchMode::DebuggerBridge { .. }));
    }

    #[test]
    fn test_shell_string_quotes() {
        let spec = LaunchSpec::new("echo").arg("hello world").arg("");
        assert_eq!(spec.to_shell_string(), "echo 'hello world' ''");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let launcher = ProcessLauncher::new(LaunchMode::Direct);
        let err = launcher
            .launch(&LaunchSpec::new("/definitely/not/here"), null_sink())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::MissingBinary(_)));
    }

    #[tokio::test]
    async fn test_direct_launch_pumps_output() {
        let (sink, lines) = collecting_sink();
        let launcher = ProcessLauncher::new(LaunchMode::Direct);
        let spec = LaunchSpec::new("sh").arg("-c").arg("echo out; echo err 1>&2");

        let mut launched = launcher.launch(&spec, sink).await.unwrap();
        assert!(launched.handle.wait_for_exit(Duration::from_secs(5)).await);
        // Give the pumps a moment to drain before joining them.
        tokio::time::sleep(Duration::from_millis(100)).await;
        launched.pumps.shutdown(Duration::from_secs(1)).await;

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&OutputLine::Stdout("out".to_string())));
        assert!(lines.contains(&OutputLine::Stderr("err".to_string())));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let launcher = ProcessLauncher::new(LaunchMode::Direct);
        let mut launched = launcher
            .launch(&LaunchSpec::new("sleep").arg("30"), null_sink())
            .await
            .unwrap();
        assert!(launched.handle.is_running().await);

        launched.handle.terminate().await;
        launched.handle.terminate().await;
        assert!(!launched.handle.is_running().await);

        launched.pumps.shutdown(Duration::from_secs(1)).await;
        launched.pumps.shutdown(Duration::from_secs(1)).await;
        assert_eq!(launched.pumps.active(), 0);
    }

    #[tokio::test]
    async fn test_debugger_bridge_attaches() {
        // Fake bridge: progress output, the marker, then a scripted MI session
        // that answers each command read from stdin.
        let script = r#"
printf '%s\n' '[ 50%] Installing app'
printf '%s\n' '-------------------------'
printf '%s\n' '(gdb)'
read cmd; printf '%s\n' '1^done'
read cmd; printf '%s\n' '2^running'
printf '%s\n' '@"hello from device\n"'
printf '%s\n' '*stopped,reason="exited-normally"'
read cmd; printf '%s\n' '3^exit'
"#;
        let (sink, lines) = collecting_sink();
        let launcher = ProcessLauncher::new(LaunchMode::DebuggerBridge { sniff_budget: 4096 });
        let spec = LaunchSpec::new("sh").arg("-c").arg(script);

        let mut launched = launcher.launch(&spec, sink).await.unwrap();
        let mut debugger = launched.debugger.take().unwrap();
        debugger.wait_attached(Duration::from_secs(5)).await.unwrap();

        assert!(launched.handle.wait_for_exit(Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        launched.pumps.shutdown(Duration::from_secs(1)).await;

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&OutputLine::Stdout("[ 50%] Installing app".to_string())));
        assert!(lines.contains(&OutputLine::Stdout("hello from device".to_string())));
        assert_eq!(debugger.status(), DebuggerStatus::Exited { attached: true });
    }
}
