//! Orchestration of one remote test run.
//!
//! The [`Coordinator`] owns the whole sequence and is the only component
//! that closes the process and the channel.
//!
//! # Architecture
//!
//! ```text
//!   Idle ──► Compiling ──► Launching ──► Attached ──► Running ──► Finalizing ──► Done
//!     │          │             │             │            │
//!     └──────────┴─────────────┴─────────────┴────────────┴──► Cleanup ──► Failed
//!
//!   Compiling   Compiler::compile(config)          ─► CompiledArtifact
//!   Launching   select device, bind listener,
//!               Launcher::launch(spec)             ─► LaunchHandle
//!   Attached    debugger attached (device) and
//!               test binary connected              ─► EventChannel
//!   Running     per unit: send `run`, relay events until `RunFinished`
//!   Finalizing  close LaunchHandle, check tally    ─► RunResult
//! ```
//!
//! Units run strictly one after another; the remote runner only supports a
//! single active run. While a unit runs, every event must arrive within the
//! quiet period or the run is aborted with a timeout and the process is
//! killed.
//!
//! Cleanup is a single path taken on every outcome. It is idempotent, so a
//! second call (for example after a timeout raced with normal completion)
//! does nothing.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, Span, debug, info, warn};

use crate::compiler::{CompileConfig, Compiler};
use crate::device::{DeviceEnumerator, SelectionCriteria, select_best_device};
use crate::error::{HarnessError, HarnessResult, RunFailure};
use crate::launcher::{
    LaunchError, LaunchTarget, LaunchedProcess, Launcher, OutputSink, ProcessHandle,
    ProcessLauncher, null_sink,
};
use crate::protocol::{LifecycleEvent, RemoteCommand};
use crate::relay::{ResultRelay, RunListener, RunResult};
use crate::transport::{EventChannel, EventListener, TransportError};
use crate::units::TestUnit;

/// Launch argument carrying the address the test binary connects to.
pub const SERVER_ARG: &str = "-rvm:Drobovm.test.server=";

/// Launch argument enabling debug logging inside the test binary.
pub const SERVER_DEBUG_ARG: &str = "-rvm:Drobovm.debug=true";

/// Where the compiled binary should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Host,
    /// A simulator chosen from the enumerated devices.
    Simulator(SelectionCriteria),
    /// A connected device reached through the bridge tool.
    Device { bridge: PathBuf },
}

/// Timing and networking policy for a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Longest allowed gap between two events while a unit runs.
    pub quiet_timeout: Duration,
    /// Time allowed for attaching and connecting after launch.
    pub connect_timeout: Duration,
    pub listen_addr: String,
    /// Host the test binary should connect to; defaults to the listen address.
    pub advertise_host: Option<String>,
    pub server_debugging: bool,
    /// Extra arguments for the test binary.
    pub launch_args: Vec<String>,
    /// Bounded wait for the process and pumps during cleanup.
    pub shutdown_grace: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            quiet_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(300),
            listen_addr: "127.0.0.1:0".to_string(),
            advertise_host: None,
            server_debugging: false,
            launch_args: Vec::new(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Everything one invocation needs.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub target: TargetSpec,
    pub compile: CompileConfig,
    pub units: Vec<TestUnit>,
}

/// Where the coordinator is in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Compiling,
    Launching,
    Attached,
    Running,
    Finalizing,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Compiling => "compiling",
            Phase::Launching => "launching",
            Phase::Attached => "attached",
            Phase::Running => "running",
            Phase::Finalizing => "finalizing",
            Phase::Cleanup => "cleanup",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The launched process together with its channel.
///
/// Owned exclusively by the coordinator for one run.
pub struct LaunchHandle {
    process: LaunchedProcess,
    channel: Option<EventChannel>,
    closed: bool,
}

impl LaunchHandle {
    pub fn new(process: LaunchedProcess) -> Self {
        Self {
            process,
            channel: None,
            closed: false,
        }
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process.handle
    }

    pub fn attach(&mut self, channel: EventChannel) {
        self.channel = Some(channel);
    }

    pub fn channel_mut(&mut self) -> Option<&mut EventChannel> {
        self.channel.as_mut()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shuts everything down. Later calls return immediately.
    ///
    /// Asks the remote runner to terminate, closes the channel, waits up to
    /// `grace` for the process before killing it and finally joins the output
    /// pumps. With `force`, the process is killed right away.
    pub async fn close(&mut self, grace: Duration, force: bool) {
        if self.closed {
            return;
        }
        self.closed = true;

        if force {
            self.process.handle.terminate().await;
        }

        if let Some(channel) = self.channel.as_mut() {
            if !force {
                if let Err(e) = channel.send(RemoteCommand::Terminate) {
                    debug!("Terminate not sent: {}", e);
                }
            }
            channel.close().await;
        }
        if let Some(debugger) = &self.process.debugger {
            debugger.request_exit();
        }

        if !self.process.handle.wait_for_exit(grace).await {
            debug!("{} still running, killing it", self.process.handle.label());
            self.process.handle.terminate().await;
        }
        self.process.pumps.shutdown(grace).await;
    }
}

/// Drives a run from compile to final result.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use robovm_test::compiler::{CommandCompiler, CompileConfig};
/// use robovm_test::coordinator::{Coordinator, RunPlan, RunSettings, TargetSpec};
/// use robovm_test::device::{DeviceFamily, SelectionCriteria, SimctlEnumerator};
/// use robovm_test::relay::NullListener;
/// use robovm_test::units::TestUnit;
///
/// #[tokio::main]
/// async fn main() {
///     let coordinator = Coordinator::new(
///         Arc::new(CommandCompiler::new("robovm")),
///         Arc::new(SimctlEnumerator::new()),
///         Arc::new(NullListener),
///         RunSettings::default(),
///         tracing::info_span!("robovm-test"),
///     );
///     let plan = RunPlan {
///         target: TargetSpec::Simulator(SelectionCriteria::new(DeviceFamily::IPhone)),
///         compile: CompileConfig::default(),
///         units: vec![TestUnit::class("com.example.FooTest")],
///     };
///     match coordinator.run(&plan).await {
///         Ok(result) => println!("{} tests, {} failures", result.total, result.failures),
///         Err(failure) => eprintln!("{}", failure),
///     }
/// }
/// ```
pub struct Coordinator {
    compiler: Arc<dyn Compiler>,
    enumerator: Arc<dyn DeviceEnumerator>,
    listener: Arc<dyn RunListener>,
    launcher: Option<Arc<dyn Launcher>>,
    sink: OutputSink,
    settings: RunSettings,
    span: Span,
}

struct RunState {
    phase: Phase,
    launch: Option<LaunchHandle>,
}

fn enter(current: &mut Phase, next: Phase) {
    debug!(from = %current, to = %next, "Phase change");
    *current = next;
}

impl Coordinator {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        enumerator: Arc<dyn DeviceEnumerator>,
        listener: Arc<dyn RunListener>,
        settings: RunSettings,
        span: Span,
    ) -> Self {
        Self {
            compiler,
            enumerator,
            listener,
            launcher: None,
            sink: null_sink(),
            settings,
            span,
        }
    }

    /// Uses `launcher` instead of a local process launcher for the target.
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Receives the stdout and stderr of the test binary.
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    /// Runs every unit of `plan` and returns the aggregate result.
    ///
    /// On failure the error carries whatever was counted before the abort.
    /// The process and channel are always closed before this returns.
    pub async fn run(&self, plan: &RunPlan) -> HarnessResult<RunResult> {
        let relay = ResultRelay::new(self.listener.clone());
        let mut state = RunState {
            phase: Phase::Idle,
            launch: None,
        };

        let outcome = self
            .drive(plan, &relay, &mut state)
            .instrument(self.span.clone())
            .await;

        let result = match outcome {
            Ok(()) => {
                enter(&mut state.phase, Phase::Finalizing);
                self.cleanup(&mut state, false).await;
                relay
                    .finish()
                    .map_err(|msg| RunFailure::new(HarnessError::TestMechanismFailure(msg), relay.snapshot()))
            }
            Err(error) => {
                self.span
                    .in_scope(|| warn!(phase = %state.phase, "Run aborted: {}", error));
                let force = matches!(error, HarnessError::Timeout(_));
                enter(&mut state.phase, Phase::Cleanup);
                self.cleanup(&mut state, force).await;
                Err(RunFailure::new(error, relay.snapshot()))
            }
        };

        match &result {
            Ok(run) => {
                enter(&mut state.phase, Phase::Done);
                relay.complete(run).await;
            }
            Err(failure) => {
                enter(&mut state.phase, Phase::Failed);
                relay.complete(&failure.partial).await;
            }
        }
        result
    }

    async fn cleanup(&self, state: &mut RunState, force: bool) {
        if let Some(launch) = state.launch.as_mut() {
            launch
                .close(self.settings.shutdown_grace, force)
                .instrument(self.span.clone())
                .await;
        }
    }

    async fn drive(
        &self,
        plan: &RunPlan,
        relay: &ResultRelay,
        state: &mut RunState,
    ) -> Result<(), HarnessError> {
        if plan.units.is_empty() {
            return Err(HarnessError::Config("no test classes to run".to_string()));
        }

        enter(&mut state.phase, Phase::Compiling);
        let compile = plan
            .compile
            .clone()
            .with_test_classes(plan.units.iter().map(|u| u.class_name.clone()));
        let artifact = self.compiler.compile(&compile).await?;
        info!("Compiled {}", artifact.executable.display());

        enter(&mut state.phase, Phase::Launching);
        let target = self.resolve_target(&plan.target).await?;
        let listener = EventListener::bind(&self.settings.listen_addr).await?;
        let local = listener.local_addr()?;
        let host = self
            .settings
            .advertise_host
            .clone()
            .unwrap_or_else(|| local.ip().to_string());
        let args = self.launch_args(&format!("{}:{}", host, local.port()));
        let spec = target.spec(&artifact, &args);

        let launcher = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => Arc::new(ProcessLauncher::for_target(&target)),
        };
        let process = launcher.launch(&spec, self.sink.clone()).await?;
        info!("Launched {}", spec.program);
        let launch = state.launch.insert(LaunchHandle::new(process));

        let connect_timeout = self.settings.connect_timeout;
        if let Some(debugger) = launch.process.debugger.as_mut() {
            debugger.wait_attached(connect_timeout).await?;
            debug!("Debugger attached");
        }
        let channel = tokio::select! {
            accepted = listener.accept(connect_timeout) => accepted?,
            status = exited(launch.process()) => {
                return Err(LaunchError::ExitedEarly(status).into());
            }
        };
        launch.attach(channel);
        enter(&mut state.phase, Phase::Attached);

        enter(&mut state.phase, Phase::Running);
        for unit in &plan.units {
            let Some(channel) = launch.channel_mut() else {
                return Err(TransportError::Closed.into());
            };
            info!("Running {}", unit);
            channel.send(RemoteCommand::Run {
                tests: unit.to_patterns(),
            })?;
            self.await_unit(channel, relay).await?;
        }
        Ok(())
    }

    async fn resolve_target(&self, spec: &TargetSpec) -> Result<LaunchTarget, HarnessError> {
        match spec {
            TargetSpec::Host => Ok(LaunchTarget::Host),
            TargetSpec::Simulator(criteria) => {
                let devices = self.enumerator.list_devices().await?;
                let device = select_best_device(&devices, criteria)?;
                info!("Selected simulator {}", device);
                Ok(LaunchTarget::Simulator { udid: device.id })
            }
            TargetSpec::Device { bridge } => Ok(LaunchTarget::Device {
                bridge: bridge.clone(),
            }),
        }
    }

    fn launch_args(&self, server: &str) -> Vec<String> {
        let mut args = vec![format!("{}{}", SERVER_ARG, server)];
        if self.settings.server_debugging {
            args.push(SERVER_DEBUG_ARG.to_string());
        }
        args.extend(self.settings.launch_args.iter().cloned());
        args
    }

    /// Relays events until the unit's `RunFinished`.
    async fn await_unit(
        &self,
        channel: &mut EventChannel,
        relay: &ResultRelay,
    ) -> Result<(), HarnessError> {
        let quiet = self.settings.quiet_timeout;
        loop {
            let next = tokio::time::timeout(quiet, channel.next_event())
                .await
                .map_err(|_| HarnessError::Timeout(quiet))?;
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::ConnectionClosed.into()),
            };
            let done = matches!(event, LifecycleEvent::RunFinished(_));
            relay.on_event(&event).await;
            if done {
                return Ok(());
            }
        }
    }
}

/// Resolves once the process has exited, with a description of its status.
async fn exited(process: &ProcessHandle) -> String {
    while process.is_running().await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    match process.exit_status().await {
        Some(status) => status.to_string(),
        None => "unknown status".to_string(),
    }
}
