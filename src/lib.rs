//! robovm-test: run JUnit tests inside RoboVM-compiled binaries.
//!
//! The host compiles a test binary, launches it on a simulator, a connected
//! device or the host itself, and drives it over a line-oriented socket. The
//! binary runs one test class per request and streams lifecycle events back,
//! which are relayed to listeners in arrival order.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌─────────────┐
//!  │ compiler  │──▶│ device   │──▶│ launcher │──▶│ transport   │
//!  │ (robovm)  │   │ (simctl) │   │ (+ mi)   │   │ (TCP lines) │
//!  └───────────┘   └──────────┘   └──────────┘   └──────┬──────┘
//!                                                       │ events
//!            ┌──────────────────────────────┐    ┌──────▼──────┐
//!            │ report (console, JUnit XML)  │◀───│ relay       │
//!            └──────────────────────────────┘    └─────────────┘
//! ```
//!
//! The [`coordinator`] owns the sequence and guarantees the process and the
//! channel are closed on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use robovm_test::compiler::CommandCompiler;
//! use robovm_test::config::load_config;
//! use robovm_test::coordinator::Coordinator;
//! use robovm_test::device::SimctlEnumerator;
//! use robovm_test::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("robovm-test.toml"))?;
//!     let plan = config.run_plan(Path::new("."))?;
//!     let coordinator = Coordinator::new(
//!         Arc::new(CommandCompiler::new(config.compile.command.clone())),
//!         Arc::new(SimctlEnumerator::new()),
//!         Arc::new(ConsoleReporter::new(false)),
//!         config.run_settings(),
//!         tracing::info_span!("run"),
//!     );
//!     let result = coordinator.run(&plan).await?;
//!     println!("{} of {} passed", result.passed(), result.total);
//!     Ok(())
//! }
//! ```

pub mod compiler;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod launcher;
pub mod mi;
pub mod protocol;
pub mod relay;
pub mod report;
pub mod transport;
pub mod units;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use coordinator::{Coordinator, RunPlan, RunSettings, TargetSpec};
pub use error::{HarnessError, HarnessResult, RunFailure};
pub use protocol::{Description, FailureInfo, LifecycleEvent, RemoteCommand};
pub use relay::{RunListener, RunResult};
