//! Terminal errors of a test run.
//!
//! Component errors ([`SelectionError`], [`CompileError`], [`LaunchError`],
//! [`TransportError`]) are folded into [`HarnessError`] by the coordinator.
//! A failed run never loses the counts it observed: it is reported as a
//! [`RunFailure`] carrying both the error and the partial [`RunResult`].

use std::time::Duration;

use crate::compiler::CompileError;
use crate::device::SelectionError;
use crate::launcher::LaunchError;
use crate::relay::RunResult;
use crate::transport::TransportError;

/// Result type for a whole test run.
pub type HarnessResult<T> = Result<T, RunFailure>;

/// The single terminal error of a failed run.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The device enumeration returned nothing.
    #[error("No devices available")]
    NoDevicesEnumerated,

    /// Devices exist but none matches the requested family, name and version.
    #[error("{0}")]
    NoMatchFound(String),

    /// The external compiler failed.
    #[error("Compilation failed: {0}")]
    Compile(#[from] CompileError),

    /// The test binary could not be started or attached.
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// The channel to the test binary failed.
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// No event arrived within the quiet period.
    #[error("No test progress within {0:?}")]
    Timeout(Duration),

    /// Run bookkeeping does not add up.
    #[error("Test mechanism failure: {0}")]
    TestMechanismFailure(String),

    /// The run configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<SelectionError> for HarnessError {
    fn from(err: SelectionError) -> Self {
        match err {
            SelectionError::NoDevicesEnumerated => HarnessError::NoDevicesEnumerated,
            SelectionError::Enumeration(msg) => {
                tracing::warn!("Device enumeration failed: {}", msg);
                HarnessError::NoDevicesEnumerated
            }
            no_match @ SelectionError::NoMatchFound { .. } => {
                HarnessError::NoMatchFound(no_match.to_string())
            }
        }
    }
}

/// A failed run: the terminal error plus everything counted before it.
#[derive(Debug, thiserror::Error)]
#[error("{error} ({} tests, {} failures before abort)", partial.total, partial.failures)]
pub struct RunFailure {
    pub error: HarnessError,
    pub partial: RunResult,
}

impl RunFailure {
    pub fn new(error: impl Into<HarnessError>, partial: RunResult) -> Self {
        Self {
            error: error.into(),
            partial,
        }
    }
}
