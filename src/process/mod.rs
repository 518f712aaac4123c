//! Supervision of test-suite executables.
//!
//! [`supervisor::ProcessSupervisor`] keeps track of the processes started on behalf of remote
//! callers. The actual spawning is delegated to a [`Launcher`], [`child::ChildLauncher`] being
//! the one used by the controller binary.

use std::{fmt, time::Duration};

use uuid::Uuid;

pub mod child;
pub mod progress;
pub mod supervisor;

pub use progress::{Exit, Progress, Wait};
pub use supervisor::ProcessSupervisor;

/// Controller-assigned identifier of a started process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Build flavor of a test suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Suffix {
    Sync,
    Async,
    Collocated,
}

impl Suffix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Suffix::Sync => "sync",
            Suffix::Async => "async",
            Suffix::Collocated => "collocated",
        }
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a [`Launcher`] needs to start one executable.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub testsuite: String,
    pub suffix: Suffix,
    pub exe: String,
    pub args: Vec<String>,
}

impl LaunchRequest {
    /// Prefix used when logging on behalf of the process.
    pub fn logger_prefix(&self) -> String {
        format!("{}/{}", self.testsuite, self.exe)
    }
}

/// Process spawning abstraction.
pub trait Launcher {
    type Process: TestProcess;

    /// Starts the executable described by `request`.
    fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<Self::Process, Box<dyn std::error::Error>>;
}

/// A started executable.
pub trait TestProcess {
    /// Readiness, completion and output of the process.
    fn progress(&self) -> &Progress;

    /// Asks the process to stop. Must not block.
    fn stop(&self);
}

/// Converts a timeout received from a remote caller; negative values mean "do not wait".
pub fn timeout_from_millis(timeout: i32) -> Duration {
    Duration::from_millis(u64::try_from(timeout).unwrap_or(0))
}
