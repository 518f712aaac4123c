//! Process table of the controller.
//!
//! The supervisor owns every process started through it until it is terminated. The table and the
//! suffix memo are guarded by a single mutex which is never held across an `await`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{info, warn};

use super::{Exit, LaunchRequest, Launcher, ProcessId, Suffix, TestProcess, Wait};
use crate::error::ControllerError;

/// Lifecycle of a supervised process, as seen by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Completed(Exit),
}

struct ProcessRecord<P> {
    request: LaunchRequest,
    process: P,
    // waitSuccess polling is not shared between callers
    success: futures::lock::Mutex<()>,
}

impl<P: TestProcess> ProcessRecord<P> {
    fn state(&self) -> ProcessState {
        let progress = self.process.progress();
        match progress.exit() {
            Some(exit) => ProcessState::Completed(exit),
            None if progress.is_ready() => ProcessState::Ready,
            None => ProcessState::Starting,
        }
    }
}

struct Table<P> {
    records: HashMap<ProcessId, Arc<ProcessRecord<P>>>,
    // Single slot, last write wins. Two test suites started concurrently share it.
    suffix: Option<Suffix>,
}

/// Starts, tracks and terminates test processes on behalf of remote callers.
pub struct ProcessSupervisor<L: Launcher> {
    launcher: L,
    table: Mutex<Table<L::Process>>,
}

impl<L: Launcher> ProcessSupervisor<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            launcher,
            table: Mutex::new(Table {
                records: HashMap::new(),
                suffix: None,
            }),
        }
    }

    /// Starts the `exe` executable of `testsuite`.
    ///
    /// The build flavor is derived from `exe`: server kinds pick their own and remember it, a
    /// client picks the one remembered from the last server (once), `sync` otherwise.
    pub fn start(
        &self,
        testsuite: &str,
        exe: &str,
        args: Vec<String>,
    ) -> Result<ProcessId, ControllerError> {
        info!("starting {testsuite} {exe}...");

        let start_failure = |cause: String| {
            warn!("starting {testsuite} {exe} failed: {cause}");
            ControllerError::ProcessStartFailure {
                testsuite: testsuite.to_owned(),
                exe: exe.to_owned(),
                cause,
            }
        };

        let mut table = self.table.lock().unwrap();

        let (suffix, remember) = select_suffix(exe, &mut table.suffix)
            .ok_or_else(|| start_failure(format!("no entry point for `{exe}'")))?;

        let request = LaunchRequest {
            testsuite: testsuite.to_owned(),
            suffix,
            exe: exe.to_owned(),
            args,
        };
        let process = self
            .launcher
            .launch(&request)
            .map_err(|err| start_failure(err.to_string()))?;

        if remember.is_some() {
            table.suffix = remember;
        }

        let mut id = ProcessId::generate();
        while table.records.contains_key(&id) {
            id = ProcessId::generate();
        }
        info!("started {} ({suffix}) as {id}", request.logger_prefix());
        table.records.insert(
            id,
            Arc::new(ProcessRecord {
                request,
                process,
                success: futures::lock::Mutex::new(()),
            }),
        );

        Ok(id)
    }

    /// Waits at most `timeout` for the process to become ready.
    pub async fn wait_ready(
        &self,
        id: ProcessId,
        timeout: Duration,
    ) -> Result<(), ControllerError> {
        let record = self.record(id)?;
        let progress = record.process.progress();
        match progress.wait_ready(timeout).await {
            Wait::Done(()) => Ok(()),
            Wait::Failed => Err(ControllerError::ProcessFailed {
                output: progress.output(),
            }),
            Wait::TimedOut => Err(ControllerError::ProcessTimeout { timeout }),
        }
    }

    /// Waits at most `timeout` for the process to complete and returns its exit status.
    ///
    /// Concurrent calls for the same process are served one after the other. The time spent
    /// waiting for a previous caller counts against `timeout`.
    pub async fn wait_success(
        &self,
        id: ProcessId,
        timeout: Duration,
    ) -> Result<i32, ControllerError> {
        let record = self.record(id)?;
        let started = std::time::Instant::now();

        let _guard = crate::internal::timeout(timeout, record.success.lock())
            .await
            .ok_or(ControllerError::ProcessTimeout { timeout })?;

        let progress = record.process.progress();
        match progress.wait_exit(timeout.saturating_sub(started.elapsed())).await {
            Wait::Done(status) => Ok(status),
            Wait::Failed => Err(ControllerError::ProcessFailed {
                output: progress.output(),
            }),
            Wait::TimedOut => Err(ControllerError::ProcessTimeout { timeout }),
        }
    }

    /// Stops the process and returns everything it printed.
    ///
    /// The handle is invalid afterwards: any later call with `id` fails with
    /// [`ControllerError::InvalidHandle`]. Callers must not terminate a process while waiting on
    /// it.
    pub fn terminate(&self, id: ProcessId) -> Result<String, ControllerError> {
        let record = self
            .table
            .lock()
            .unwrap()
            .records
            .remove(&id)
            .ok_or(ControllerError::InvalidHandle(id))?;

        record.process.stop();
        info!("terminated {} ({id})", record.request.logger_prefix());

        Ok(record.process.progress().output())
    }

    /// Current lifecycle state of the process.
    pub fn state(&self, id: ProcessId) -> Result<ProcessState, ControllerError> {
        Ok(self.record(id)?.state())
    }

    /// Number of processes not terminated yet.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The suffix a client started now would use, if a server left one.
    pub fn remembered_suffix(&self) -> Option<Suffix> {
        self.table.lock().unwrap().suffix
    }

    fn record(&self, id: ProcessId) -> Result<Arc<ProcessRecord<L::Process>>, ControllerError> {
        self.table
            .lock()
            .unwrap()
            .records
            .get(&id)
            .cloned()
            .ok_or(ControllerError::InvalidHandle(id))
    }
}

/// Returns the suffix to start `exe` with, and the suffix to remember once it started.
///
/// A client consumes `memo`, whether it starts or not. `None` when `exe` is not a known
/// executable kind.
fn select_suffix(exe: &str, memo: &mut Option<Suffix>) -> Option<(Suffix, Option<Suffix>)> {
    let suffix = match exe {
        "server" => Suffix::Sync,
        "serveramd" => Suffix::Async,
        "collocated" => Suffix::Collocated,
        "client" => return Some((memo.take().unwrap_or(Suffix::Sync), None)),
        _ => return None,
    };
    Some((suffix, Some(suffix)))
}
