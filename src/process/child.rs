//! Test executables run as child processes.
//!
//! Each test suite build flavor lives in its own directory under the tests directory:
//!
//! ```text
//! <tests-dir>/<testsuite with '/' replaced by '_'>_<suffix>/<exe>
//! ```
//!
//! The standard output and error of the child are captured line by line. A line on the standard
//! output equal to the ready marker tells the controller the process is ready. Every child is
//! watched by its own thread which records its output and completion into a [`Progress`].

use std::{
    io,
    path::PathBuf,
    pin::pin,
    process::{ExitStatus, Stdio},
    sync::Mutex,
    time::Duration,
};

use async_io::Timer;
use async_process::{Child, Command};
use futures::{
    channel::oneshot,
    future::{Fuse, FusedFuture},
    io::BufReader,
    stream, AsyncBufReadExt, FutureExt, StreamExt,
};
use tracing::{debug, warn};

use super::{Exit, LaunchRequest, Launcher, Progress, TestProcess};

/// Default line announcing that a server is ready.
pub const DEFAULT_READY_MARKER: &str = "ready";

/// Launches test executables from a tests directory.
#[derive(Clone, Debug)]
pub struct ChildLauncher {
    tests_dir: PathBuf,
    ready_marker: String,
    stop_grace: Duration,
}

impl ChildLauncher {
    /// Creates a launcher for the executables under `tests_dir`.
    ///
    /// `stop_grace` is how long a stopped process is given to exit before being killed.
    pub fn new(
        tests_dir: impl Into<PathBuf>,
        ready_marker: impl Into<String>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            tests_dir: tests_dir.into(),
            ready_marker: ready_marker.into(),
            stop_grace,
        }
    }

    /// Location of the executable for `request`.
    pub fn executable_path(&self, request: &LaunchRequest) -> PathBuf {
        let prefix = request.testsuite.replace('/', "_");
        self.tests_dir
            .join(format!("{prefix}_{}", request.suffix))
            .join(&request.exe)
    }
}

impl Launcher for ChildLauncher {
    type Process = ChildProcess;

    fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<Self::Process, Box<dyn std::error::Error>> {
        let path = self.executable_path(request);

        let mut child = Command::new(&path)
            .args(&request.args)
            .current_dir(&self.tests_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| format!("couldn't start `{}': {err}", path.display()))?;

        let lines = output_lines(&mut child);
        let progress = Progress::new();
        let (stop_sender, stop_receiver) = oneshot::channel();

        let watcher = Watcher {
            prefix: request.logger_prefix(),
            ready_marker: self.ready_marker.clone(),
            stop_grace: self.stop_grace,
            progress: progress.clone(),
        };
        std::thread::Builder::new()
            .name(format!("watch {}", watcher.prefix))
            .spawn(move || async_io::block_on(watcher.run(child, lines, stop_receiver)))?;

        Ok(ChildProcess {
            progress,
            stop: Mutex::new(Some(stop_sender)),
        })
    }
}

/// A running (or completed) child process.
///
/// Dropping it stops the process.
pub struct ChildProcess {
    progress: Progress,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl TestProcess for ChildProcess {
    fn progress(&self) -> &Progress {
        &self.progress
    }

    fn stop(&self) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            // The watcher is gone once the process completed
            let _ = stop.send(());
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Source {
    Stdout,
    Stderr,
}

type Lines = stream::BoxStream<'static, (Source, io::Result<String>)>;

fn output_lines(child: &mut Child) -> Lines {
    let stdout = child.stdout.take().map(|out| {
        BufReader::new(out)
            .lines()
            .map(|line| (Source::Stdout, line))
            .boxed()
    });
    let stderr = child.stderr.take().map(|err| {
        BufReader::new(err)
            .lines()
            .map(|line| (Source::Stderr, line))
            .boxed()
    });
    stream::select(
        stdout.unwrap_or_else(|| stream::empty().boxed()),
        stderr.unwrap_or_else(|| stream::empty().boxed()),
    )
    .boxed()
}

struct Watcher {
    prefix: String,
    ready_marker: String,
    stop_grace: Duration,
    progress: Progress,
}

impl Watcher {
    async fn run(self, mut child: Child, lines: Lines, stop: oneshot::Receiver<()>) {
        let pid = child.id();
        let mut reading = pin!(self.forward(lines).fuse());
        let mut stop = stop.fuse();
        let mut kill_deadline = Fuse::<Timer>::terminated();
        let mut drain_deadline = Fuse::<Timer>::terminated();
        let mut status = None;
        let mut force_kill = false;

        {
            let mut exited = pin!(child.status().fuse());
            while !(reading.is_terminated() && status.is_some()) {
                futures::select! {
                    () = reading => {}
                    res = exited => {
                        status = Some(res);
                        // Output may still be held open by grand-children
                        drain_deadline = FutureExt::fuse(Timer::after(self.stop_grace));
                    }
                    _ = stop => {
                        if status.is_some() {
                            continue;
                        }
                        debug!("{}: stopping process {pid}", self.prefix);
                        if request_stop(pid) {
                            kill_deadline = FutureExt::fuse(Timer::after(self.stop_grace));
                        } else {
                            force_kill = true;
                            break;
                        }
                    }
                    _ = kill_deadline => {
                        warn!("{}: process {pid} did not stop in time", self.prefix);
                        force_kill = true;
                        break;
                    }
                    _ = drain_deadline => break,
                }
            }
        }

        if force_kill {
            if let Err(err) = child.kill() {
                warn!("{}: couldn't kill process {pid}: {err}", self.prefix);
            }
        }
        let status = match status {
            Some(status) => status,
            None => child.status().await,
        };
        if !reading.is_terminated() {
            let _ = crate::internal::timeout(self.stop_grace, reading).await;
        }

        let exit = to_exit(status);
        debug!("{}: process {pid} completed: {exit:?}", self.prefix);
        self.progress.complete(exit);
    }

    async fn forward(&self, mut lines: Lines) {
        while let Some((source, line)) = lines.next().await {
            match line {
                Ok(line) => {
                    debug!("{}: {line}", self.prefix);
                    self.progress.print(&line);
                    if source == Source::Stdout && line.trim_end() == self.ready_marker {
                        self.progress.mark_ready();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!("{}: skipping output line: {err}", self.prefix);
                }
                Err(err) => {
                    warn!("{}: couldn't read output: {err}", self.prefix);
                    return;
                }
            }
        }
    }
}

fn to_exit(status: io::Result<ExitStatus>) -> Exit {
    match status {
        Ok(status) => match status.code() {
            Some(code) => Exit::Code(code),
            None => Exit::Abnormal(status.to_string()),
        },
        Err(err) => Exit::Abnormal(format!("couldn't wait for the process: {err}")),
    }
}

/// Asks the process to exit. Returns `false` when it has to be killed right away.
#[cfg(unix)]
fn request_stop(pid: u32) -> bool {
    use nix::{
        sys::signal::{kill, Signal::SIGTERM},
        unistd::Pid,
    };

    match kill(Pid::from_raw(pid as _), SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            warn!("couldn't send SIGTERM to process {pid}: {err}");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_stop(_pid: u32) -> bool {
    false
}
