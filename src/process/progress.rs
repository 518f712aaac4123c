//! Progress latch shared between a running process and the callers waiting on it.
//!
//! The process side reports readiness, completion and output lines; the waiting side polls for
//! readiness or completion with a timeout. Readiness and completion are one-shot transitions:
//! once observed they stay observed.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
    time::Duration,
};

use crate::internal::timeout;

/// How a process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exit {
    /// The process exited with a status code.
    Code(i32),
    /// The process ended without a status code, e.g. killed by a signal.
    Abnormal(String),
}

/// Outcome of a bounded wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wait<T> {
    Done(T),
    Failed,
    TimedOut,
}

#[derive(Default)]
struct State {
    ready: bool,
    exit: Option<Exit>,
    output: String,
    // One slot per pending waiter, released when the waiter is dropped
    wakers: HashMap<u64, Waker>,
    next_waiter: u64,
}

impl State {
    fn wake_all(&mut self) {
        for (_, waker) in self.wakers.drain() {
            waker.wake();
        }
    }
}

/// The latch.
///
/// Clone it to share it between the reporting and the waiting side.
#[derive(Clone, Default)]
pub struct Progress {
    state: Arc<Mutex<State>>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals that the process is ready to serve requests.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.ready {
            state.ready = true;
            state.wake_all();
        }
    }

    /// Records the completion of the process. Only the first completion counts.
    pub fn complete(&self, exit: Exit) {
        let mut state = self.state.lock().unwrap();
        if state.exit.is_none() {
            state.exit = Some(exit);
            state.wake_all();
        }
    }

    /// Appends a line of output.
    pub fn print(&self, line: &str) {
        let mut state = self.state.lock().unwrap();
        state.output.push_str(line);
        state.output.push('\n');
    }

    /// Everything printed so far.
    pub fn output(&self) -> String {
        self.state.lock().unwrap().output.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    pub fn exit(&self) -> Option<Exit> {
        self.state.lock().unwrap().exit.clone()
    }

    /// Waits at most `duration` for the process to become ready.
    ///
    /// A process completing successfully without announcing readiness counts as ready, a process
    /// completing otherwise counts as failed.
    pub async fn wait_ready(&self, duration: Duration) -> Wait<()> {
        let settled = self.until(|state| {
            if state.ready {
                return Some(Wait::Done(()));
            }
            match state.exit {
                Some(Exit::Code(0)) => Some(Wait::Done(())),
                Some(_) => Some(Wait::Failed),
                None => None,
            }
        });
        timeout(duration, settled).await.unwrap_or(Wait::TimedOut)
    }

    /// Waits at most `duration` for the process to complete and returns its status code.
    pub async fn wait_exit(&self, duration: Duration) -> Wait<i32> {
        let settled = self.until(|state| match state.exit {
            Some(Exit::Code(code)) => Some(Wait::Done(code)),
            Some(Exit::Abnormal(_)) => Some(Wait::Failed),
            None => None,
        });
        timeout(duration, settled).await.unwrap_or(Wait::TimedOut)
    }

    fn until<T, F>(&self, check: F) -> Until<F>
    where
        F: Fn(&State) -> Option<T> + Unpin,
    {
        Until {
            state: Arc::clone(&self.state),
            check,
            slot: None,
        }
    }
}

struct Until<F> {
    state: Arc<Mutex<State>>,
    check: F,
    slot: Option<u64>,
}

impl<T, F> Future for Until<F>
where
    F: Fn(&State) -> Option<T> + Unpin,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.state.lock().unwrap();

        if let Some(value) = (this.check)(&state) {
            return Poll::Ready(value);
        }

        let slot = *this.slot.get_or_insert_with(|| {
            let slot = state.next_waiter;
            state.next_waiter += 1;
            slot
        });
        match state.wakers.get_mut(&slot) {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            Some(waker) => waker.clone_from(cx.waker()),
            None => {
                state.wakers.insert(slot, cx.waker().clone());
            }
        }

        Poll::Pending
    }
}

impl<F> Drop for Until<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            if let Ok(mut state) = self.state.lock() {
                state.wakers.remove(&slot);
            }
        }
    }
}
