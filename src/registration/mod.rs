//! Registration of the controller with the process controller registry.
//!
//! Test drivers find the controller through the registry, so the controller keeps itself
//! registered for as long as it runs:
//!
//! ```text
//! Unregistered --(probe ok, announce ok)--> Registered
//!      ^                                        |
//!      +------ backoff <--(disconnect)----------+
//!      +------ backoff <--(registry unreachable)
//! ```
//!
//! Connectivity failures are retried forever with a fixed backoff. A registry rejecting the
//! controller keeps the connection: the controller registers again once that connection closes.
//! A registry answering the probe with an error ends the loop, retrying would only hide a protocol
//! mismatch.

use std::{cell::Cell, future::Future, time::Duration};

use async_io::Timer;
use tracing::{debug, error, info, warn};

use crate::error::RegistrationError;

pub mod capnp;

/// Delay between two registration attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Opens connections to the registry.
pub trait RegistryConnector {
    type Session: RegistrySession;

    /// Connects to the registry.
    fn connect(&self) -> impl Future<Output = Result<Self::Session, RegistrationError>>;
}

/// A live connection to the registry.
///
/// Dropping the session closes the connection.
pub trait RegistrySession {
    /// Checks that the registry answers.
    fn probe(&self) -> impl Future<Output = Result<(), RegistrationError>>;

    /// Tells the registry how to reach this controller.
    fn announce(&self) -> impl Future<Output = Result<(), RegistrationError>>;

    /// Resolves once the connection is closed, by either side.
    fn closed(self) -> impl Future<Output = ()>;
}

enum Attempt<S> {
    Registered(S),
    Rejected(S, RegistrationError),
    Failed(RegistrationError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

/// Drives the registration loop.
pub struct RegistrationManager<C> {
    connector: C,
    backoff: Duration,
    state: Cell<RegistrationState>,
    attempts: Cell<u64>,
    registrations: Cell<u64>,
}

impl<C: RegistryConnector> RegistrationManager<C> {
    pub fn new(connector: C, backoff: Duration) -> Self {
        Self {
            connector,
            backoff,
            state: Cell::new(RegistrationState::Unregistered),
            attempts: Cell::new(0),
            registrations: Cell::new(0),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state.get()
    }

    /// Number of registration attempts so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.get()
    }

    /// Number of successful registrations so far.
    pub fn registrations(&self) -> u64 {
        self.registrations.get()
    }

    /// Keeps the controller registered.
    ///
    /// Only returns when the registry answers the probe with an error which is not a connectivity
    /// error.
    pub async fn run(&self) -> RegistrationError {
        let mut failures = 0u64;

        loop {
            self.attempts.set(self.attempts.get() + 1);

            match self.register().await {
                Attempt::Registered(session) => {
                    failures = 0;
                    self.state.set(RegistrationState::Registered);
                    self.registrations.set(self.registrations.get() + 1);
                    info!("registered with the process controller registry");

                    session.closed().await;

                    self.state.set(RegistrationState::Unregistered);
                    warn!("connection with the process controller registry closed");
                }
                Attempt::Rejected(session, err) => {
                    failures = 0;
                    error!("process controller registry rejected the controller: {err}");

                    session.closed().await;

                    warn!("connection with the process controller registry closed");
                }
                Attempt::Failed(err) if err.is_connectivity() => {
                    failures += 1;
                    if failures == 1 {
                        warn!("couldn't reach the process controller registry, retrying: {err}");
                    } else {
                        debug!("registration attempt {} failed: {err}", self.attempts());
                    }
                }
                Attempt::Failed(err) => {
                    error!("registration with the process controller registry failed: {err}");
                    return err;
                }
            }

            Timer::after(self.backoff).await;
        }
    }

    async fn register(&self) -> Attempt<C::Session> {
        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(err) => return Attempt::Failed(err),
        };
        if let Err(err) = session.probe().await {
            return Attempt::Failed(err);
        }
        match session.announce().await {
            Ok(()) => Attempt::Registered(session),
            Err(err) if err.is_connectivity() => Attempt::Failed(err),
            Err(err) => Attempt::Rejected(session, err),
        }
    }
}
