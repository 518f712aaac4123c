//! Registration over Cap'n Proto RPC.
//!
//! The controller connects to the registry over TCP and offers its `ProcessController` as the
//! bootstrap capability of that connection, so that the registry can call back into the
//! controller without opening a connection of its own. The connection is kept busy with
//! heartbeats and never closed for inactivity.

use std::{net::SocketAddr, pin::pin, time::Duration};

use async_io::Timer;
use async_net::TcpStream;
use capnp_rpc::{rpc_twoparty_capnp::Side, Disconnector};
use futures::{
    channel::oneshot, executor::LocalSpawner, task::LocalSpawnExt, AsyncReadExt, FutureExt,
};
use tracing::{debug, warn};

use super::{RegistryConnector, RegistrySession};
use crate::{
    error::RegistrationError,
    internal::timeout,
    rpc::{
        client_connection,
        controller_capnp::{process_controller, process_controller_registry},
    },
};

/// Default timeout of the TCP connection and of the calls made to the registry.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default interval between two heartbeats.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Connects to a registry at a fixed address.
pub struct CapnpRegistryConnector {
    endpoint: SocketAddr,
    controller: process_controller::Client,
    spawner: LocalSpawner,
    connect_timeout: Duration,
    heartbeat: Duration,
}

impl CapnpRegistryConnector {
    /// The RPC connections are run on `spawner`.
    pub fn new(
        endpoint: SocketAddr,
        controller: process_controller::Client,
        spawner: LocalSpawner,
    ) -> Self {
        Self {
            endpoint,
            controller,
            spawner,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

impl RegistryConnector for CapnpRegistryConnector {
    type Session = CapnpRegistrySession;

    async fn connect(&self) -> Result<Self::Session, RegistrationError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.endpoint))
            .await
            .ok_or_else(|| {
                RegistrationError::Connectivity(format!(
                    "timed out connecting to {}",
                    self.endpoint
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!("connected to registry {}", self.endpoint);

        let (input, output) = stream.split();
        let (rpc_system, registry): (_, process_controller_registry::Client) = client_connection(
            input,
            output,
            Some(self.controller.clone().client.hook),
        );
        let disconnector = rpc_system.get_disconnector();

        let (closed_sender, closed) = oneshot::channel();
        let (abandon, abandoned) = oneshot::channel::<()>();
        self.spawner
            .spawn_local(async move {
                let mut rpc_system = pin!(rpc_system.fuse());
                futures::select! {
                    res = rpc_system => {
                        if let Err(err) = res {
                            debug!("registry connection interrupted: {err}");
                        }
                    }
                    // Dropping the RPC system closes the socket
                    _ = abandoned.fuse() => debug!("registry connection abandoned"),
                }
                let _ = closed_sender.send(());
            })
            .map_err(|err| {
                RegistrationError::Application(capnp::Error::failed(format!(
                    "couldn't run the registry connection: {err}"
                )))
            })?;

        Ok(CapnpRegistrySession {
            registry,
            controller: self.controller.clone(),
            disconnector,
            closed,
            _abandon: abandon,
            call_timeout: self.connect_timeout,
            heartbeat: self.heartbeat,
        })
    }
}

/// Connection to the registry, alive until [`closed`](RegistrySession::closed) resolves or the
/// session is dropped.
pub struct CapnpRegistrySession {
    registry: process_controller_registry::Client,
    controller: process_controller::Client,
    disconnector: Disconnector<Side>,
    closed: oneshot::Receiver<()>,
    _abandon: oneshot::Sender<()>,
    call_timeout: Duration,
    heartbeat: Duration,
}

impl RegistrySession for CapnpRegistrySession {
    async fn probe(&self) -> Result<(), RegistrationError> {
        ping(&self.registry, self.call_timeout).await
    }

    async fn announce(&self) -> Result<(), RegistrationError> {
        let mut req = self.registry.set_process_controller_request();
        req.get().set_controller(self.controller.clone());
        timeout(self.call_timeout, req.send().promise)
            .await
            .ok_or_else(|| RegistrationError::Connectivity("registry call timed out".to_owned()))??;
        Ok(())
    }

    async fn closed(self) {
        let Self {
            registry,
            disconnector,
            closed,
            call_timeout,
            heartbeat,
            _abandon,
            ..
        } = self;
        let mut closed = closed.fuse();

        loop {
            let mut tick = Timer::after(heartbeat).fuse();
            futures::select! {
                _ = closed => return,
                _ = tick => {
                    if let Err(err) = ping(&registry, call_timeout).await {
                        warn!("registry heartbeat failed: {err}");
                        if let Err(err) = disconnector.await {
                            debug!("registry disconnection: {err}");
                        }
                        return;
                    }
                }
            }
        }
    }
}

async fn ping(
    registry: &process_controller_registry::Client,
    call_timeout: Duration,
) -> Result<(), RegistrationError> {
    timeout(call_timeout, registry.ping_request().send().promise)
        .await
        .ok_or_else(|| RegistrationError::Connectivity("registry ping timed out".to_owned()))??;
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
    };

    use async_net::TcpListener;
    use capnp::capability::Rc as CapRc;
    use futures::{
        channel::mpsc,
        future::{self, FusedFuture},
        StreamExt,
    };

    use super::*;
    use crate::{
        registration::{RegistrationManager, RegistrationState},
        rpc::{controller::tests::fake_controller, run_server_connection},
    };

    enum Announcement {
        Accepted(process_controller::Client),
        Rejected,
    }

    /// Registry handing the announcements over to the test.
    struct FakeRegistry {
        announced: mpsc::UnboundedSender<Announcement>,
        // Number of announcements still to reject
        rejections: Cell<usize>,
        // Never answers pings
        silent: bool,
    }

    fn fake_registry(
        rejections: usize,
        silent: bool,
    ) -> (
        process_controller_registry::Client,
        mpsc::UnboundedReceiver<Announcement>,
    ) {
        let (announced, announcements) = mpsc::unbounded();
        let registry = capnp_rpc::new_client(FakeRegistry {
            announced,
            rejections: Cell::new(rejections),
            silent,
        });
        (registry, announcements)
    }

    impl process_controller_registry::Server for FakeRegistry {
        async fn ping(
            self: CapRc<Self>,
            _params: process_controller_registry::PingParams,
            _results: process_controller_registry::PingResults,
        ) -> Result<(), capnp::Error> {
            if self.silent {
                future::pending::<()>().await;
            }
            Ok(())
        }

        async fn set_process_controller(
            self: CapRc<Self>,
            params: process_controller_registry::SetProcessControllerParams,
            _results: process_controller_registry::SetProcessControllerResults,
        ) -> Result<(), capnp::Error> {
            let rejections = self.rejections.get();
            if rejections > 0 {
                self.rejections.set(rejections - 1);
                let _ = self.announced.unbounded_send(Announcement::Rejected);
                return Err(capnp::Error::failed("controller rejected".to_owned()));
            }
            let controller = params.get()?.get_controller()?;
            let _ = self
                .announced
                .unbounded_send(Announcement::Accepted(controller));
            Ok(())
        }
    }

    /// Connections accepted by [`serve_registry`].
    #[derive(Default)]
    struct Connections {
        accepted: Cell<usize>,
        open: Cell<usize>,
        kicks: RefCell<Vec<oneshot::Sender<()>>>,
    }

    impl Connections {
        /// Drops the last accepted connection.
        fn kick(&self) {
            let kick = self.kicks.borrow_mut().pop().unwrap();
            kick.send(()).unwrap();
        }
    }

    /// Serves the registry on `listener`.
    async fn serve_registry(
        listener: TcpListener,
        registry: process_controller_registry::Client,
        connections: Rc<Connections>,
        spawner: LocalSpawner,
    ) {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                return;
            };
            let (input, output) = stream.split();
            let (kick, kicked) = oneshot::channel::<()>();
            connections.kicks.borrow_mut().push(kick);
            connections.accepted.set(connections.accepted.get() + 1);
            connections.open.set(connections.open.get() + 1);
            let connections = Rc::clone(&connections);
            let hook = registry.clone().client.hook;
            spawner
                .spawn_local(async move {
                    let connection = pin!(run_server_connection(input, output, hook).fuse());
                    futures::select! {
                        () = connection => {}
                        _ = kicked.fuse() => {}
                    }
                    connections.open.set(connections.open.get() - 1);
                })
                .unwrap();
        }
    }

    /// Polls `run` for `duration`.
    async fn keep_running(
        mut run: &mut (impl FusedFuture<Output = RegistrationError> + Unpin),
        duration: Duration,
    ) {
        let mut pause = FutureExt::fuse(Timer::after(duration));
        futures::select! {
            err = run => panic!("registration stopped: {err}"),
            _ = pause => {}
        }
    }

    async fn next_controller(
        mut run: &mut (impl FusedFuture<Output = RegistrationError> + Unpin),
        announcements: &mut mpsc::UnboundedReceiver<Announcement>,
    ) -> process_controller::Client {
        futures::select! {
            err = run => panic!("registration stopped: {err}"),
            announcement = announcements.next() => match announcement.unwrap() {
                Announcement::Accepted(controller) => controller,
                Announcement::Rejected => panic!("controller rejected"),
            },
        }
    }

    #[test]
    fn test_register_and_reregister_after_disconnect() {
        let mut exec = futures::executor::LocalPool::new();
        let spawner = exec.spawner();

        let res = exec.run_until(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let endpoint = listener.local_addr()?;

            let (registry, mut announcements) = fake_registry(0, false);
            let connections = Rc::new(Connections::default());
            spawner.spawn_local(serve_registry(
                listener,
                registry,
                connections.clone(),
                spawner.clone(),
            ))?;

            let (controller, _launcher) = fake_controller(true);
            let manager = RegistrationManager::new(
                CapnpRegistryConnector::new(endpoint, controller, spawner.clone())
                    .with_heartbeat(Duration::from_millis(100)),
                Duration::from_millis(50),
            );
            let mut run = pin!(manager.run().fuse());

            for registrations in 1..=2 {
                let controller = next_controller(&mut run, &mut announcements).await;

                // The registry calls the controller back over the same connection
                let mut req = controller.get_host_request();
                req.get().set_protocol("tcp");
                let reply = futures::select! {
                    err = run => panic!("registration stopped: {err}"),
                    reply = req.send().promise.fuse() => reply?,
                };
                assert_eq!(reply.get()?.get_host()?.to_str()?, "127.0.0.1");
                assert_eq!(manager.state(), RegistrationState::Registered);
                assert_eq!(manager.registrations(), registrations);
                drop(controller);

                // The registry goes away, the controller comes back
                connections.kick();
            }

            Ok::<_, Box<dyn std::error::Error>>(())
        });

        res.unwrap();
    }

    #[test]
    fn test_unreachable_registry_is_a_connectivity_error() {
        let mut exec = futures::executor::LocalPool::new();
        let spawner = exec.spawner();

        let res = exec.run_until(async move {
            // Grab a free port and release it
            let endpoint = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;

            let (controller, _launcher) = fake_controller(false);
            let connector = CapnpRegistryConnector::new(endpoint, controller, spawner)
                .with_connect_timeout(Duration::from_millis(500));
            let err = connector.connect().await.err().unwrap();
            assert!(err.is_connectivity(), "{err}");

            Ok::<_, Box<dyn std::error::Error>>(())
        });

        res.unwrap();
    }

    #[test]
    fn test_rejected_announcement_is_retried_after_disconnect() {
        let mut exec = futures::executor::LocalPool::new();
        let spawner = exec.spawner();

        let res = exec.run_until(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let endpoint = listener.local_addr()?;

            let (registry, mut announcements) = fake_registry(1, false);
            let connections = Rc::new(Connections::default());
            spawner.spawn_local(serve_registry(
                listener,
                registry,
                connections.clone(),
                spawner.clone(),
            ))?;

            let (controller, _launcher) = fake_controller(false);
            let manager = RegistrationManager::new(
                CapnpRegistryConnector::new(endpoint, controller, spawner.clone())
                    .with_heartbeat(Duration::from_millis(50)),
                Duration::from_millis(20),
            );
            let mut run = pin!(manager.run().fuse());

            let announcement = futures::select! {
                err = run => panic!("registration stopped: {err}"),
                announcement = announcements.next() => announcement.unwrap(),
            };
            assert!(matches!(announcement, Announcement::Rejected));

            // The connection survives the rejection and its heartbeats
            keep_running(&mut run, Duration::from_millis(200)).await;
            assert_eq!(manager.attempts(), 1);
            assert_eq!(manager.registrations(), 0);
            assert_eq!(manager.state(), RegistrationState::Unregistered);
            assert_eq!(connections.open.get(), 1);

            connections.kick();
            let _controller = next_controller(&mut run, &mut announcements).await;
            assert_eq!(manager.attempts(), 2);
            assert_eq!(connections.accepted.get(), 2);

            Ok::<_, Box<dyn std::error::Error>>(())
        });

        res.unwrap();
    }

    #[test]
    fn test_failed_attempts_close_their_connection() {
        let mut exec = futures::executor::LocalPool::new();
        let spawner = exec.spawner();

        let res = exec.run_until(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let endpoint = listener.local_addr()?;

            let (registry, _announcements) = fake_registry(0, true);
            let connections = Rc::new(Connections::default());
            spawner.spawn_local(serve_registry(
                listener,
                registry,
                connections.clone(),
                spawner.clone(),
            ))?;

            let (controller, _launcher) = fake_controller(false);
            let manager = RegistrationManager::new(
                CapnpRegistryConnector::new(endpoint, controller, spawner.clone())
                    .with_connect_timeout(Duration::from_millis(50)),
                Duration::from_millis(10),
            );
            let mut run = pin!(manager.run().fuse());

            while manager.attempts() < 5 {
                keep_running(&mut run, Duration::from_millis(10)).await;
            }
            // Give the registry side time to see the closed connections
            keep_running(&mut run, Duration::from_millis(100)).await;

            assert!(connections.accepted.get() >= 4);
            // At most the attempt in progress
            assert!(
                connections.open.get() <= 1,
                "{} connections left open",
                connections.open.get()
            );

            Ok::<_, Box<dyn std::error::Error>>(())
        });

        res.unwrap();
    }
}
