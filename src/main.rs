use std::{future, sync::Arc};

use async_net::TcpListener;
use async_signal::{Signal, Signals};
use clap::Parser;
use futures::{FutureExt, StreamExt};
use testctl::{
    config::ControllerConfig,
    environment::{HostResolver, SystemEnvironment},
    listen,
    process::{child::ChildLauncher, ProcessSupervisor},
    registration::{capnp::CapnpRegistryConnector, RegistrationManager},
    rpc::{controller::ProcessControllerServer, controller_capnp::process_controller},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::parse();

    let hosts = HostResolver::new(SystemEnvironment::new(config.emulated))
        .with_overrides(config.host_ipv4, config.host_ipv6);
    let emulated = hosts.is_emulated();
    let registry = config.registry_endpoint(emulated);

    let launcher = ChildLauncher::new(
        config.tests_dir.clone(),
        config.ready_marker.clone(),
        config.stop_grace(),
    );
    let supervisor = Arc::new(ProcessSupervisor::new(launcher));
    let controller: process_controller::Client =
        capnp_rpc::new_client(ProcessControllerServer::new(supervisor, Arc::new(hosts)));

    info!(
        adapter_id = %Uuid::new_v4(),
        emulated,
        %registry,
        tests_dir = %config.tests_dir.display(),
        "process controller starting"
    );

    let mut exec = futures::executor::LocalPool::new();
    let spawner = exec.spawner();

    exec.run_until(async {
        let listener = TcpListener::bind(config.listen).await?;

        let connector = CapnpRegistryConnector::new(registry, controller.clone(), spawner.clone())
            .with_connect_timeout(config.connect_timeout())
            .with_heartbeat(config.heartbeat());
        let manager = RegistrationManager::new(connector, config.backoff());

        // Drivers may still connect directly once the registry turned the controller down
        let registration = async {
            let err = manager.run().await;
            error!("no longer registering with {registry}: {err}");
            future::pending::<()>().await
        };

        let serving = listen::serve(listener, controller.clone().client.hook, &spawner);

        futures::select! {
            () = registration.fuse() => {}
            res = serving.fuse() => res?,
            res = shutdown_signal().fuse() => res?,
        }

        info!("process controller stopping");

        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}

async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    let mut signals = Signals::new([Signal::Int, Signal::Term])?;
    #[cfg(not(unix))]
    let mut signals = Signals::new([Signal::Int])?;

    if let Some(signal) = signals.next().await {
        info!("received {:?}", signal?);
    }
    Ok(())
}
