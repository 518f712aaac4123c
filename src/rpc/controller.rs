//! Remote face of the controller.
//!
//! [`ProcessControllerServer`] implements the `ProcessController` interface; every successful
//! `start` hands out a `Process` capability served by [`ProcessServer`], bound to one supervised
//! process.

use std::sync::Arc;

use capnp::capability::Rc;

use super::controller_capnp::{process, process_controller};
use crate::{
    environment::{HostEnvironment, HostResolver},
    process::{timeout_from_millis, Launcher, ProcessId, ProcessSupervisor},
};

/// The `ProcessController` service.
pub struct ProcessControllerServer<L: Launcher, E> {
    supervisor: Arc<ProcessSupervisor<L>>,
    hosts: Arc<HostResolver<E>>,
}

impl<L: Launcher, E> ProcessControllerServer<L, E> {
    pub fn new(supervisor: Arc<ProcessSupervisor<L>>, hosts: Arc<HostResolver<E>>) -> Self {
        Self { supervisor, hosts }
    }
}

impl<L, E> process_controller::Server for ProcessControllerServer<L, E>
where
    L: Launcher + 'static,
    E: HostEnvironment + 'static,
{
    async fn start(
        self: Rc<Self>,
        params: process_controller::StartParams,
        mut results: process_controller::StartResults,
    ) -> Result<(), capnp::Error> {
        let params = params.get()?;
        let testsuite = params.get_testsuite()?.to_str()?;
        let exe = params.get_exe()?.to_str()?;
        let args = params
            .get_args()?
            .iter()
            .map(|arg| Ok(arg?.to_str()?.to_owned()))
            .collect::<Result<Vec<_>, capnp::Error>>()?;

        let id = self.supervisor.start(testsuite, exe, args)?;

        let process: process::Client = capnp_rpc::new_client(ProcessServer {
            supervisor: Arc::clone(&self.supervisor),
            id,
        });
        results.get().set_process(process);
        Ok(())
    }

    async fn get_host(
        self: Rc<Self>,
        params: process_controller::GetHostParams,
        mut results: process_controller::GetHostResults,
    ) -> Result<(), capnp::Error> {
        let params = params.get()?;
        let protocol = params.get_protocol()?.to_str()?;
        let host = self.hosts.get_host(protocol, params.get_ipv6());
        results.get().set_host(host.as_str());
        Ok(())
    }
}

/// The `Process` object of one supervised process.
///
/// The capability outlives the process record: once terminated, every call fails with an invalid
/// handle error.
pub struct ProcessServer<L: Launcher> {
    supervisor: Arc<ProcessSupervisor<L>>,
    id: ProcessId,
}

impl<L> process::Server for ProcessServer<L>
where
    L: Launcher + 'static,
{
    async fn wait_ready(
        self: Rc<Self>,
        params: process::WaitReadyParams,
        _results: process::WaitReadyResults,
    ) -> Result<(), capnp::Error> {
        let timeout = timeout_from_millis(params.get()?.get_timeout());
        self.supervisor.wait_ready(self.id, timeout).await?;
        Ok(())
    }

    async fn wait_success(
        self: Rc<Self>,
        params: process::WaitSuccessParams,
        mut results: process::WaitSuccessResults,
    ) -> Result<(), capnp::Error> {
        let timeout = timeout_from_millis(params.get()?.get_timeout());
        let status = self.supervisor.wait_success(self.id, timeout).await?;
        results.get().set_status(status);
        Ok(())
    }

    async fn terminate(
        self: Rc<Self>,
        _params: process::TerminateParams,
        mut results: process::TerminateResults,
    ) -> Result<(), capnp::Error> {
        let output = self.supervisor.terminate(self.id)?;
        results.get().set_output(output.as_str());
        Ok(())
    }
}
